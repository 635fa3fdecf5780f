//! SteganoScan - Main Entry Point
//!
//! `analyze` checks a single image; `watch` runs the monitoring pipeline
//! in the foreground until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use steganoscan::engine::{
    AnalysisError, CandidateCallback, DirectoryWatcher, FileMonitor, LsbScanner, ScanDispatcher,
    ScanError, ScanStatus,
};
use steganoscan::logging::{default_log_directory, init_logging};
use steganoscan::{
    AlertSink, BroadcastSink, Config, DetectionResult, FanoutSink, LogSink, LsbAnalyzer,
};

#[derive(Parser, Debug)]
#[command(name = "steganoscan", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze one image and print whether it looks LSB-embedded
    Analyze {
        /// Image file (PNG, JPEG or WebP)
        image_path: PathBuf,

        /// Print the full detection result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Watch directories for new images until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory to watch; repeatable, replaces the configured list
    #[arg(long = "path")]
    paths: Vec<PathBuf>,

    /// Number of scan workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between watch directory re-validation (0 disables)
    #[arg(long)]
    revalidate_secs: Option<u64>,

    /// Also write rolling log files
    #[arg(long)]
    log_to_file: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Analyze { image_path, json } => run_analyze(image_path, json),
        Command::Watch(args) => match run_watch(args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Fatal: {:#}", e);
                eprintln!("Error: {:#}", e);
                ExitCode::FAILURE
            }
        },
    }
}

fn run_analyze(image_path: PathBuf, json: bool) -> ExitCode {
    let _guard = init_logging(None, "warn");

    let scanner = LsbScanner::new(LsbAnalyzer::new());
    let result = match scanner.try_scan(&image_path) {
        Ok(result) => result,
        Err(ScanError::Analysis(AnalysisError::InsufficientData { .. })) => {
            DetectionResult::clean(&image_path, ScanStatus::Inconclusive)
        }
        Err(e) => {
            eprintln!("Error analyzing image {}: {}", image_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&result) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error serializing result: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Stego Detected: {}", result.is_suspicious);
    }
    ExitCode::SUCCESS
}

fn run_watch(args: WatchArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if !args.paths.is_empty() {
        config.watch_paths = args.paths;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(secs) = args.revalidate_secs {
        config.revalidate_interval_secs = secs;
    }
    if args.log_to_file && config.log_dir.is_none() {
        config.log_dir = Some(default_log_directory());
    }
    config.validate()?;

    let _guard = init_logging(config.log_dir.as_deref(), "info");
    info!("SteganoScan Sentinel starting...");

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_service(config))
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    let alerts = BroadcastSink::new(256).suspicious_only();
    let mut alert_rx = alerts.subscribe();
    let sink: Arc<dyn AlertSink> = Arc::new(
        FanoutSink::new()
            .with(Arc::new(LogSink))
            .with(Arc::new(alerts)),
    );

    let dispatcher = Arc::new(
        ScanDispatcher::from_config(&config, sink).context("starting scan workers")?,
    );

    let submitter = Arc::clone(&dispatcher);
    let on_candidate: CandidateCallback = Arc::new(move |path| {
        // Rejections are already logged by the dispatcher
        let _ = submitter.submit(path);
    });

    let mut monitor = FileMonitor::new(config.watch_paths.clone(), on_candidate);
    monitor.start().context("initializing file watcher")?;

    let mut revalidate = (config.revalidate_interval_secs > 0).then(|| {
        tokio::time::interval(Duration::from_secs(config.revalidate_interval_secs))
    });

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Signal handler error: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            alert = alert_rx.recv() => match alert {
                Ok(result) => println!("ALERT: Steganography detected in {}", result.display_name()),
                Err(RecvError::Lagged(n)) => warn!("Alert consumer lagged, {} alerts skipped", n),
                Err(RecvError::Closed) => break,
            },
            _ = next_tick(&mut revalidate) => {
                let added = monitor.revalidate();
                if added > 0 {
                    info!("Re-validation added {} watch directories", added);
                }
            }
        }
    }

    monitor.stop();
    drop(monitor);

    // The watcher backend may still hold the submitter; queued scans drain
    // and the workers are joined regardless
    dispatcher.shutdown();

    info!("SteganoScan Sentinel stopped");
    Ok(())
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
