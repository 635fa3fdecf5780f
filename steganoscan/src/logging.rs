//! Logging module for SteganoScan

use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize logging with tracing
///
/// Always logs to stderr. When `log_dir` is given, a daily-rolling file is
/// written as well and the returned guard must be kept alive for the
/// duration of the program. `RUST_LOG` overrides `default_level`.
pub fn init_logging(
    log_dir: Option<&Path>,
    default_level: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(log_dir) = log_dir.and_then(prepare_log_directory) else {
        tracing_subscriber::registry()
            .with(stderr_layer())
            .with(filter)
            .init();
        return None;
    };

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "steganoscan.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(stderr_layer())
        .with(filter)
        .init();

    Some(guard)
}

/// Generic over the subscriber so each stack gets its own layer
fn stderr_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
}

/// Platform default for `--log-dir` when the user asks for file logging
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("steganoscan")
        .join("logs")
}

fn prepare_log_directory(dir: &Path) -> Option<PathBuf> {
    match std::fs::create_dir_all(dir) {
        Ok(()) => Some(dir.to_path_buf()),
        Err(e) => {
            eprintln!("Cannot create log directory {}: {}", dir.display(), e);
            None
        }
    }
}
