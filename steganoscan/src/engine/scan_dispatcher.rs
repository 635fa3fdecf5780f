//! Scan Dispatcher
//!
//! Owns a fixed pool of worker threads fed by a bounded queue. Paths are
//! de-duplicated while in flight, every accepted submission yields exactly
//! one [`DetectionResult`], and a full queue drops the submission instead of
//! stalling the caller (usually a filesystem event callback).

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::alert::AlertSink;
use crate::engine::lsb_analyzer::{AnalysisError, LsbAnalyzer};
use crate::Config;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Read error on {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Reasons a submission was not accepted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Already in flight: {0}")]
    AlreadyInFlight(PathBuf),
    #[error("Scan queue full, dropped: {0}")]
    QueueFull(PathBuf),
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to spawn scan worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// How a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Chi-square test ran to completion
    Analyzed,
    /// Too few qualifying intensity pairs
    Inconclusive,
    FileNotFound,
    DecodeFailed,
    ReadFailed,
    /// Histogram decoded but the chi-square distribution could not be evaluated
    StatisticsFailed,
}

/// Result of scanning one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub path: PathBuf,
    pub is_suspicious: bool,
    /// `None` when no test was run
    pub p_value: Option<f64>,
    pub chi_square: Option<f64>,
    pub status: ScanStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DetectionResult {
    /// A non-suspicious result for a scan that did not reach a verdict
    pub fn clean(path: &Path, status: ScanStatus) -> Self {
        Self {
            path: path.to_path_buf(),
            is_suspicious: false,
            p_value: None,
            chi_square: None,
            status,
            timestamp: chrono::Utc::now(),
        }
    }

    /// File name for display, falling back to the full path
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }
}

/// Turns a path into a detection result; never fails
pub trait ImageScanner: Send + Sync {
    fn scan(&self, path: &Path) -> DetectionResult;
}

/// Reads the file and runs LSB pair analysis on it
#[derive(Debug, Clone, Default)]
pub struct LsbScanner {
    analyzer: LsbAnalyzer,
}

impl LsbScanner {
    pub fn new(analyzer: LsbAnalyzer) -> Self {
        Self { analyzer }
    }

    /// Read and analyze, surfacing the failure reason
    pub fn try_scan(&self, path: &Path) -> Result<DetectionResult, ScanError> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScanError::FileNotFound(path.to_path_buf()),
            _ => ScanError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        let verdict = self.analyzer.analyze(&bytes)?;

        Ok(DetectionResult {
            path: path.to_path_buf(),
            is_suspicious: verdict.is_suspicious,
            p_value: Some(verdict.p_value),
            chi_square: Some(verdict.chi_square),
            status: ScanStatus::Analyzed,
            timestamp: chrono::Utc::now(),
        })
    }
}

impl ImageScanner for LsbScanner {
    fn scan(&self, path: &Path) -> DetectionResult {
        match self.try_scan(path) {
            Ok(result) => result,
            Err(ScanError::Analysis(AnalysisError::InsufficientData { qualifying_pairs, .. })) => {
                debug!(
                    "Inconclusive scan of {} ({} qualifying pairs)",
                    path.display(),
                    qualifying_pairs
                );
                DetectionResult::clean(path, ScanStatus::Inconclusive)
            }
            Err(e) => {
                warn!("Error analyzing image {}: {}", path.display(), e);
                DetectionResult::clean(path, e.status())
            }
        }
    }
}

impl ScanError {
    /// Status recorded when a scan ends with this error
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanError::FileNotFound(_) => ScanStatus::FileNotFound,
            ScanError::Read { .. } => ScanStatus::ReadFailed,
            ScanError::Analysis(AnalysisError::InsufficientData { .. }) => ScanStatus::Inconclusive,
            ScanError::Analysis(AnalysisError::Statistics(_)) => ScanStatus::StatisticsFailed,
            ScanError::Analysis(AnalysisError::Decode(_)) => ScanStatus::DecodeFailed,
        }
    }
}

struct Shared {
    in_flight: Mutex<HashSet<PathBuf>>,
    queue: Mutex<Option<Sender<PathBuf>>>,
}

/// Bounded worker pool with in-flight de-duplication
pub struct ScanDispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ScanDispatcher {
    /// Spawn `worker_count` workers behind a queue of `queue_capacity`
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        scanner: Arc<dyn ImageScanner>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self, DispatchError> {
        if worker_count == 0 {
            return Err(DispatchError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if queue_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }

        let (tx, rx) = bounded::<PathBuf>(queue_capacity);
        let shared = Arc::new(Shared {
            in_flight: Mutex::new(HashSet::new()),
            queue: Mutex::new(Some(tx)),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_idx in 0..worker_count {
            let worker_rx = rx.clone();
            let worker_shared = Arc::clone(&shared);
            let worker_scanner = Arc::clone(&scanner);
            let worker_sink = Arc::clone(&sink);

            let spawned = thread::Builder::new()
                .name(format!("scan-worker-{worker_idx}"))
                .spawn(move || run_worker(worker_rx, worker_shared, worker_scanner, worker_sink));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Close the queue so already-spawned workers exit
                    shared.queue.lock().take();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(DispatchError::WorkerSpawn(e));
                }
            }
        }

        info!(
            "Scan dispatcher started with {} workers (queue capacity {})",
            worker_count, queue_capacity
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Build the production dispatcher: LSB scanner, sizes from config
    pub fn from_config(config: &Config, sink: Arc<dyn AlertSink>) -> Result<Self, DispatchError> {
        let scanner = Arc::new(LsbScanner::new(LsbAnalyzer::from_config(config)));
        Self::new(config.worker_count, config.queue_capacity, scanner, sink)
    }

    /// Queue a path for scanning without blocking
    pub fn submit(&self, path: impl Into<PathBuf>) -> Result<(), SubmitError> {
        let path = path.into();

        let mut in_flight = self.shared.in_flight.lock();
        if in_flight.contains(&path) {
            debug!("Skipping duplicate submission: {}", path.display());
            return Err(SubmitError::AlreadyInFlight(path));
        }

        let queue = self.shared.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(SubmitError::ShuttingDown);
        };

        match tx.try_send(path.clone()) {
            Ok(()) => {
                in_flight.insert(path);
                Ok(())
            }
            Err(TrySendError::Full(path)) => {
                warn!("Scan queue full, dropping {}", path.display());
                Err(SubmitError::QueueFull(path))
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShuttingDown),
        }
    }

    /// Paths currently queued or being scanned
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.shared.in_flight.lock().contains(path)
    }

    /// Stop accepting work; queued paths are still scanned
    pub fn close(&self) {
        if self.shared.queue.lock().take().is_some() {
            info!("Draining scan dispatcher...");
        }
    }

    /// Close the queue, let workers drain it and join them
    ///
    /// Callable through a shared handle; later calls return immediately.
    pub fn shutdown(&self) {
        self.close();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Scan worker panicked");
            }
        }
    }
}

impl Drop for ScanDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    rx: Receiver<PathBuf>,
    shared: Arc<Shared>,
    scanner: Arc<dyn ImageScanner>,
    sink: Arc<dyn AlertSink>,
) {
    for path in rx.iter() {
        let result = match catch_unwind(AssertUnwindSafe(|| scanner.scan(&path))) {
            Ok(result) => result,
            Err(_) => {
                error!("Scan panicked on {}, treating as undecodable", path.display());
                DetectionResult::clean(&path, ScanStatus::DecodeFailed)
            }
        };
        shared.in_flight.lock().remove(&path);
        sink.deliver(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, RecvTimeoutError};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// Sink that forwards every result to a channel
    struct ChannelSink(Sender<DetectionResult>);

    impl AlertSink for ChannelSink {
        fn deliver(&self, result: DetectionResult) {
            let _ = self.0.send(result);
        }
    }

    /// Scanner that blocks until the test releases it
    struct GatedScanner {
        gate: Receiver<()>,
        started: Sender<PathBuf>,
    }

    impl ImageScanner for GatedScanner {
        fn scan(&self, path: &Path) -> DetectionResult {
            let _ = self.started.send(path.to_path_buf());
            let _ = self.gate.recv();
            DetectionResult::clean(path, ScanStatus::Analyzed)
        }
    }

    struct InstantScanner;

    /// Scanner that panics on one specific file name
    struct PanickingScanner;

    impl ImageScanner for PanickingScanner {
        fn scan(&self, path: &Path) -> DetectionResult {
            if path.ends_with("hostile.png") {
                panic!("decoder blew up");
            }
            DetectionResult::clean(path, ScanStatus::Analyzed)
        }
    }

    impl ImageScanner for InstantScanner {
        fn scan(&self, path: &Path) -> DetectionResult {
            DetectionResult::clean(path, ScanStatus::Analyzed)
        }
    }

    fn channel_sink() -> (Arc<dyn AlertSink>, Receiver<DetectionResult>) {
        let (tx, rx) = unbounded();
        (Arc::new(ChannelSink(tx)), rx)
    }

    #[test]
    fn test_duplicate_submission_yields_one_result() {
        let (gate_tx, gate_rx) = unbounded();
        let (started_tx, started_rx) = unbounded();
        let (sink, results) = channel_sink();
        let scanner = Arc::new(GatedScanner {
            gate: gate_rx,
            started: started_tx,
        });
        let dispatcher = ScanDispatcher::new(2, 8, scanner, sink).unwrap();

        dispatcher.submit("/tmp/a.png").unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            dispatcher.submit("/tmp/a.png"),
            Err(SubmitError::AlreadyInFlight(PathBuf::from("/tmp/a.png")))
        );
        assert_eq!(dispatcher.in_flight_count(), 1);

        gate_tx.send(()).unwrap();
        let result = results.recv_timeout(WAIT).unwrap();
        assert_eq!(result.path, PathBuf::from("/tmp/a.png"));

        dispatcher.shutdown();
        assert!(results.try_recv().is_err());
    }

    #[test]
    fn test_path_can_be_resubmitted_after_completion() {
        let (sink, results) = channel_sink();
        let dispatcher = ScanDispatcher::new(1, 4, Arc::new(InstantScanner), sink).unwrap();

        dispatcher.submit("/tmp/b.png").unwrap();
        results.recv_timeout(WAIT).unwrap();
        // Removal from the in-flight set happens before delivery
        assert!(!dispatcher.is_in_flight(Path::new("/tmp/b.png")));
        dispatcher.submit("/tmp/b.png").unwrap();
        results.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_all_paths_complete_with_fewer_workers() {
        let (sink, results) = channel_sink();
        let dispatcher = ScanDispatcher::new(3, 64, Arc::new(InstantScanner), sink).unwrap();

        for i in 0..40 {
            dispatcher.submit(format!("/tmp/img-{i}.png")).unwrap();
        }
        dispatcher.shutdown();

        let mut seen: HashSet<PathBuf> = results.try_iter().map(|r| r.path).collect();
        assert_eq!(seen.len(), 40);
        assert!(seen.remove(Path::new("/tmp/img-39.png")));
    }

    #[test]
    fn test_full_queue_drops_submission() {
        let (gate_tx, gate_rx) = unbounded();
        let (started_tx, started_rx) = unbounded();
        let (sink, results) = channel_sink();
        let scanner = Arc::new(GatedScanner {
            gate: gate_rx,
            started: started_tx,
        });
        let dispatcher = ScanDispatcher::new(1, 1, scanner, sink).unwrap();

        dispatcher.submit("/tmp/busy.png").unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        dispatcher.submit("/tmp/queued.png").unwrap();
        assert_eq!(
            dispatcher.submit("/tmp/dropped.png"),
            Err(SubmitError::QueueFull(PathBuf::from("/tmp/dropped.png")))
        );
        assert!(!dispatcher.is_in_flight(Path::new("/tmp/dropped.png")));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        dispatcher.shutdown();

        let paths: Vec<PathBuf> = results.try_iter().map(|r| r.path).collect();
        assert_eq!(paths.len(), 2);
        assert!(!paths.contains(&PathBuf::from("/tmp/dropped.png")));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let (sink, _results) = channel_sink();
        let err = ScanDispatcher::new(0, 4, Arc::new(InstantScanner), sink).err();
        assert!(matches!(err, Some(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_file_is_clean() {
        let scanner = LsbScanner::default();
        let result = scanner.scan(Path::new("/nonexistent/steganoscan/photo.png"));
        assert!(!result.is_suspicious);
        assert_eq!(result.status, ScanStatus::FileNotFound);
        assert_eq!(result.p_value, None);
    }

    #[test]
    fn test_undecodable_file_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.png");
        std::fs::write(&path, b"not a png at all").unwrap();

        let result = LsbScanner::default().scan(&path);
        assert!(!result.is_suspicious);
        assert_eq!(result.status, ScanStatus::DecodeFailed);
    }

    #[test]
    fn test_error_status_mapping() {
        let stats = ScanError::from(AnalysisError::Statistics("degenerate".to_string()));
        assert_eq!(stats.status(), ScanStatus::StatisticsFailed);
        let decode = ScanError::from(AnalysisError::Decode("truncated".to_string()));
        assert_eq!(decode.status(), ScanStatus::DecodeFailed);
        let thin = ScanError::from(AnalysisError::InsufficientData {
            qualifying_pairs: 2,
            required: 5,
        });
        assert_eq!(thin.status(), ScanStatus::Inconclusive);
        assert_eq!(
            ScanError::FileNotFound(PathBuf::from("/tmp/x.png")).status(),
            ScanStatus::FileNotFound
        );
    }

    #[test]
    fn test_panicking_scan_is_contained() {
        let (sink, results) = channel_sink();
        let dispatcher = ScanDispatcher::new(1, 4, Arc::new(PanickingScanner), sink).unwrap();

        dispatcher.submit("/tmp/hostile.png").unwrap();
        let result = results.recv_timeout(WAIT).unwrap();
        assert_eq!(result.path, PathBuf::from("/tmp/hostile.png"));
        assert_eq!(result.status, ScanStatus::DecodeFailed);
        assert!(!result.is_suspicious);
        assert_eq!(dispatcher.in_flight_count(), 0);

        // Same worker keeps serving, and the path is accepted again
        dispatcher.submit("/tmp/hostile.png").unwrap();
        results.recv_timeout(WAIT).unwrap();
        dispatcher.submit("/tmp/good.png").unwrap();
        let good = results.recv_timeout(WAIT).unwrap();
        assert_eq!(good.status, ScanStatus::Analyzed);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_through_shared_handle_drains_queue() {
        let (gate_tx, gate_rx) = unbounded();
        let (started_tx, started_rx) = unbounded();
        let (sink, results) = channel_sink();
        let scanner = Arc::new(GatedScanner {
            gate: gate_rx,
            started: started_tx,
        });
        let dispatcher = Arc::new(ScanDispatcher::new(1, 8, scanner, sink).unwrap());
        let submitter = Arc::clone(&dispatcher);

        for i in 0..4 {
            submitter.submit(format!("/tmp/queued-{i}.png")).unwrap();
        }
        started_rx.recv_timeout(WAIT).unwrap();
        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }

        // Another owner still holds the dispatcher
        dispatcher.shutdown();
        assert_eq!(results.try_iter().count(), 4);
        assert_eq!(submitter.submit("/tmp/late.png"), Err(SubmitError::ShuttingDown));
        dispatcher.shutdown();
    }

    #[test]
    fn test_worker_survives_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"\xff\xd8 truncated").unwrap();

        let (sink, results) = channel_sink();
        let dispatcher = ScanDispatcher::new(1, 4, Arc::new(LsbScanner::default()), sink).unwrap();
        dispatcher.submit(&bad).unwrap();
        dispatcher.submit(dir.path().join("missing.webp")).unwrap();

        let first = results.recv_timeout(WAIT).unwrap();
        let second = results.recv_timeout(WAIT).unwrap();
        assert!(!first.is_suspicious && !second.is_suspicious);
        assert!(matches!(
            results.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        ));
    }
}
