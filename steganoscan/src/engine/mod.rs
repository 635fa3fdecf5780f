//! Core detection engine module

pub mod file_monitor;
pub mod lsb_analyzer;
pub mod scan_dispatcher;

pub use file_monitor::{
    is_candidate_image, CandidateCallback, DirectoryWatcher, FileMonitor, NullWatcher, WatchError,
    WatchTarget,
};
pub use lsb_analyzer::{AnalysisError, IntensityHistogram, LsbAnalyzer, LsbPairStatistic, LsbVerdict};
pub use scan_dispatcher::{
    DetectionResult, DispatchError, ImageScanner, LsbScanner, ScanDispatcher, ScanError,
    ScanStatus, SubmitError,
};
