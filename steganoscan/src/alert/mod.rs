//! Alert Delivery
//!
//! Detection results leave the core through an [`AlertSink`]. Sinks are
//! called from scan worker threads and must return promptly; anything slow
//! (UI popups, desktop notifications) belongs behind [`BroadcastSink`].

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::engine::DetectionResult;

pub const ALERT_TITLE: &str = "Steganography Detected!";

/// Consumer of detection results
pub trait AlertSink: Send + Sync {
    fn deliver(&self, result: DetectionResult);
}

/// Discards every result
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AlertSink for NullSink {
    fn deliver(&self, _result: DetectionResult) {}
}

/// Raises alerts through the tracing pipeline
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn deliver(&self, result: DetectionResult) {
        if result.is_suspicious {
            warn!(
                path = %result.path.display(),
                p_value = result.p_value.unwrap_or_default(),
                "{}: Suspicious patterns found in {}",
                ALERT_TITLE,
                result.display_name()
            );
        } else {
            debug!("Scan clean: {} ({:?})", result.display_name(), result.status);
        }
    }
}

/// Forwards results to async subscribers
///
/// Sending never blocks; results are dropped when nobody is subscribed and
/// slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DetectionResult>,
    suspicious_only: bool,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            suspicious_only: false,
        }
    }

    /// Only forward results flagged as suspicious
    pub fn suspicious_only(mut self) -> Self {
        self.suspicious_only = true;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DetectionResult> {
        self.tx.subscribe()
    }
}

impl AlertSink for BroadcastSink {
    fn deliver(&self, result: DetectionResult) {
        if self.suspicious_only && !result.is_suspicious {
            return;
        }
        if self.tx.send(result).is_err() {
            debug!("No alert subscribers, result dropped");
        }
    }
}

/// Delivers each result to several sinks in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AlertSink for FanoutSink {
    fn deliver(&self, result: DetectionResult) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.deliver(result.clone());
            }
            last.deliver(result);
        }
    }
}
