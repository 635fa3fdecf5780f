//! Directory Monitoring
//!
//! Watches download folders (non-recursively) for newly created image files
//! and hands each candidate path to a callback, normally
//! [`ScanDispatcher::submit`](crate::engine::ScanDispatcher::submit).

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// File suffixes (lowercase, without the dot) that are forwarded for scanning
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {path}: {reason}")]
    WatchSetup { path: PathBuf, reason: String },
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),
}

/// Receives candidate image paths; invoked on the watcher's event thread
pub type CandidateCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Start/stop capability shared by every watcher backend
pub trait DirectoryWatcher: Send {
    fn start(&mut self) -> Result<(), WatchError>;
    fn stop(&mut self);
}

/// A configured watch directory and its current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub path: PathBuf,
    pub exists: bool,
    pub monitored: bool,
}

impl WatchTarget {
    fn new(path: PathBuf) -> Self {
        let exists = path.is_dir();
        Self {
            path,
            exists,
            monitored: false,
        }
    }
}

/// Whether a path has one of the scanned image suffixes (case-insensitive)
pub fn is_candidate_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Native file system monitor backed by `notify`
pub struct FileMonitor {
    targets: Vec<WatchTarget>,
    on_candidate: CandidateCallback,
    watcher: Option<RecommendedWatcher>,
    stopped: Arc<AtomicBool>,
}

impl FileMonitor {
    /// Create a new file monitor
    pub fn new(paths: impl IntoIterator<Item = PathBuf>, on_candidate: CandidateCallback) -> Self {
        let mut targets: Vec<WatchTarget> = Vec::new();
        for path in paths {
            if !targets.iter().any(|t| t.path == path) {
                targets.push(WatchTarget::new(path));
            }
        }

        Self {
            targets,
            on_candidate,
            watcher: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current state of every configured directory
    pub fn watch_targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Register targets that appeared since start and drop vanished ones
    ///
    /// Returns the number of newly monitored directories.
    pub fn revalidate(&mut self) -> usize {
        let Some(watcher) = self.watcher.as_mut() else {
            return 0;
        };

        let mut added = 0;
        for target in &mut self.targets {
            target.exists = target.path.is_dir();
            if target.exists && !target.monitored {
                match register(watcher, target) {
                    Ok(()) => added += 1,
                    Err(e) => warn!("{}", e),
                }
            } else if !target.exists && target.monitored {
                if let Err(e) = watcher.unwatch(&target.path) {
                    debug!("Unwatch of {} failed: {}", target.path.display(), e);
                }
                target.monitored = false;
                warn!("Watch directory disappeared: {}", target.path.display());
            }
        }
        added
    }

    fn handle_event(event: Event, stopped: &AtomicBool, on_candidate: &CandidateCallback) {
        if stopped.load(Ordering::Acquire) {
            return;
        }
        match event.kind {
            EventKind::Create(CreateKind::Folder) => {}
            // Files moved in from elsewhere arrive complete, like a creation
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in event.paths {
                    if is_candidate_image(&path) && !path.is_dir() {
                        info!("New image detected: {}", path.display());
                        on_candidate(path);
                    }
                }
            }
            _ => {}
        }
    }
}

impl DirectoryWatcher for FileMonitor {
    /// Start monitoring the configured paths
    fn start(&mut self) -> Result<(), WatchError> {
        if self.watcher.is_some() {
            return Ok(());
        }
        self.stopped.store(false, Ordering::Release);

        let stopped = Arc::clone(&self.stopped);
        let on_candidate = Arc::clone(&self.on_candidate);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => Self::handle_event(event, &stopped, &on_candidate),
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )?;

        for target in &mut self.targets {
            target.exists = target.path.is_dir();
            if let Err(e) = register(&mut watcher, target) {
                warn!("{}", e);
            }
        }

        let monitored = self.targets.iter().filter(|t| t.monitored).count();
        if monitored == 0 {
            warn!("No watch directories available; waiting for revalidation");
        } else {
            info!("File monitor active on {} of {} directories", monitored, self.targets.len());
        }

        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop delivering events and release native handles
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if self.watcher.take().is_some() {
            for target in &mut self.targets {
                target.monitored = false;
            }
            info!("File monitor stopped");
        }
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn register(watcher: &mut RecommendedWatcher, target: &mut WatchTarget) -> Result<(), WatchError> {
    if !target.exists {
        return Err(WatchError::WatchSetup {
            path: target.path.clone(),
            reason: "directory does not exist".to_string(),
        });
    }
    watcher
        .watch(&target.path, RecursiveMode::NonRecursive)
        .map_err(|e| WatchError::WatchSetup {
            path: target.path.clone(),
            reason: e.to_string(),
        })?;
    target.monitored = true;
    info!("Monitoring folder: {}", target.path.display());
    Ok(())
}

/// Watcher for hosts without a native notification backend
#[derive(Debug, Default)]
pub struct NullWatcher;

impl DirectoryWatcher for NullWatcher {
    fn start(&mut self) -> Result<(), WatchError> {
        debug!("Null watcher started; no directories will be monitored");
        Ok(())
    }

    fn stop(&mut self) {}
}
