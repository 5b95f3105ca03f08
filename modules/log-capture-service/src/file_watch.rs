//! File-change bridge: turns OS notifications for one file into a
//! pull-based sequence with a single consumer at a time.

use crate::error::{CaptureError, CaptureResult};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Changed,
}

pub struct FileChangeBridge {
    path: PathBuf,
    /// Held by the one pending waiter.
    waiter: Mutex<mpsc::Receiver<FileEvent>>,
    _watcher: RecommendedWatcher,
}

impl FileChangeBridge {
    /// Register an observer for `path`, which must already exist.
    pub fn new(path: impl Into<PathBuf>) -> CaptureResult<Self> {
        let path = path.into();
        // Capacity 1: changes that land while nobody waits collapse into a
        // single pending `Changed`.
        let (tx, rx) = mpsc::channel(1);
        let label = path.display().to_string();

        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(_) => {
                    let _ = tx.try_send(FileEvent::Changed);
                }
                Err(e) => log::warn!("[FILE_WATCH] Watch error on {}: {}", label, e),
            },
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        log::debug!("[FILE_WATCH] Observing {}", path.display());
        Ok(Self {
            path,
            waiter: Mutex::new(rx),
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next change.
    ///
    /// Returns `Ok(None)` when `cancel` fires first. Fails with
    /// [`CaptureError::WaiterPending`] if another call is already waiting.
    pub async fn next(&self, cancel: &CancellationToken) -> CaptureResult<Option<FileEvent>> {
        let mut rx = self
            .waiter
            .try_lock()
            .map_err(|_| CaptureError::WaiterPending(self.path.clone()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            event = rx.recv() => Ok(event),
        }
    }
}

impl Drop for FileChangeBridge {
    fn drop(&mut self) {
        log::debug!("[FILE_WATCH] Releasing observer for {}", self.path.display());
    }
}
