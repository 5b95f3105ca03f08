//! Directory-level change notifications.
//!
//! Discovery only needs a coarse "something in this directory changed, list
//! it again" signal, so events carry no payload.

use crate::error::CaptureResult;
use notify::{EventKind, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

/// Stream of change signals for one directory.
///
/// Owns the OS-level watch; dropping it deregisters the watch.
pub struct DirectoryEvents {
    rx: mpsc::UnboundedReceiver<()>,
    _guard: Box<dyn Send>,
}

impl DirectoryEvents {
    pub fn new(rx: mpsc::UnboundedReceiver<()>, guard: impl Send + 'static) -> Self {
        Self {
            rx,
            _guard: Box::new(guard),
        }
    }

    /// Wait for the next change. `None` once the watch is gone.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Discard signals that queued up behind the one just handled.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

pub trait DirectoryWatcher: Send + Sync {
    fn watch(&self, path: &Path) -> CaptureResult<DirectoryEvents>;
}

/// Watches through the platform's native notifier (inotify, FSEvents,
/// ReadDirectoryChangesW).
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyWatcher;

impl DirectoryWatcher for NotifyWatcher {
    fn watch(&self, path: &Path) -> CaptureResult<DirectoryEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = path.display().to_string();

        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                // Reads of the directory (our own refreshes) must not
                // trigger another refresh.
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(e) => log::warn!("[DISCOVERY] Watch error on {}: {}", label, e),
            },
        )?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;

        log::debug!("[DISCOVERY] Watching {}", path.display());
        Ok(DirectoryEvents::new(rx, watcher))
    }
}
