//! Discovery retriever: joins published manifests with the log stores on
//! disk and streams the result as it changes.

use crate::convention::{self, Convention};
use crate::error::{CaptureError, CaptureResult};
use crate::watcher::{DirectoryEvents, DirectoryWatcher, NotifyWatcher};
use log_capture_types::{AppContainer, ExecutableContainer, ExecutableKind, Manifest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct DiscoveryRetriever {
    snapshots: watch::Receiver<Vec<AppContainer>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryRetriever {
    /// Watch `convention`'s directories with the platform notifier.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(convention: &Convention) -> CaptureResult<Self> {
        Self::with_watcher(convention, &NotifyWatcher)
    }

    pub fn with_watcher(
        convention: &Convention,
        watcher: &dyn DirectoryWatcher,
    ) -> CaptureResult<Self> {
        let (manifests_dir, logs_dir) = convention.ensure_directories()?;

        // Watches go up before the first listing so nothing written in
        // between is missed.
        let manifest_events = watcher.watch(&manifests_dir)?;
        let log_events = watcher.watch(&logs_dir)?;

        let initial = refresh_snapshot(&manifests_dir, &logs_dir)?;
        log::info!(
            "[DISCOVERY] Initial snapshot: {} app(s), {} executable(s)",
            initial.len(),
            executable_count(&initial)
        );

        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_discovery(
            manifests_dir,
            logs_dir,
            manifest_events,
            log_events,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            snapshots: rx,
            cancel,
            handle: Some(handle),
        })
    }

    /// A stream starting with the current snapshot.
    pub fn subscribe(&self) -> AppStream {
        AppStream {
            rx: self.snapshots.clone(),
            primed: false,
        }
    }

    pub fn latest(&self) -> Vec<AppContainer> {
        self.snapshots.borrow().clone()
    }

    /// Cancel both directory watches and wait for the worker to exit.
    /// Every open [`AppStream`] ends afterwards.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("[DISCOVERY] Worker failed: {}", e);
            }
        }
    }
}

impl Drop for DiscoveryRetriever {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sequence of discovery snapshots for one consumer.
pub struct AppStream {
    rx: watch::Receiver<Vec<AppContainer>>,
    primed: bool,
}

impl AppStream {
    /// The current snapshot on the first call, then each new one.
    /// `None` once the retriever has been torn down.
    pub async fn next(&mut self) -> Option<Vec<AppContainer>> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

pub fn executable_count(apps: &[AppContainer]) -> usize {
    apps.iter().map(|app| app.executables.len()).sum()
}

// =====================================================
// Worker
// =====================================================

async fn run_discovery(
    manifests_dir: PathBuf,
    logs_dir: PathBuf,
    mut manifest_events: DirectoryEvents,
    mut log_events: DirectoryEvents,
    tx: watch::Sender<Vec<AppContainer>>,
    cancel: CancellationToken,
) {
    log::info!(
        "[DISCOVERY] Watching {} and {}",
        manifests_dir.display(),
        logs_dir.display()
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(()) = manifest_events.changed() => {}
            Some(()) = log_events.changed() => {}
        }

        // One refresh covers every signal queued so far
        let coalesced = manifest_events.drain() + log_events.drain();
        if coalesced > 0 {
            log::debug!("[DISCOVERY] Coalesced {} pending change signal(s)", coalesced);
        }

        let (m, l) = (manifests_dir.clone(), logs_dir.clone());
        let snapshot = match tokio::task::spawn_blocking(move || refresh_snapshot(&m, &l)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                log::error!("[DISCOVERY] Refresh failed: {}", e);
                continue;
            }
            Err(e) => {
                log::error!("[DISCOVERY] Refresh task failed: {}", e);
                continue;
            }
        };

        let apps = snapshot.len();
        let executables = executable_count(&snapshot);
        let published = tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
        if published {
            log::info!(
                "[DISCOVERY] Snapshot updated: {} app(s), {} executable(s)",
                apps,
                executables
            );
        }
    }

    log::info!("[DISCOVERY] Stopped");
}

// =====================================================
// Refresh
// =====================================================

/// List both directories and join them.
pub fn refresh_snapshot(manifests_dir: &Path, logs_dir: &Path) -> CaptureResult<Vec<AppContainer>> {
    let manifests = read_manifests(manifests_dir)?;
    let stores = list_log_stores(logs_dir)?;
    Ok(join_snapshot(manifests, &stores))
}

fn read_manifests(dir: &Path) -> CaptureResult<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for path in list_dir(dir)? {
        if !convention::is_manifest_file(&path) {
            continue;
        }
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            // Removed between listing and reading
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("[DISCOVERY] Skipping unreadable manifest {}: {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => log::warn!("[DISCOVERY] Skipping malformed manifest {}: {}", path.display(), e),
        }
    }
    Ok(manifests)
}

fn list_log_stores(dir: &Path) -> CaptureResult<HashMap<String, PathBuf>> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter_map(|path| convention::log_store_id(&path).map(|id| (id, path)))
        .collect())
}

fn list_dir(dir: &Path) -> CaptureResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| CaptureError::io(dir, e))?;
    Ok(entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect())
}

/// An executable is listed only when its manifest entry and its log store
/// both exist. Main executable first, then extensions by id; apps by id.
pub fn join_snapshot(manifests: Vec<Manifest>, stores: &HashMap<String, PathBuf>) -> Vec<AppContainer> {
    let mut apps: Vec<AppContainer> = manifests
        .into_iter()
        .map(|manifest| {
            let mut executables = Vec::new();

            if let Some(location) = stores.get(&manifest.id) {
                executables.push(ExecutableContainer {
                    id: manifest.id.clone(),
                    display_name: manifest.label().to_string(),
                    kind: ExecutableKind::Main,
                    location: location.clone(),
                });
            }

            // BTreeMap iteration is already ordered by id
            for (ext_id, ext) in &manifest.extensions {
                if let Some(location) = stores.get(ext_id) {
                    executables.push(ExecutableContainer {
                        id: ext_id.clone(),
                        display_name: ext.label().to_string(),
                        kind: ExecutableKind::Extension {
                            point_id: ext.extension_point_identifier.clone(),
                        },
                        location: location.clone(),
                    });
                }
            }

            AppContainer {
                display_name: manifest.label().to_string(),
                id: manifest.id,
                executables,
            }
        })
        .collect();

    apps.sort_by(|a, b| a.id.cmp(&b.id));
    apps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RunStore;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn stores(ids: &[&str]) -> HashMap<String, PathBuf> {
        ids.iter()
            .map(|id| (id.to_string(), PathBuf::from(format!("/logs/{}.sqlite", id))))
            .collect()
    }

    fn app_a() -> Manifest {
        Manifest::new("A", "App A").with_extension("A.ext", "Ext", "widget")
    }

    fn write_manifest(convention: &Convention, manifest: &Manifest) {
        let path = convention.manifest_path(&manifest.id).unwrap();
        std::fs::write(path, serde_json::to_vec(manifest).unwrap()).unwrap();
    }

    fn create_store(convention: &Convention, id: &str) {
        RunStore::open(&convention.log_store_path(id).unwrap()).unwrap();
    }

    /// Hands out directory streams whose signals the test fires by hand.
    #[derive(Default)]
    struct ManualWatcher {
        senders: Mutex<HashMap<PathBuf, mpsc::UnboundedSender<()>>>,
    }

    impl ManualWatcher {
        fn fire(&self, dir: &Path) {
            let senders = self.senders.lock().unwrap();
            senders[dir].send(()).unwrap();
        }
    }

    impl DirectoryWatcher for ManualWatcher {
        fn watch(&self, path: &Path) -> CaptureResult<DirectoryEvents> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().insert(path.to_path_buf(), tx);
            Ok(DirectoryEvents::new(rx, ()))
        }
    }

    async fn next_within(stream: &mut AppStream) -> Option<Vec<AppContainer>> {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no snapshot within timeout")
    }

    #[test]
    fn test_join_main_then_extension() {
        let apps = join_snapshot(vec![app_a()], &stores(&["A", "A.ext"]));

        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, "A");
        assert_eq!(apps[0].display_name, "App A");
        let executables = &apps[0].executables;
        assert_eq!(executables.len(), 2);
        assert_eq!(executables[0].id, "A");
        assert_eq!(executables[0].kind, ExecutableKind::Main);
        assert_eq!(executables[1].id, "A.ext");
        assert_eq!(
            executables[1].kind,
            ExecutableKind::Extension {
                point_id: "widget".to_string()
            }
        );
        assert_eq!(executables[1].location, PathBuf::from("/logs/A.ext.sqlite"));
    }

    #[test]
    fn test_join_manifest_without_logs_has_no_executables() {
        let apps = join_snapshot(vec![app_a()], &HashMap::new());
        assert_eq!(apps.len(), 1);
        assert!(apps[0].executables.is_empty());
    }

    #[test]
    fn test_join_ignores_stores_without_manifest_entry() {
        let apps = join_snapshot(vec![app_a()], &stores(&["A.ext", "B", "A.other"]));
        let ids: Vec<&str> = apps[0].executables.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A.ext"]);
    }

    #[test]
    fn test_join_orders_apps_and_extensions_by_id() {
        let mut a = Manifest::new("A", "App A")
            .with_extension("A.zeta", "Zeta", "widget")
            .with_extension("A.alpha", "Alpha", "share");
        a.display_name = Some("Alpha App".to_string());
        let b = Manifest::new("B", "App B");

        let apps = join_snapshot(vec![b, a], &stores(&["A.zeta", "A.alpha", "A", "B"]));

        let app_ids: Vec<&str> = apps.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(app_ids, vec!["A", "B"]);
        assert_eq!(apps[0].display_name, "Alpha App");
        let exe_ids: Vec<&str> = apps[0].executables.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(exe_ids, vec!["A", "A.alpha", "A.zeta"]);
    }

    #[test]
    fn test_refresh_skips_malformed_manifests_and_sidecar_files() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        let (manifests_dir, logs_dir) = convention.ensure_directories().unwrap();

        write_manifest(&convention, &app_a());
        std::fs::write(manifests_dir.join("broken.json"), "{ not json").unwrap();
        std::fs::write(manifests_dir.join("notes.txt"), "ignored").unwrap();
        create_store(&convention, "A");
        std::fs::write(logs_dir.join("A.ext.sqlite-journal"), b"").unwrap();

        let apps = refresh_snapshot(&manifests_dir, &logs_dir).unwrap();
        assert_eq!(apps.len(), 1);
        let ids: Vec<&str> = apps[0].executables.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
        assert_eq!(apps[0].executables[0].location, logs_dir.join("A.sqlite"));
    }

    #[tokio::test]
    async fn test_stream_follows_directory_changes() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        let watcher = ManualWatcher::default();
        let retriever = DiscoveryRetriever::with_watcher(&convention, &watcher).unwrap();
        let mut stream = retriever.subscribe();

        assert_eq!(next_within(&mut stream).await, Some(vec![]));

        write_manifest(&convention, &app_a());
        watcher.fire(&convention.manifests_dir().unwrap());
        let snapshot = next_within(&mut stream).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].executables.is_empty());

        create_store(&convention, "A");
        create_store(&convention, "A.ext");
        watcher.fire(&convention.logs_dir().unwrap());
        let snapshot = next_within(&mut stream).await.unwrap();
        assert_eq!(snapshot[0].executables.len(), 2);
        assert_eq!(retriever.latest(), snapshot);

        retriever.shutdown().await;
        assert_eq!(next_within(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_unchanged_listing_is_not_republished() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        convention.ensure_directories().unwrap();
        write_manifest(&convention, &app_a());
        let watcher = ManualWatcher::default();
        let retriever = DiscoveryRetriever::with_watcher(&convention, &watcher).unwrap();
        let mut stream = retriever.subscribe();
        let first = next_within(&mut stream).await.unwrap();
        assert_eq!(first.len(), 1);

        // Nothing changed on disk
        watcher.fire(&convention.logs_dir().unwrap());
        let quiet = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(quiet.is_err(), "identical snapshot was published");

        retriever.shutdown().await;
    }

    #[tokio::test]
    async fn test_notify_backed_retriever_sees_new_app() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        let retriever = DiscoveryRetriever::new(&convention).unwrap();
        let mut stream = retriever.subscribe();
        assert_eq!(next_within(&mut stream).await, Some(vec![]));

        write_manifest(&convention, &app_a());
        create_store(&convention, "A");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = next_within(&mut stream).await.unwrap();
            if snapshot.len() == 1 && snapshot[0].executables.len() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "app never discovered");
        }

        retriever.shutdown().await;
        assert_eq!(next_within(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_dropping_retriever_ends_streams() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        let watcher = ManualWatcher::default();
        let retriever = DiscoveryRetriever::with_watcher(&convention, &watcher).unwrap();
        let mut stream = retriever.subscribe();
        next_within(&mut stream).await.unwrap();

        drop(retriever);
        assert_eq!(next_within(&mut stream).await, None);
    }
}
