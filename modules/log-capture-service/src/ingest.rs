//! Ingestion engine: drains a log source into this executable's run store.
//!
//! Each engine owns one run store and creates exactly one run at
//! construction. A background loop then polls the source once per interval
//! with the cursor (the newest persisted entry date), persists whatever
//! came back and advances the cursor. The cursor is re-derived from the
//! store on every construction, so a relaunch resumes where the previous
//! process stopped.

use crate::convention::Convention;
use crate::db::{self, RunStore};
use crate::error::{CaptureError, CaptureResult};
use crate::source::LogSource;
use chrono::{DateTime, Utc};
use log_capture_types::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cap on entries committed per transaction when draining a backlog.
pub const DEFAULT_MAX_BATCH: usize = 500;

/// The executable being captured.
#[derive(Debug, Clone)]
pub enum Identity {
    /// An app package; its manifest is published for discovery.
    App(Manifest),
    /// An extension of some app; listed in that app's manifest.
    Extension { id: String },
}

impl Identity {
    pub fn executable_id(&self) -> &str {
        match self {
            Identity::App(manifest) => &manifest.id,
            Identity::Extension { id } => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub poll_interval: Duration,
    pub max_batch: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone)]
struct CaptureProgress {
    cursor: Option<DateTime<Utc>>,
    entries_captured: u64,
    last_tick_at: Option<String>,
}

// =====================================================
// Poll cycle
// =====================================================

/// Cursor-driven state owned by the capture loop.
struct Capture {
    store: Arc<RunStore>,
    source: Arc<dyn LogSource>,
    run: Run,
    cursor: DateTime<Utc>,
    max_batch: usize,
    entries_captured: u64,
}

impl Capture {
    /// One poll cycle: fetch after the cursor, persist in batches, advance
    /// the cursor after each committed batch.
    ///
    /// On error the cursor stays at the last committed batch, so the next
    /// cycle fetches the remainder again.
    fn tick(&mut self, cancel: &CancellationToken) -> CaptureResult<usize> {
        let fetched = self.source.entries(self.cursor)?;
        let fetched_count = fetched.len();

        let (fresh, stale): (Vec<LogRecord>, Vec<LogRecord>) = fetched
            .into_iter()
            .partition(|record| record.date > self.cursor);
        if !stale.is_empty() {
            log::warn!(
                "[CAPTURE] Dropped {} record(s) at or before cursor {}",
                stale.len(),
                iso8601::format(&self.cursor)
            );
        }
        let (fresh, unstorable): (Vec<LogRecord>, Vec<LogRecord>) =
            fresh.into_iter().partition(|record| db::is_storable(&record.date));
        if !unstorable.is_empty() {
            log::warn!(
                "[CAPTURE] Dropped {} of {} record(s) dated outside the storable range",
                unstorable.len(),
                fetched_count
            );
        }

        let mut persisted = 0;
        for batch in fresh.chunks(self.max_batch.max(1)) {
            if cancel.is_cancelled() {
                log::debug!("[CAPTURE] Cancelled with {} record(s) unpersisted", fresh.len() - persisted);
                break;
            }
            self.store.append_entries(&self.run, batch)?;
            if let Some(newest) = batch.iter().map(|r| r.date).max() {
                self.cursor = self.cursor.max(newest);
            }
            persisted += batch.len();
            self.entries_captured += batch.len() as u64;
        }

        Ok(persisted)
    }

    fn has_cursor(&self) -> bool {
        self.cursor != DateTime::<Utc>::MIN_UTC
    }
}

/// Steps 1-5 of construction: paths, manifest, store, cursor, new run.
fn open_capture(
    convention: &Convention,
    identity: &Identity,
    device: &DeviceInfo,
    source: Arc<dyn LogSource>,
    launch_date: DateTime<Utc>,
    max_batch: usize,
) -> CaptureResult<Capture> {
    let executable_id = identity.executable_id();
    let store_path = convention.log_store_path(executable_id)?;

    if let Identity::App(manifest) = identity {
        let manifest_path = convention.manifest_path(&manifest.id)?;
        write_manifest(&manifest_path, manifest)?;
        log::info!("[CAPTURE] Published manifest {}", manifest_path.display());
    }

    let logs_dir = convention.logs_dir()?;
    std::fs::create_dir_all(&logs_dir).map_err(|e| CaptureError::io(&logs_dir, e))?;

    log::info!("[CAPTURE] Opening run store at {}", store_path.display());
    let store = Arc::new(RunStore::open(&store_path)?);

    let cursor = store
        .max_entry_timestamp()?
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let run = store.append_run(&device.run_info(launch_date))?;

    Ok(Capture {
        store,
        source,
        run,
        cursor,
        max_batch,
        entries_captured: 0,
    })
}

/// Write through a temp file and rename, so readers never observe a
/// partially written manifest.
fn write_manifest(path: &Path, manifest: &Manifest) -> CaptureResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| CaptureError::BaseLocation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| CaptureError::io(dir, e))?;

    let json = serde_json::to_vec_pretty(manifest)?;
    let tmp = dir.join(format!(".{}.json.tmp", manifest.id));
    std::fs::write(&tmp, json).map_err(|e| CaptureError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CaptureError::io(path, e))?;
    Ok(())
}

// =====================================================
// Engine
// =====================================================

pub struct IngestionEngine {
    executable_id: String,
    store: Arc<RunStore>,
    run: Run,
    poll_interval: Duration,
    progress: Arc<Mutex<CaptureProgress>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl IngestionEngine {
    /// Open the store, start a new run and spawn the capture loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        convention: &Convention,
        identity: Identity,
        device: &DeviceInfo,
        source: Arc<dyn LogSource>,
        launch_date: DateTime<Utc>,
    ) -> CaptureResult<Self> {
        Self::with_options(
            convention,
            identity,
            device,
            source,
            launch_date,
            CaptureOptions::default(),
        )
    }

    pub fn with_options(
        convention: &Convention,
        identity: Identity,
        device: &DeviceInfo,
        source: Arc<dyn LogSource>,
        launch_date: DateTime<Utc>,
        options: CaptureOptions,
    ) -> CaptureResult<Self> {
        let capture = open_capture(
            convention,
            &identity,
            device,
            source,
            launch_date,
            options.max_batch,
        )?;

        let progress = Arc::new(Mutex::new(CaptureProgress {
            cursor: capture.has_cursor().then_some(capture.cursor),
            entries_captured: 0,
            last_tick_at: None,
        }));
        let cancel = CancellationToken::new();
        let store = capture.store.clone();
        let run = capture.run.clone();

        log::info!(
            "[CAPTURE] Started run {} for {} (cursor: {})",
            run.id,
            identity.executable_id(),
            progress_cursor_label(capture.has_cursor().then_some(capture.cursor))
        );

        let handle = tokio::spawn(run_capture(
            capture,
            options.poll_interval,
            progress.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            executable_id: identity.executable_id().to_string(),
            store,
            run,
            poll_interval: options.poll_interval,
            progress,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn executable_id(&self) -> &str {
        &self.executable_id
    }

    /// The run created by this engine.
    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    pub fn export_runs(&self) -> CaptureResult<Vec<RunExport>> {
        Ok(self.store.export_runs()?)
    }

    /// All runs in this store as a pretty-printed, key-sorted JSON document.
    pub fn export(&self) -> CaptureResult<String> {
        let runs = self.export_runs()?;
        Ok(export_document(&runs)?)
    }

    pub async fn status(&self) -> CaptureStatus {
        let progress = self.progress.lock().await.clone();
        CaptureStatus {
            executable_id: self.executable_id.clone(),
            run_id: self.run.id,
            cursor: progress.cursor.as_ref().map(iso8601::format),
            entries_captured: progress.entries_captured,
            last_tick_at: progress.last_tick_at,
            poll_interval_ms: self.poll_interval.as_millis() as u64,
        }
    }

    /// Stop the loop and wait for it to finish its current cycle.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                log::error!("[CAPTURE] Capture loop for {} failed: {}", self.executable_id, e);
            }
        }
    }
}

impl Drop for IngestionEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decode an export document and append its runs to `store`.
/// Returns the number of entries imported.
pub fn import_document(store: &RunStore, document: &str) -> CaptureResult<usize> {
    let runs = parse_export_document(document)?;
    let count = store.import_runs(&runs)?;
    log::info!("[CAPTURE] Imported {} run(s) with {} entries", runs.len(), count);
    Ok(count)
}

fn progress_cursor_label(cursor: Option<DateTime<Utc>>) -> String {
    cursor
        .as_ref()
        .map(iso8601::format)
        .unwrap_or_else(|| "empty store".to_string())
}

async fn run_capture(
    mut capture: Capture,
    poll_interval: Duration,
    progress: Arc<Mutex<CaptureProgress>>,
    cancel: CancellationToken,
) {
    log::info!(
        "[CAPTURE] Loop started for run {} (poll interval: {}ms)",
        capture.run.id,
        poll_interval.as_millis()
    );

    loop {
        let result = capture.tick(&cancel);

        {
            let mut progress = progress.lock().await;
            progress.cursor = capture.has_cursor().then_some(capture.cursor);
            progress.entries_captured = capture.entries_captured;
            match &result {
                Ok(persisted) => {
                    progress.last_tick_at = Some(Utc::now().to_rfc3339());
                    if *persisted > 0 {
                        log::debug!(
                            "[CAPTURE] Persisted {} entries (cursor: {})",
                            persisted,
                            iso8601::format(&capture.cursor)
                        );
                    }
                }
                Err(e) => {
                    log::error!(
                        "[CAPTURE] Tick error, retrying next cycle (cursor: {}): {}",
                        progress_cursor_label(progress.cursor),
                        e
                    );
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    log::info!(
        "[CAPTURE] Loop stopped for run {} ({} entries captured)",
        capture.run.id,
        capture.entries_captured
    );
}
