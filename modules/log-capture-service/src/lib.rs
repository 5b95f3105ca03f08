//! Log capture: drains a live log source into a per-executable SQLite run
//! store, and discovers every capturing app on the host through a shared
//! directory layout.

pub mod convention;
pub mod db;
pub mod discovery;
pub mod error;
pub mod file_watch;
pub mod ingest;
pub mod source;
pub mod watcher;

pub use convention::Convention;
pub use db::RunStore;
pub use discovery::{AppStream, DiscoveryRetriever};
pub use error::{CaptureError, CaptureResult};
pub use file_watch::{FileChangeBridge, FileEvent};
pub use ingest::{CaptureOptions, Identity, IngestionEngine, import_document};
pub use source::{JsonLinesSource, LogSource, MemorySource};
pub use watcher::{DirectoryEvents, DirectoryWatcher, NotifyWatcher};
