use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("base location unavailable: {0}")]
    BaseLocation(String),

    #[error("invalid executable id {0:?}")]
    InvalidId(String),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("log source error: {0}")]
    Source(String),

    #[error("another caller is already waiting for changes to {0:?}")]
    WaiterPending(PathBuf),
}

pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CaptureError::Io {
            path: path.into(),
            source,
        }
    }
}
