//! Storage convention: where manifests and log stores live on disk.
//!
//! Every process that captures logs and every process that discovers them
//! must agree on this layout:
//!
//! ```text
//! <base>/<components...>/Manifests/<app id>.json
//! <base>/<components...>/Logs/<executable id>.sqlite
//! ```

use crate::error::{CaptureError, CaptureResult};
use std::path::{Path, PathBuf};

pub const MANIFESTS_DIR: &str = "Manifests";
pub const LOGS_DIR: &str = "Logs";
pub const MANIFEST_EXTENSION: &str = "json";
pub const LOG_STORE_EXTENSION: &str = "sqlite";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convention {
    base: PathBuf,
    components: Vec<String>,
}

impl Convention {
    pub fn new<I, S>(base: impl Into<PathBuf>, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            base: base.into(),
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve `<base>/<components...>`.
    ///
    /// The base must be an absolute path; anything else means the shared
    /// location could not be determined for this process.
    pub fn root(&self) -> CaptureResult<PathBuf> {
        if self.base.as_os_str().is_empty() {
            return Err(CaptureError::BaseLocation("base directory is empty".to_string()));
        }
        if !self.base.is_absolute() {
            return Err(CaptureError::BaseLocation(format!(
                "base directory {} is not absolute",
                self.base.display()
            )));
        }
        let mut root = self.base.clone();
        for component in &self.components {
            validate_component(component).map_err(|_| {
                CaptureError::BaseLocation(format!("invalid path component {:?}", component))
            })?;
            root.push(component);
        }
        Ok(root)
    }

    pub fn manifests_dir(&self) -> CaptureResult<PathBuf> {
        Ok(self.root()?.join(MANIFESTS_DIR))
    }

    pub fn logs_dir(&self) -> CaptureResult<PathBuf> {
        Ok(self.root()?.join(LOGS_DIR))
    }

    pub fn manifest_path(&self, app_id: &str) -> CaptureResult<PathBuf> {
        validate_segment(app_id)?;
        Ok(self
            .manifests_dir()?
            .join(format!("{}.{}", app_id, MANIFEST_EXTENSION)))
    }

    pub fn log_store_path(&self, executable_id: &str) -> CaptureResult<PathBuf> {
        validate_segment(executable_id)?;
        Ok(self
            .logs_dir()?
            .join(format!("{}.{}", executable_id, LOG_STORE_EXTENSION)))
    }

    /// Create the manifests and logs directories if missing.
    /// Returns `(manifests_dir, logs_dir)`.
    pub fn ensure_directories(&self) -> CaptureResult<(PathBuf, PathBuf)> {
        let manifests = self.manifests_dir()?;
        let logs = self.logs_dir()?;
        for dir in [&manifests, &logs] {
            std::fs::create_dir_all(dir).map_err(|e| CaptureError::io(dir, e))?;
        }
        Ok((manifests, logs))
    }
}

/// Executable id of a log-store file, or `None` for anything else in the
/// logs directory (journals, temp files).
pub fn log_store_id(path: &Path) -> Option<String> {
    id_with_extension(path, LOG_STORE_EXTENSION)
}

pub fn is_manifest_file(path: &Path) -> bool {
    id_with_extension(path, MANIFEST_EXTENSION).is_some()
}

fn id_with_extension(path: &Path, extension: &str) -> Option<String> {
    if path.extension()?.to_str()? != extension {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

/// A single directory name: no separators, no `.` or `..`.
fn validate_component(segment: &str) -> CaptureResult<()> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0']);
    if bad {
        return Err(CaptureError::InvalidId(segment.to_string()));
    }
    Ok(())
}

/// Ids also may not start with `.`; temp manifests use that prefix.
fn validate_segment(id: &str) -> CaptureResult<()> {
    validate_component(id)?;
    if id.starts_with('.') {
        return Err(CaptureError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_layout() {
        let convention = Convention::new("/var/shared", ["group", "logging"]);
        assert_eq!(
            convention.manifest_path("com.example.app").unwrap(),
            PathBuf::from("/var/shared/group/logging/Manifests/com.example.app.json")
        );
        assert_eq!(
            convention.log_store_path("com.example.app.widget").unwrap(),
            PathBuf::from("/var/shared/group/logging/Logs/com.example.app.widget.sqlite")
        );
    }

    #[test]
    fn test_relative_or_empty_base_is_rejected() {
        let relative = Convention::new("relative/dir", Vec::<String>::new());
        assert!(matches!(
            relative.log_store_path("a"),
            Err(CaptureError::BaseLocation(_))
        ));

        let empty = Convention::new("", Vec::<String>::new());
        assert!(matches!(empty.root(), Err(CaptureError::BaseLocation(_))));

        let escaping = Convention::new("/tmp", [".."]);
        assert!(matches!(escaping.root(), Err(CaptureError::BaseLocation(_))));
    }

    #[test]
    fn test_dot_prefixed_components_are_allowed() {
        let convention = Convention::new("/home/dev", [".config", "shared"]);
        assert_eq!(
            convention.log_store_path("app").unwrap(),
            PathBuf::from("/home/dev/.config/shared/Logs/app.sqlite")
        );
        assert!(matches!(
            convention.log_store_path(".app"),
            Err(CaptureError::InvalidId(_))
        ));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let convention = Convention::new("/tmp", Vec::<String>::new());
        for id in ["", "..", "a/b", "a\\b", ".hidden"] {
            assert!(
                matches!(convention.log_store_path(id), Err(CaptureError::InvalidId(_))),
                "{:?} should be rejected",
                id
            );
        }
    }

    #[test]
    fn test_log_store_id_ignores_sidecar_files() {
        assert_eq!(
            log_store_id(Path::new("/x/Logs/A.ext.sqlite")).as_deref(),
            Some("A.ext")
        );
        assert_eq!(log_store_id(Path::new("/x/Logs/A.sqlite-journal")), None);
        assert_eq!(log_store_id(Path::new("/x/Logs/A.sqlite-wal")), None);
        assert_eq!(log_store_id(Path::new("/x/Logs/A")), None);
        assert!(is_manifest_file(Path::new("/x/Manifests/A.json")));
        assert!(!is_manifest_file(Path::new("/x/Manifests/.A.json.tmp")));
    }

    #[test]
    fn test_ensure_directories_creates_both() {
        let dir = tempfile::tempdir().unwrap();
        let convention = Convention::new(dir.path(), ["shared"]);
        let (manifests, logs) = convention.ensure_directories().unwrap();
        assert!(manifests.is_dir());
        assert!(logs.is_dir());
        assert!(manifests.ends_with("shared/Manifests"));
    }
}
