//! Service configuration from `LOG_CAPTURE_*` environment variables.

use log_capture_service::{CaptureOptions, Convention, Identity};
use log_capture_types::{DeviceInfo, Manifest};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 9103;
const DEFAULT_COMPONENTS: &str = "shared";
const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub base_dir: PathBuf,
    pub components: Vec<String>,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub app_display_name: Option<String>,
    /// `id:extensionPoint` pairs listed in the published manifest
    pub extensions: Vec<(String, String)>,
    pub extension_id: Option<String>,
    pub source_path: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub max_batch: usize,
    pub app_version: String,
    pub os_version: String,
    pub device: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port: u16 = var("LOG_CAPTURE_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        // An unset HOME leaves the base empty; resolution fails at startup
        let base_dir = var("LOG_CAPTURE_BASE_DIR")
            .map(PathBuf::from)
            .or_else(|| var("HOME").map(|home| PathBuf::from(home).join(".log-capture")))
            .unwrap_or_default();

        let components = var("LOG_CAPTURE_COMPONENTS")
            .unwrap_or_else(|| DEFAULT_COMPONENTS.to_string())
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let extensions = var("LOG_CAPTURE_EXTENSIONS")
            .map(|s| parse_extensions(&s))
            .unwrap_or_default();

        let poll_interval_ms: u64 = var("LOG_CAPTURE_POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(1000);

        let max_batch: usize = var("LOG_CAPTURE_MAX_BATCH")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(500);

        Self {
            port,
            base_dir,
            components,
            app_id: var("LOG_CAPTURE_APP_ID"),
            app_name: var("LOG_CAPTURE_APP_NAME"),
            app_display_name: var("LOG_CAPTURE_APP_DISPLAY_NAME"),
            extensions,
            extension_id: var("LOG_CAPTURE_EXTENSION_ID"),
            source_path: var("LOG_CAPTURE_SOURCE_PATH").map(PathBuf::from),
            poll_interval_ms,
            max_batch,
            app_version: var("LOG_CAPTURE_APP_VERSION").unwrap_or_else(|| UNKNOWN.to_string()),
            os_version: var("LOG_CAPTURE_OS_VERSION")
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            device: var("LOG_CAPTURE_DEVICE").unwrap_or_else(|| UNKNOWN.to_string()),
        }
    }

    pub fn convention(&self) -> Convention {
        Convention::new(self.base_dir.clone(), self.components.clone())
    }

    /// `None` when no app id is configured.
    pub fn identity(&self) -> Option<Identity> {
        let app_id = self.app_id.clone()?;

        if let Some(id) = &self.extension_id {
            return Some(Identity::Extension { id: id.clone() });
        }

        let name = self.app_name.clone().unwrap_or_else(|| app_id.clone());
        let mut manifest = Manifest::new(app_id, name);
        manifest.display_name = self.app_display_name.clone();
        for (id, point) in &self.extensions {
            manifest = manifest.with_extension(id.clone(), id.clone(), point.clone());
        }
        Some(Identity::App(manifest))
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            app_version: self.app_version.clone(),
            operating_system_version: self.os_version.clone(),
            device: self.device.clone(),
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_batch: self.max_batch,
        }
    }
}

/// Parse `id:point,id:point`. Malformed pairs are skipped.
fn parse_extensions(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (id, point) = pair.split_once(':')?;
            let (id, point) = (id.trim(), point.trim());
            if id.is_empty() || point.is_empty() {
                log::warn!("Ignoring malformed LOG_CAPTURE_EXTENSIONS entry {:?}", pair);
                return None;
            }
            Some((id.to_string(), point.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("HOME", "/home/dev")]);
        assert_eq!(config.port, 9103);
        assert_eq!(config.base_dir, PathBuf::from("/home/dev/.log-capture"));
        assert_eq!(config.components, vec!["shared"]);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_batch, 500);
        assert_eq!(config.app_version, "unknown");
        assert!(config.identity().is_none());
        assert!(config.source_path.is_none());
    }

    #[test]
    fn test_app_identity_carries_extensions() {
        let config = config(&[
            ("LOG_CAPTURE_BASE_DIR", "/var/lib/capture"),
            ("LOG_CAPTURE_COMPONENTS", "group.example/shared"),
            ("LOG_CAPTURE_APP_ID", "com.example.app"),
            ("LOG_CAPTURE_APP_DISPLAY_NAME", "Example"),
            ("LOG_CAPTURE_EXTENSIONS", "com.example.app.widget:widget, bad, com.example.app.share:share"),
        ]);
        assert_eq!(config.components, vec!["group.example", "shared"]);

        let Some(Identity::App(manifest)) = config.identity() else {
            panic!("expected an app identity");
        };
        assert_eq!(manifest.id, "com.example.app");
        assert_eq!(manifest.name, "com.example.app");
        assert_eq!(manifest.label(), "Example");
        assert_eq!(manifest.extensions.len(), 2);
        assert_eq!(
            manifest.extensions["com.example.app.widget"].extension_point_identifier,
            "widget"
        );

        let store = config
            .convention()
            .log_store_path("com.example.app")
            .unwrap();
        assert_eq!(
            store,
            PathBuf::from("/var/lib/capture/group.example/shared/Logs/com.example.app.sqlite")
        );
    }

    #[test]
    fn test_extension_identity() {
        let config = config(&[
            ("LOG_CAPTURE_APP_ID", "com.example.app"),
            ("LOG_CAPTURE_EXTENSION_ID", "com.example.app.widget"),
        ]);
        match config.identity() {
            Some(Identity::Extension { id }) => assert_eq!(id, "com.example.app.widget"),
            other => panic!("unexpected identity {:?}", other),
        }
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = config(&[
            ("LOG_CAPTURE_PORT", "not-a-port"),
            ("LOG_CAPTURE_POLL_INTERVAL_MS", "0"),
            ("LOG_CAPTURE_MAX_BATCH", "-3"),
        ]);
        assert_eq!(config.port, 9103);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_batch, 500);
        assert_eq!(config.capture_options().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_home_leaves_base_unresolvable() {
        let config = config(&[]);
        assert!(config.convention().root().is_err());
    }
}
