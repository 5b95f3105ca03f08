//! Shared types for the log capture service, its discovery clients and the
//! export format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// =====================================================
// Log Records
// =====================================================

/// Severity of a captured log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Undefined,
    Debug,
    Info,
    Notice,
    Error,
    Fault,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Undefined => "undefined",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Notice => "notice",
            LogLevel::Error => "error",
            LogLevel::Fault => "fault",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "undefined" => Some(LogLevel::Undefined),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "notice" => Some(LogLevel::Notice),
            "error" => Some(LogLevel::Error),
            "fault" => Some(LogLevel::Fault),
            _ => None,
        }
    }
}

/// Kind of a signpost record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignpostType {
    Event,
    IntervalBegin,
    IntervalEnd,
}

impl SignpostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignpostType::Event => "event",
            SignpostType::IntervalBegin => "intervalBegin",
            SignpostType::IntervalEnd => "intervalEnd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(SignpostType::Event),
            "intervalBegin" => Some(SignpostType::IntervalBegin),
            "intervalEnd" => Some(SignpostType::IntervalEnd),
            _ => None,
        }
    }
}

/// A raw record as delivered by a log source.
///
/// Also the element type of `logEntries` in the export format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(with = "iso8601")]
    pub date: DateTime<Utc>,
    pub composed_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signpost_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signpost_type: Option<SignpostType>,
}

impl LogRecord {
    pub fn new(date: DateTime<Utc>, composed_message: impl Into<String>) -> Self {
        Self {
            date,
            composed_message: composed_message.into(),
            level: None,
            category: None,
            subsystem: None,
            signpost_name: None,
            signpost_type: None,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_subsystem(
        mut self,
        subsystem: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        self.subsystem = Some(subsystem.into());
        self.category = Some(category.into());
        self
    }

    pub fn with_signpost(mut self, name: impl Into<String>, kind: SignpostType) -> Self {
        self.signpost_name = Some(name.into());
        self.signpost_type = Some(kind);
        self
    }
}

// =====================================================
// Runs and Entries
// =====================================================

/// Descriptive attributes of one monitored process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub app_version: String,
    pub operating_system_version: String,
    #[serde(with = "iso8601")]
    pub launch_date: DateTime<Utc>,
    pub device: String,
}

/// A persisted run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub info: RunInfo,
}

/// A persisted log record, linked to the run that captured it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub run_id: i64,
    #[serde(flatten)]
    pub record: LogRecord,
}

/// Metadata about the capturing process, supplied by the embedder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub app_version: String,
    pub operating_system_version: String,
    pub device: String,
}

impl DeviceInfo {
    pub fn run_info(&self, launch_date: DateTime<Utc>) -> RunInfo {
        RunInfo {
            app_version: self.app_version.clone(),
            operating_system_version: self.operating_system_version.clone(),
            launch_date,
            device: self.device.clone(),
        }
    }
}

// =====================================================
// Export Format
// =====================================================

/// One run in the export document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunExport {
    pub info: RunInfo,
    pub log_entries: Vec<LogRecord>,
}

/// Render runs as the pretty-printed export document.
///
/// Going through `serde_json::Value` sorts object keys, since its map is
/// BTreeMap-backed.
pub fn export_document(runs: &[RunExport]) -> serde_json::Result<String> {
    let value = serde_json::to_value(runs)?;
    serde_json::to_string_pretty(&value)
}

pub fn parse_export_document(json: &str) -> serde_json::Result<Vec<RunExport>> {
    serde_json::from_str(json)
}

/// ISO-8601 dates with fractional seconds, always in UTC.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(date: &DateTime<Utc>) -> String {
        date.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

// =====================================================
// Manifests
// =====================================================

pub const MANIFEST_VERSION: u32 = 1;

/// Discovery descriptor for one logical app and its extensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub manifest_version: u32,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_companion_app_id: Option<String>,
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub extension_point_identifier: String,
}

impl Manifest {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            manifest_version: MANIFEST_VERSION,
            id: id.into(),
            name: name.into(),
            display_name: None,
            watch_companion_app_id: None,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_extension(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        extension_point_identifier: impl Into<String>,
    ) -> Self {
        self.extensions.insert(
            id.into(),
            ExtensionManifest {
                name: name.into(),
                display_name: None,
                extension_point_identifier: extension_point_identifier.into(),
            },
        );
        self
    }

    /// Display name, falling back to the plain name
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

impl ExtensionManifest {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

// =====================================================
// Discovery Results
// =====================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutableKind {
    Main,
    Extension { point_id: String },
}

/// An executable that has both a manifest entry and a log store on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableContainer {
    pub id: String,
    pub display_name: String,
    pub kind: ExecutableKind,
    pub location: PathBuf,
}

/// A discovered app with its executables, main app first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContainer {
    pub id: String,
    pub display_name: String,
    pub executables: Vec<ExecutableContainer>,
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitChangeRequest {
    pub executable_id: String,
    pub timeout_secs: Option<u64>,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitChangeResponse {
    pub executable_id: String,
    pub changed: bool,
}

// =====================================================
// Service Status
// =====================================================

/// Progress of the ingestion engine in this process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub executable_id: String,
    pub run_id: i64,
    pub cursor: Option<String>,
    pub entries_captured: u64,
    pub last_tick_at: Option<String>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub capture: Option<CaptureStatus>,
    pub discovered_apps: usize,
    pub discovered_executables: usize,
}
