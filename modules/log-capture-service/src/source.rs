//! Log sources: providers of raw records for the capture loop.
//!
//! A source must return records strictly after the supplied cursor, in
//! increasing date order, and must be able to deliver the same records again
//! when asked with the same cursor (the capture loop retries a cycle whose
//! persist step failed).

use crate::error::{CaptureError, CaptureResult};
use chrono::{DateTime, Utc};
use log_capture_types::LogRecord;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait LogSource: Send + Sync {
    fn entries(&self, after: DateTime<Utc>) -> CaptureResult<Vec<LogRecord>>;
}

// =====================================================
// In-memory source
// =====================================================

/// Records pushed by the embedding process.
#[derive(Default)]
pub struct MemorySource {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSource for MemorySource {
    fn entries(&self, after: DateTime<Utc>) -> CaptureResult<Vec<LogRecord>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(records.iter().filter(|r| r.date > after).cloned().collect())
    }
}

// =====================================================
// JSON-lines file source
// =====================================================

/// A file where each line is one JSON-encoded [`LogRecord`], appended to by
/// some other writer.
///
/// The file is read incrementally. Records that have been read but not yet
/// confirmed (the caller has not advanced its cursor past them) are kept so
/// a retried cycle sees them again.
pub struct JsonLinesSource {
    path: PathBuf,
    state: Mutex<ReadState>,
}

#[derive(Default)]
struct ReadState {
    offset: u64,
    pending: Vec<LogRecord>,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(ReadState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_new_lines(&self, state: &mut ReadState) -> CaptureResult<()> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CaptureError::io(&self.path, e)),
        };

        let len = file
            .metadata()
            .map_err(|e| CaptureError::io(&self.path, e))?
            .len();
        if len < state.offset {
            log::warn!(
                "[SOURCE] {} shrank from {} to {} bytes, reading from the start",
                self.path.display(),
                state.offset,
                len
            );
            state.offset = 0;
            state.pending.clear();
        }
        if len == state.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(state.offset))
            .map_err(|e| CaptureError::io(&self.path, e))?;
        let mut buf = Vec::with_capacity((len - state.offset) as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| CaptureError::io(&self.path, e))?;

        // Only consume complete lines; a trailing partial line is picked up
        // once the writer finishes it.
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(());
        };
        let complete = &buf[..=last_newline];

        for (index, line) in complete.split(|b| *b == b'\n').enumerate() {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<LogRecord>(line) {
                Ok(record) => state.pending.push(record),
                Err(e) => log::warn!(
                    "[SOURCE] Skipping malformed line {} after offset {} in {}: {}",
                    index + 1,
                    state.offset,
                    self.path.display(),
                    e
                ),
            }
        }
        state.offset += complete.len() as u64;
        Ok(())
    }
}

impl LogSource for JsonLinesSource {
    fn entries(&self, after: DateTime<Utc>) -> CaptureResult<Vec<LogRecord>> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Everything up to the cursor has been persisted by the caller.
        state.pending.retain(|r| r.date > after);
        self.read_new_lines(&mut state)?;

        Ok(state
            .pending
            .iter()
            .filter(|r| r.date > after)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn line(secs: i64, message: &str) -> String {
        let record = LogRecord::new(at(secs), message);
        format!("{}\n", serde_json::to_string(&record).unwrap())
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn messages(records: &[LogRecord]) -> Vec<&str> {
        records.iter().map(|r| r.composed_message.as_str()).collect()
    }

    #[test]
    fn test_memory_source_filters_by_cursor() {
        let source = MemorySource::new();
        source.push(LogRecord::new(at(1), "one"));
        source.push(LogRecord::new(at(2), "two"));
        assert_eq!(source.len(), 2);

        assert_eq!(messages(&source.entries(DateTime::<Utc>::MIN_UTC).unwrap()), vec!["one", "two"]);
        assert_eq!(messages(&source.entries(at(1)).unwrap()), vec!["two"]);
        assert!(source.entries(at(2)).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonLinesSource::new(dir.path().join("absent.jsonl"));
        assert!(source.entries(DateTime::<Utc>::MIN_UTC).unwrap().is_empty());
    }

    #[test]
    fn test_reads_incrementally_and_redelivers_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.jsonl");
        append(&path, &line(1, "one"));
        append(&path, &line(2, "two"));

        let source = JsonLinesSource::new(&path);
        let first = source.entries(DateTime::<Utc>::MIN_UTC).unwrap();
        assert_eq!(messages(&first), vec!["one", "two"]);

        // Same cursor again, as after a failed persist
        let retry = source.entries(DateTime::<Utc>::MIN_UTC).unwrap();
        assert_eq!(messages(&retry), vec!["one", "two"]);

        append(&path, &line(3, "three"));
        let next = source.entries(at(2)).unwrap();
        assert_eq!(messages(&next), vec!["three"]);
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.jsonl");
        let full = line(1, "one");
        let (head, tail) = full.split_at(10);
        append(&path, head);

        let source = JsonLinesSource::new(&path);
        assert!(source.entries(DateTime::<Utc>::MIN_UTC).unwrap().is_empty());

        append(&path, tail);
        assert_eq!(
            messages(&source.entries(DateTime::<Utc>::MIN_UTC).unwrap()),
            vec!["one"]
        );
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.jsonl");
        append(&path, &line(1, "one"));
        append(&path, "not json\n\n");
        append(&path, &line(2, "two"));

        let source = JsonLinesSource::new(&path);
        assert_eq!(
            messages(&source.entries(DateTime::<Utc>::MIN_UTC).unwrap()),
            vec!["one", "two"]
        );
    }

    #[test]
    fn test_truncated_file_is_read_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.jsonl");
        append(&path, &line(1, "one"));
        append(&path, &line(2, "two"));

        let source = JsonLinesSource::new(&path);
        assert_eq!(source.entries(DateTime::<Utc>::MIN_UTC).unwrap().len(), 2);

        std::fs::write(&path, line(5, "rotated")).unwrap();
        assert_eq!(messages(&source.entries(at(2)).unwrap()), vec!["rotated"]);
    }
}
