//! SQLite run store: one file per executable, holding runs and their entries.
//!
//! Dates are stored as nanoseconds since the Unix epoch so that ordering and
//! `MAX(date)` are plain integer comparisons at the precision sources use.
//! That limits storable dates to the years 1677 through 2262.

use chrono::{DateTime, Utc};
use log_capture_types::*;
use rusqlite::{Connection, Result as SqliteResult};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        // Rollback journal rather than WAL: every commit touches the store
        // file itself, which is what single-file watchers observe.
        conn.execute_batch("PRAGMA journal_mode=DELETE; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app_version TEXT NOT NULL,
                operating_system_version TEXT NOT NULL,
                device TEXT NOT NULL,
                launch_date INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                date INTEGER NOT NULL,
                composed_message TEXT NOT NULL,
                level TEXT,
                category TEXT,
                subsystem TEXT,
                signpost_name TEXT,
                signpost_type TEXT,
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_launch ON runs(launch_date ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_date ON entries(date)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_run_date ON entries(run_id, date ASC)",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Run Operations
    // =====================================================

    pub fn append_run(&self, info: &RunInfo) -> SqliteResult<Run> {
        let conn = self.conn();
        insert_run(&conn, info)
    }

    /// Runs ordered by launch date, each with its entries ordered by date.
    pub fn list_runs(&self) -> SqliteResult<Vec<(Run, Vec<Entry>)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, app_version, operating_system_version, device, launch_date
             FROM runs ORDER BY launch_date ASC, id ASC",
        )?;
        let runs = stmt
            .query_map([], |row| row_to_run(row))?
            .collect::<SqliteResult<Vec<Run>>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, run_id, date, composed_message, level, category, subsystem,
                    signpost_name, signpost_type
             FROM entries WHERE run_id = ?1 ORDER BY date ASC, id ASC",
        )?;
        let mut result = Vec::with_capacity(runs.len());
        for run in runs {
            let entries = stmt
                .query_map([run.id], |row| row_to_entry(row))?
                .collect::<SqliteResult<Vec<Entry>>>()?;
            result.push((run, entries));
        }
        Ok(result)
    }

    pub fn run_count(&self) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
    }

    // =====================================================
    // Entry Operations
    // =====================================================

    /// Append records to a run in a single transaction.
    pub fn append_entries(&self, run: &Run, records: &[LogRecord]) -> SqliteResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        insert_entries(&tx, run.id, records)?;
        tx.commit()?;
        Ok(records.len())
    }

    pub fn max_entry_timestamp(&self) -> SqliteResult<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let max: Option<i64> = conn.query_row("SELECT MAX(date) FROM entries", [], |row| row.get(0))?;
        Ok(max.map(DateTime::from_timestamp_nanos))
    }

    pub fn entry_count(&self) -> SqliteResult<i64> {
        let conn = self.conn();
        conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
    }

    // =====================================================
    // Export / Import
    // =====================================================

    pub fn export_runs(&self) -> SqliteResult<Vec<RunExport>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .map(|(run, entries)| RunExport {
                info: run.info,
                log_entries: entries.into_iter().map(|e| e.record).collect(),
            })
            .collect())
    }

    /// Append exported runs, in document order, in one transaction.
    /// Returns the number of entries imported.
    pub fn import_runs(&self, runs: &[RunExport]) -> SqliteResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut count = 0;
        for exported in runs {
            let run = insert_run(&tx, &exported.info)?;
            insert_entries(&tx, run.id, &exported.log_entries)?;
            count += exported.log_entries.len();
        }
        tx.commit()?;
        Ok(count)
    }
}

fn insert_run(conn: &Connection, info: &RunInfo) -> SqliteResult<Run> {
    let launch_date = to_nanos(&info.launch_date)?;
    conn.execute(
        "INSERT INTO runs (app_version, operating_system_version, device, launch_date)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            info.app_version,
            info.operating_system_version,
            info.device,
            launch_date
        ],
    )?;
    Ok(Run {
        id: conn.last_insert_rowid(),
        info: info.clone(),
    })
}

fn insert_entries(conn: &Connection, run_id: i64, records: &[LogRecord]) -> SqliteResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO entries (
            run_id, date, composed_message, level, category, subsystem,
            signpost_name, signpost_type
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for record in records {
        stmt.execute(rusqlite::params![
            run_id,
            to_nanos(&record.date)?,
            record.composed_message,
            record.level.map(|l| l.as_str()),
            record.category,
            record.subsystem,
            record.signpost_name,
            record.signpost_type.map(|s| s.as_str()),
        ])?;
    }
    Ok(())
}

// =====================================================
// Row Mapping Functions
// =====================================================

pub(crate) fn is_storable(date: &DateTime<Utc>) -> bool {
    date.timestamp_nanos_opt().is_some()
}

fn to_nanos(date: &DateTime<Utc>) -> SqliteResult<i64> {
    date.timestamp_nanos_opt().ok_or_else(|| {
        rusqlite::Error::ToSqlConversionFailure(
            format!("date {} is outside the storable range", date).into(),
        )
    })
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        info: RunInfo {
            app_version: row.get(1)?,
            operating_system_version: row.get(2)?,
            device: row.get(3)?,
            launch_date: DateTime::from_timestamp_nanos(row.get(4)?),
        },
    })
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    let level: Option<String> = row.get(4)?;
    let signpost_type: Option<String> = row.get(8)?;
    Ok(Entry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        record: LogRecord {
            date: DateTime::from_timestamp_nanos(row.get(2)?),
            composed_message: row.get(3)?,
            level: level.as_deref().and_then(LogLevel::parse),
            category: row.get(5)?,
            subsystem: row.get(6)?,
            signpost_name: row.get(7)?,
            signpost_type: signpost_type.as_deref().and_then(SignpostType::parse),
        },
    })
}
