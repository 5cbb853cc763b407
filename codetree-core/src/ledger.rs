use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use codetree_scanner::{Level, VisitRecord, VisitStatus};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub portal_url: String,
    pub configuration: Option<String>,
}

/// Row of the run summary: the record that currently speaks for one path.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub run_id: String,
    pub path_key: String,
    pub major: Option<String>,
    pub mid: Option<String>,
    pub minor: Option<String>,
    pub status: VisitStatus,
    pub recorded_at: DateTime<Utc>,
    pub artifact_path: Option<String>,
    pub original_name: Option<String>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

impl SummaryRow {
    pub fn is_leaf(&self) -> bool {
        self.minor.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryFilter {
    All,
    FailedOnly,
    Run(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VisitCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl VisitCounts {
    pub fn add(&mut self, status: VisitStatus) {
        match status {
            VisitStatus::Success => self.success += 1,
            VisitStatus::Failed => self.failed += 1,
            VisitStatus::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }

    pub fn from_rows(rows: &[SummaryRow]) -> Self {
        let mut counts = Self::default();
        for row in rows {
            counts.add(row.status);
        }
        counts
    }
}

/// Where the walk sends its records. The ledger is the durable sink;
/// [`MemorySink`] keeps everything in memory.
pub trait RecordSink: Send {
    fn begin_run(&mut self, portal_url: &str, configuration: &str) -> Result<String>;
    fn record(&mut self, run_id: &str, record: &VisitRecord) -> Result<()>;
    fn finish_run(&mut self, run_id: &str, status: RunStatus) -> Result<()>;
    /// Path keys that already have a success, used to seed the resume check.
    fn succeeded_keys(&self) -> Result<HashSet<String>>;
}

fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Append-only SQLite store of visit records.
pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn remove(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        for suffix in ["-wal", "-shm"] {
            let side = path.with_file_name(format!(
                "{}{}",
                path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
                suffix
            ));
            if side.exists() {
                fs::remove_file(side)?;
            }
        }
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        // Every autocommitted insert must be on disk before record() returns
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let ledger = Ledger { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let ledger = Ledger { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    status TEXT NOT NULL CHECK(status IN ('running', 'completed', 'failed', 'cancelled')),
    portal_url TEXT NOT NULL,
    configuration TEXT        -- JSON configuration used
);

-- One row per visit attempt, never updated
CREATE TABLE IF NOT EXISTS visits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    path_key TEXT NOT NULL,
    major TEXT,
    mid TEXT,
    minor TEXT,
    status TEXT NOT NULL CHECK(status IN ('success', 'failed', 'skipped')),
    artifact_path TEXT,
    original_name TEXT,
    error_kind TEXT,
    error_detail TEXT,
    recorded_at INTEGER NOT NULL,  -- unix millis

    FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_visits_path ON visits(path_key);
CREATE INDEX IF NOT EXISTS idx_visits_run ON visits(run_id);
CREATE INDEX IF NOT EXISTS idx_visits_status ON visits(status);
            ",
        )?;
        Ok(())
    }

    // Run management
    pub fn create_run(&self, portal_url: &str, configuration: &str) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO runs (id, started_at, status, portal_url, configuration) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&run_id, current_timestamp(), RunStatus::Running.as_str(), portal_url, configuration],
        )?;
        debug!("Created run {}", run_id);
        Ok(run_id)
    }

    pub fn finish_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.as_str(), current_timestamp(), run_id],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("run {}", run_id)));
        }
        Ok(())
    }

    pub fn run_info(&self, run_id: &str) -> Result<Option<RunInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, status, portal_url, configuration FROM runs WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![run_id], run_from_row).optional()?)
    }

    pub fn latest_run(&self) -> Result<Option<RunInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, status, portal_url, configuration
             FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )?;
        Ok(stmt.query_row([], run_from_row).optional()?)
    }

    pub fn runs(&self) -> Result<Vec<RunInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, started_at, finished_at, status, portal_url, configuration
             FROM runs ORDER BY started_at, rowid",
        )?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    // Visits
    pub fn record(&self, run_id: &str, record: &VisitRecord) -> Result<i64> {
        let label = |level: Level| record.path.node(level).map(|n| n.label.as_str());
        let artifact_path = record
            .artifact
            .as_ref()
            .map(|a| a.path.to_string_lossy().into_owned());
        let original_name = record
            .artifact
            .as_ref()
            .and_then(|a| a.original_name.clone());

        self.conn.execute(
            "INSERT INTO visits (
                run_id, path_key, major, mid, minor, status,
                artifact_path, original_name, error_kind, error_detail, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                record.key(),
                label(Level::Major),
                label(Level::Mid),
                label(Level::Minor),
                record.status.as_str(),
                artifact_path,
                original_name,
                record.error_kind,
                record.error_detail,
                record.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn has_succeeded(&self, path_key: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM visits WHERE path_key = ?1 AND status = 'success' LIMIT 1",
                params![path_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn succeeded_keys(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT path_key FROM visits WHERE status = 'success'")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(keys)
    }

    /// One row per path, in order of first appearance. The row is the latest
    /// non-skipped record for the path, or its latest skip when that is all
    /// there is, so a resumed run does not hide an earlier success.
    pub fn export_summary(&self, filter: &SummaryFilter) -> Result<Vec<SummaryRow>> {
        let run_id = match filter {
            SummaryFilter::Run(id) => Some(id.as_str()),
            _ => None,
        };
        let failed_only = matches!(filter, SummaryFilter::FailedOnly);

        let mut stmt = self.conn.prepare(
            "SELECT v.run_id, v.path_key, v.major, v.mid, v.minor, v.status, v.recorded_at,
                    v.artifact_path, v.original_name, v.error_kind, v.error_detail
             FROM visits v
             JOIN (
                 SELECT path_key,
                        MIN(id) AS first_id,
                        COALESCE(MAX(CASE WHEN status <> 'skipped' THEN id END), MAX(id)) AS pick_id
                 FROM visits
                 WHERE ?1 IS NULL OR run_id = ?1
                 GROUP BY path_key
             ) p ON v.id = p.pick_id
             WHERE ?2 = 0 OR v.status = 'failed'
             ORDER BY p.first_id",
        )?;
        let rows = stmt
            .query_map(params![run_id, failed_only], summary_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn failed_paths(&self) -> Result<Vec<SummaryRow>> {
        self.export_summary(&SummaryFilter::FailedOnly)
    }

    /// Distinct leaf paths ever seen, in order of first appearance.
    pub fn discovered_paths(&self, run_id: Option<&str>) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT path_key FROM visits
             WHERE minor IS NOT NULL AND (?1 IS NULL OR run_id = ?1)
             GROUP BY path_key
             ORDER BY MIN(id)",
        )?;
        let keys = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    pub fn visit_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM visits", [], |row| row.get(0))?)
    }

    pub fn get_connection(&self) -> &Connection {
        &self.conn
    }
}

impl RecordSink for Ledger {
    fn begin_run(&mut self, portal_url: &str, configuration: &str) -> Result<String> {
        self.create_run(portal_url, configuration)
    }

    fn record(&mut self, run_id: &str, record: &VisitRecord) -> Result<()> {
        Ledger::record(self, run_id, record).map(|_| ())
    }

    fn finish_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        Ledger::finish_run(self, run_id, status)
    }

    fn succeeded_keys(&self) -> Result<HashSet<String>> {
        Ledger::succeeded_keys(self)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunInfo> {
    let status: String = row.get(3)?;
    Ok(RunInfo {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        portal_url: row.get(4)?,
        configuration: row.get(5)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    let status: String = row.get(5)?;
    let millis: i64 = row.get(6)?;
    Ok(SummaryRow {
        run_id: row.get(0)?,
        path_key: row.get(1)?,
        major: row.get(2)?,
        mid: row.get(3)?,
        minor: row.get(4)?,
        status: VisitStatus::parse(&status).unwrap_or(VisitStatus::Failed),
        recorded_at: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        artifact_path: row.get(7)?,
        original_name: row.get(8)?,
        error_kind: row.get(9)?,
        error_detail: row.get(10)?,
    })
}

/// In-memory [`RecordSink`], for rehearsals and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    runs: Vec<(String, RunStatus)>,
    records: Vec<(String, VisitRecord)>,
    seeded: HashSet<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend these paths succeeded in an earlier run.
    pub fn with_succeeded<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeded.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn records(&self) -> Vec<&VisitRecord> {
        self.records.iter().map(|(_, r)| r).collect()
    }

    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs
            .iter()
            .find(|(id, _)| id == run_id)
            .map(|(_, status)| *status)
    }
}

impl RecordSink for MemorySink {
    fn begin_run(&mut self, _portal_url: &str, _configuration: &str) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.runs.push((run_id.clone(), RunStatus::Running));
        Ok(run_id)
    }

    fn record(&mut self, run_id: &str, record: &VisitRecord) -> Result<()> {
        self.records.push((run_id.to_string(), record.clone()));
        Ok(())
    }

    fn finish_run(&mut self, run_id: &str, status: RunStatus) -> Result<()> {
        let run = self
            .runs
            .iter_mut()
            .find(|(id, _)| id == run_id)
            .ok_or_else(|| CoreError::NotFound(format!("run {}", run_id)))?;
        run.1 = status;
        Ok(())
    }

    fn succeeded_keys(&self) -> Result<HashSet<String>> {
        let mut keys = self.seeded.clone();
        keys.extend(
            self.records
                .iter()
                .filter(|(_, r)| r.status == VisitStatus::Success)
                .map(|(_, r)| r.key()),
        );
        Ok(keys)
    }
}
