//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Every write runs in
//! one transaction, so a commit (rows, metadata, batch index and optional
//! checkpoint advance) becomes visible all at once or not at all.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use medallion_types::record::Row;
use medallion_types::schema::SchemaDefinition;
use medallion_types::state::{
    Checkpoint, CheckpointKey, DatasetId, Layer, QuarantineRecord, RunRecord, RunStats,
    RunStatus, TableName,
};
use medallion_types::table::{
    CommitInfo, CommitRequest, Operation, TableChange, TableSnapshot, VersionId,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS table_heads (
    table_name TEXT PRIMARY KEY,
    head_version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS table_commits (
    table_name TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    committed_at TEXT NOT NULL,
    operation TEXT NOT NULL,
    input_batch_ids TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    quality_report TEXT,
    details TEXT,
    PRIMARY KEY (table_name, version_id)
);

CREATE TABLE IF NOT EXISTS table_rows (
    table_name TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    ordinal INTEGER NOT NULL,
    row_json TEXT NOT NULL,
    PRIMARY KEY (table_name, version_id, ordinal)
);

CREATE TABLE IF NOT EXISTS batch_index (
    table_name TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    PRIMARY KEY (table_name, batch_id)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    table_name TEXT NOT NULL,
    layer TEXT NOT NULL,
    upstream_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (table_name, layer)
);

CREATE TABLE IF NOT EXISTS schemas (
    table_name TEXT NOT NULL,
    version INTEGER NOT NULL,
    definition TEXT NOT NULL,
    registered_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (table_name, version)
);

CREATE TABLE IF NOT EXISTS stage_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset TEXT NOT NULL,
    layer TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_read INTEGER DEFAULT 0,
    records_written INTEGER DEFAULT 0,
    records_quarantined INTEGER DEFAULT 0,
    version_id INTEGER,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS quarantine_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES stage_runs(id),
    table_name TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    record_json TEXT NOT NULL,
    reason TEXT NOT NULL,
    quarantined_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_quarantine_dataset_run ON quarantine_records (dataset, run_id);
CREATE INDEX IF NOT EXISTS idx_runs_dataset ON stage_runs (dataset, id);
";

/// Upper bound for open-ended version ranges (largest value `SQLite` stores).
#[allow(clippy::cast_sign_loss)]
const MAX_SQL_VERSION: VersionId = i64::MAX as VersionId;

const COMMIT_COLUMNS: &str =
    "version_id, committed_at, operation, input_batch_ids, row_count, quality_report, details";

#[allow(clippy::cast_possible_wrap)]
fn version_to_sql(version: VersionId) -> i64 {
    version as i64
}

#[allow(clippy::cast_sign_loss)]
fn version_from_sql(version: i64) -> VersionId {
    version as VersionId
}

#[allow(clippy::cast_possible_wrap)]
fn count_to_sql(count: u64) -> i64 {
    count as i64
}

#[allow(clippy::cast_sign_loss)]
fn count_from_sql(count: i64) -> u64 {
    count.max(0) as u64
}

/// Commit metadata as stored, before decoding.
struct StoredCommit {
    version_id: i64,
    committed_at: String,
    operation: String,
    input_batch_ids: String,
    row_count: i64,
    quality_report: Option<String>,
    details: Option<String>,
}

impl StoredCommit {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            version_id: row.get(0)?,
            committed_at: row.get(1)?,
            operation: row.get(2)?,
            input_batch_ids: row.get(3)?,
            row_count: row.get(4)?,
            quality_report: row.get(5)?,
            details: row.get(6)?,
        })
    }

    fn decode(self, table: &TableName) -> error::Result<CommitInfo> {
        let operation = Operation::parse(&self.operation).ok_or_else(|| {
            StateError::Corrupt(format!(
                "table '{table}' v{} has unknown operation '{}'",
                self.version_id, self.operation
            ))
        })?;
        let committed_at = DateTime::parse_from_rfc3339(&self.committed_at)
            .map_err(|e| {
                StateError::Corrupt(format!(
                    "table '{table}' v{} has bad commit time: {e}",
                    self.version_id
                ))
            })?
            .with_timezone(&Utc);
        Ok(CommitInfo {
            table: table.clone(),
            version_id: version_from_sql(self.version_id),
            committed_at,
            operation,
            input_batch_ids: serde_json::from_str(&self.input_batch_ids)?,
            row_count: count_from_sql(self.row_count),
            quality_report: self
                .quality_report
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            details: self.details.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("in_memory: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn read_head(conn: &Connection, table: &TableName) -> error::Result<Option<VersionId>> {
        conn.query_row(
            "SELECT head_version FROM table_heads WHERE table_name = ?1",
            [table.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|head| head.map(version_from_sql))
        .map_err(|e| StateError::backend_context("head_version", e))
    }

    fn read_checkpoint(conn: &Connection, key: &CheckpointKey) -> error::Result<Option<Checkpoint>> {
        conn.query_row(
            "SELECT upstream_version, updated_at FROM checkpoints \
             WHERE table_name = ?1 AND layer = ?2",
            params![key.table.as_str(), key.layer.as_str()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()
        .map_err(|e| StateError::backend_context("get_checkpoint", e))
        .map(|found| {
            found.map(|(upstream, updated_at)| Checkpoint {
                key: key.clone(),
                upstream_version: version_from_sql(upstream),
                updated_at: Self::sqlite_to_iso8601(&updated_at),
            })
        })
    }

    /// CAS + monotonic checkpoint write. Caller owns the transaction.
    fn apply_checkpoint(
        conn: &Connection,
        key: &CheckpointKey,
        expected: Option<VersionId>,
        new: VersionId,
    ) -> error::Result<()> {
        let current = Self::read_checkpoint(conn, key)?.map(|cp| cp.upstream_version);
        if current != expected {
            return Err(StateError::CheckpointConflict {
                key: key.clone(),
                expected,
                actual: current,
            });
        }
        if let Some(current) = current {
            if new < current {
                return Err(StateError::CheckpointRegression {
                    key: key.clone(),
                    current,
                    requested: new,
                });
            }
        }
        conn.execute(
            "INSERT INTO checkpoints (table_name, layer, upstream_version, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(table_name, layer) \
             DO UPDATE SET upstream_version = ?3, updated_at = ?4",
            params![
                key.table.as_str(),
                key.layer.as_str(),
                version_to_sql(new),
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StateError::backend_context("advance_checkpoint: upsert", e))?;
        Ok(())
    }

    fn load_rows(
        conn: &Connection,
        table: &TableName,
        from: VersionId,
        to: VersionId,
    ) -> error::Result<Vec<Row>> {
        let mut stmt = conn
            .prepare(
                "SELECT row_json FROM table_rows \
                 WHERE table_name = ?1 AND version_id BETWEEN ?2 AND ?3 \
                 ORDER BY version_id, ordinal",
            )
            .map_err(|e| StateError::backend_context("read rows: prepare", e))?;
        let raw = stmt
            .query_map(
                params![table.as_str(), version_to_sql(from), version_to_sql(to)],
                |row| row.get::<_, String>(0),
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .map_err(|e| StateError::backend_context("read rows: query", e))?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StateError::from))
            .collect()
    }

    fn load_commits(
        conn: &Connection,
        table: &TableName,
        after: VersionId,
        upto: VersionId,
    ) -> error::Result<Vec<CommitInfo>> {
        let sql = format!(
            "SELECT {COMMIT_COLUMNS} FROM table_commits \
             WHERE table_name = ?1 AND version_id > ?2 AND version_id <= ?3 \
             ORDER BY version_id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StateError::backend_context("read commits: prepare", e))?;
        let stored = stmt
            .query_map(
                params![table.as_str(), version_to_sql(after), version_to_sql(upto)],
                StoredCommit::from_row,
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<StoredCommit>>>())
            .map_err(|e| StateError::backend_context("read commits: query", e))?;
        stored.into_iter().map(|c| c.decode(table)).collect()
    }
}

impl StateBackend for SqliteStateBackend {
    fn head_version(&self, table: &TableName) -> error::Result<Option<VersionId>> {
        let conn = self.lock_conn()?;
        Self::read_head(&conn, table)
    }

    fn commit(&self, table: &TableName, request: CommitRequest) -> error::Result<CommitInfo> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("commit: begin tx", e))?;

        let current = Self::read_head(&tx, table)?;
        if current != request.expected_head {
            return Err(StateError::VersionConflict {
                table: table.to_string(),
                expected: request.expected_head,
                actual: current,
            });
        }
        let version_id = current.map_or(1, |head| head + 1);
        let version_sql = version_to_sql(version_id);
        let committed_at = Utc::now().trunc_subsecs(6);
        let row_count = request.rows.len() as u64;

        let batch_ids_json = serde_json::to_string(&request.input_batch_ids)?;
        let report_json = request
            .quality_report
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let details_json = request.details.as_ref().map(serde_json::to_string).transpose()?;

        tx.execute(
            "INSERT INTO table_heads (table_name, head_version) VALUES (?1, ?2) \
             ON CONFLICT(table_name) DO UPDATE SET head_version = ?2",
            params![table.as_str(), version_sql],
        )
        .map_err(|e| StateError::backend_context("commit: move head", e))?;

        tx.execute(
            "INSERT INTO table_commits \
             (table_name, version_id, committed_at, operation, input_batch_ids, row_count, quality_report, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                table.as_str(),
                version_sql,
                committed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                request.operation.as_str(),
                batch_ids_json,
                count_to_sql(row_count),
                report_json,
                details_json,
            ],
        )
        .map_err(|e| StateError::backend_context("commit: insert metadata", e))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO table_rows (table_name, version_id, ordinal, row_json) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| StateError::backend_context("commit: prepare rows", e))?;
            for (ordinal, row) in request.rows.iter().enumerate() {
                let row_json = serde_json::to_string(row)?;
                stmt.execute(params![
                    table.as_str(),
                    version_sql,
                    count_to_sql(ordinal as u64),
                    row_json
                ])
                .map_err(|e| StateError::backend_context("commit: insert row", e))?;
            }

            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO batch_index (table_name, batch_id, version_id) \
                     VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| StateError::backend_context("commit: prepare batch index", e))?;
            for batch_id in &request.input_batch_ids {
                stmt.execute(params![table.as_str(), batch_id, version_sql])
                    .map_err(|e| StateError::backend_context("commit: index batch", e))?;
            }
        }

        if let Some(advance) = &request.checkpoint {
            Self::apply_checkpoint(&tx, &advance.key, advance.expected, advance.new)?;
        }

        tx.commit()
            .map_err(|e| StateError::backend_context("commit: commit tx", e))?;

        tracing::debug!(
            table = table.as_str(),
            version_id,
            operation = request.operation.as_str(),
            rows = row_count,
            "Committed table version"
        );

        Ok(CommitInfo {
            table: table.clone(),
            version_id,
            committed_at,
            operation: request.operation,
            input_batch_ids: request.input_batch_ids,
            row_count,
            quality_report: request.quality_report,
            details: request.details,
        })
    }

    fn read_table(
        &self,
        table: &TableName,
        version: Option<VersionId>,
    ) -> error::Result<TableSnapshot> {
        let conn = self.lock_conn()?;
        let head = Self::read_head(&conn, table)?;
        let target = match (version, head) {
            (None, None) => {
                return Ok(TableSnapshot {
                    table: table.clone(),
                    version: None,
                    rows: Vec::new(),
                })
            }
            (None, Some(head)) => head,
            (Some(v), Some(head)) if v >= 1 && v <= head => v,
            (Some(v), _) => {
                return Err(StateError::VersionNotFound {
                    table: table.to_string(),
                    version: v,
                })
            }
        };

        // Newest full snapshot at or before the target; appends replay on top.
        let base: Option<i64> = conn
            .query_row(
                "SELECT MAX(version_id) FROM table_commits \
                 WHERE table_name = ?1 AND version_id <= ?2 AND operation != 'append'",
                params![table.as_str(), version_to_sql(target)],
                |row| row.get(0),
            )
            .map_err(|e| StateError::backend_context("read_table: find base", e))?;
        let from = base.map_or(1, version_from_sql);

        let rows = Self::load_rows(&conn, table, from, target)?;
        Ok(TableSnapshot {
            table: table.clone(),
            version: Some(target),
            rows,
        })
    }

    fn read_changes(
        &self,
        table: &TableName,
        after: Option<VersionId>,
        upto: Option<VersionId>,
    ) -> error::Result<Vec<TableChange>> {
        let conn = self.lock_conn()?;
        let commits = Self::load_commits(
            &conn,
            table,
            after.unwrap_or(0),
            upto.unwrap_or(MAX_SQL_VERSION),
        )?;
        commits
            .into_iter()
            .map(|commit| {
                let rows =
                    Self::load_rows(&conn, table, commit.version_id, commit.version_id)?;
                Ok(TableChange { commit, rows })
            })
            .collect()
    }

    fn history(&self, table: &TableName) -> error::Result<Vec<CommitInfo>> {
        let conn = self.lock_conn()?;
        Self::load_commits(&conn, table, 0, MAX_SQL_VERSION)
    }

    fn find_batch(&self, table: &TableName, batch_id: &str) -> error::Result<Option<VersionId>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT version_id FROM batch_index WHERE table_name = ?1 AND batch_id = ?2",
            params![table.as_str(), batch_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map(|found| found.map(version_from_sql))
        .map_err(|e| StateError::backend_context("find_batch", e))
    }

    fn get_checkpoint(&self, key: &CheckpointKey) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        Self::read_checkpoint(&conn, key)
    }

    fn advance_checkpoint(
        &self,
        key: &CheckpointKey,
        expected: Option<VersionId>,
        new: VersionId,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("advance_checkpoint: begin tx", e))?;
        Self::apply_checkpoint(&tx, key, expected, new)?;
        tx.commit()
            .map_err(|e| StateError::backend_context("advance_checkpoint: commit", e))
    }

    fn schema_versions(&self, table: &TableName) -> error::Result<Vec<SchemaDefinition>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT definition FROM schemas WHERE table_name = ?1 ORDER BY version")
            .map_err(|e| StateError::backend_context("schema_versions: prepare", e))?;
        let raw = stmt
            .query_map([table.as_str()], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .map_err(|e| StateError::backend_context("schema_versions: query", e))?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StateError::from))
            .collect()
    }

    fn insert_schema(
        &self,
        schema: &SchemaDefinition,
        expected_latest: Option<u32>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_schema: begin tx", e))?;

        let latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM schemas WHERE table_name = ?1",
                [schema.table.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StateError::backend_context("insert_schema: read latest", e))?;
        let latest = latest
            .map(|v| {
                u32::try_from(v).map_err(|_| {
                    StateError::Corrupt(format!(
                        "schema '{}' has out-of-range version {v}",
                        schema.table
                    ))
                })
            })
            .transpose()?;
        if latest != expected_latest {
            return Err(StateError::SchemaVersionConflict {
                table: schema.table.to_string(),
                expected: expected_latest,
                actual: latest,
            });
        }

        let definition = serde_json::to_string(schema)?;
        tx.execute(
            "INSERT INTO schemas (table_name, version, definition) VALUES (?1, ?2, ?3)",
            params![schema.table.as_str(), schema.version, definition],
        )
        .map_err(|e| StateError::backend_context("insert_schema: insert", e))?;
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_schema: commit", e))
    }

    fn start_run(&self, dataset: &DatasetId, layer: Layer) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO stage_runs (dataset, layer, status) VALUES (?1, ?2, ?3)",
            params![dataset.as_str(), layer.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE stage_runs SET status = ?1, finished_at = datetime('now'), \
             records_read = ?2, records_written = ?3, records_quarantined = ?4, \
             version_id = ?5, error_message = ?6 \
             WHERE id = ?7",
            params![
                status.as_str(),
                count_to_sql(stats.records_read),
                count_to_sql(stats.records_written),
                count_to_sql(stats.records_quarantined),
                stats.version_id.map(version_to_sql),
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    fn list_runs(&self, dataset: &DatasetId) -> error::Result<Vec<RunRecord>> {
        type RawRun = (
            i64,
            String,
            String,
            String,
            Option<String>,
            i64,
            i64,
            i64,
            Option<i64>,
            Option<String>,
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, layer, status, started_at, finished_at, records_read, \
                 records_written, records_quarantined, version_id, error_message \
                 FROM stage_runs WHERE dataset = ?1 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("list_runs: prepare", e))?;
        let raw = stmt
            .query_map([dataset.as_str()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                    row.get(8)?,
                    row.get(9)?,
                ))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<RawRun>>>())
            .map_err(|e| StateError::backend_context("list_runs: query", e))?;

        raw.into_iter()
            .map(
                |(id, layer, status, started, finished, read, written, quarantined, version, err)| {
                    let layer = layer.parse::<Layer>().map_err(|e| {
                        StateError::Corrupt(format!("run {id}: {e}"))
                    })?;
                    let status = RunStatus::parse(&status).ok_or_else(|| {
                        StateError::Corrupt(format!("run {id}: unknown status '{status}'"))
                    })?;
                    Ok(RunRecord {
                        run_id: id,
                        dataset: dataset.clone(),
                        layer,
                        status,
                        started_at: Self::sqlite_to_iso8601(&started),
                        finished_at: finished.as_deref().map(Self::sqlite_to_iso8601),
                        stats: RunStats {
                            records_read: count_from_sql(read),
                            records_written: count_from_sql(written),
                            records_quarantined: count_from_sql(quarantined),
                            version_id: version.map(version_from_sql),
                            error_message: err,
                        },
                    })
                },
            )
            .collect()
    }

    fn insert_quarantine_records(
        &self,
        dataset: &DatasetId,
        run_id: i64,
        records: &[QuarantineRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_quarantine_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO quarantine_records \
                 (dataset, run_id, table_name, batch_id, record_json, reason, quarantined_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(|e| StateError::backend_context("insert_quarantine_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(params![
                dataset.as_str(),
                run_id,
                record.table.as_str(),
                record.batch_id,
                record.record_json,
                record.reason,
                record.quarantined_at,
            ])
            .map_err(|e| StateError::backend_context("insert_quarantine_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_quarantine_records: commit", e))?;

        Ok(count)
    }

    fn list_quarantine_records(&self, dataset: &DatasetId) -> error::Result<Vec<QuarantineRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT table_name, batch_id, record_json, reason, quarantined_at \
                 FROM quarantine_records WHERE dataset = ?1 ORDER BY id",
            )
            .map_err(|e| StateError::backend_context("list_quarantine_records: prepare", e))?;
        let rows = stmt
            .query_map(params![dataset.as_str()], |row| {
                Ok(QuarantineRecord {
                    table: TableName::new(row.get::<_, String>(0)?),
                    batch_id: row.get(1)?,
                    record_json: row.get(2)?,
                    reason: row.get(3)?,
                    quarantined_at: row.get(4)?,
                })
            })
            .map_err(|e| StateError::backend_context("list_quarantine_records: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("list_quarantine_records: read", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_types::record::Record;
    use medallion_types::schema::ColumnSpec;
    use medallion_types::state::CheckpointAdvance;
    use medallion_types::value::{ColumnType, Value};

    fn table(name: &str) -> TableName {
        TableName::new(name)
    }

    fn row(id: i64) -> Row {
        Row::new([("id", Value::Int(id))].into_iter().collect::<Record>())
    }

    fn ids(snapshot: &TableSnapshot) -> Vec<i64> {
        snapshot
            .rows
            .iter()
            .map(|r| match r.record.get("id") {
                Some(Value::Int(id)) => *id,
                other => panic!("unexpected id {other:?}"),
            })
            .collect()
    }

    fn append(backend: &SqliteStateBackend, t: &TableName, rows: Vec<Row>) -> CommitInfo {
        let head = backend.head_version(t).unwrap();
        backend
            .commit(t, CommitRequest::new(Operation::Append, head, rows))
            .unwrap()
    }

    #[test]
    fn empty_table_has_no_head() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert_eq!(backend.head_version(&table("t")).unwrap(), None);
        let snapshot = backend.read_table(&table("t"), None).unwrap();
        assert_eq!(snapshot.version, None);
        assert!(snapshot.rows.is_empty());
    }

    #[test]
    fn versions_start_at_one_and_increase() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("bronze_orders");
        let first = append(&backend, &t, vec![row(1)]);
        let second = append(&backend, &t, vec![row(2), row(3)]);
        assert_eq!(first.version_id, 1);
        assert_eq!(second.version_id, 2);
        assert_eq!(second.row_count, 2);
        assert_eq!(backend.head_version(&t).unwrap(), Some(2));
    }

    #[test]
    fn stale_head_is_rejected() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("t");
        append(&backend, &t, vec![row(1)]);

        let err = backend
            .commit(&t, CommitRequest::new(Operation::Append, None, vec![row(2)]))
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::VersionConflict {
                expected: None,
                actual: Some(1),
                ..
            }
        ));
        assert!(err.is_transient());
        assert_eq!(ids(&backend.read_table(&t, None).unwrap()), vec![1]);
    }

    #[test]
    fn time_travel_replays_appends_over_snapshots() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("t");
        append(&backend, &t, vec![row(1)]);
        append(&backend, &t, vec![row(2)]);
        backend
            .commit(
                &t,
                CommitRequest::new(Operation::Merge, Some(2), vec![row(9)]),
            )
            .unwrap();
        append(&backend, &t, vec![row(10)]);

        assert_eq!(ids(&backend.read_table(&t, Some(1)).unwrap()), vec![1]);
        assert_eq!(ids(&backend.read_table(&t, Some(2)).unwrap()), vec![1, 2]);
        assert_eq!(ids(&backend.read_table(&t, Some(3)).unwrap()), vec![9]);
        assert_eq!(ids(&backend.read_table(&t, None).unwrap()), vec![9, 10]);
    }

    #[test]
    fn missing_version_is_an_error() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("t");
        append(&backend, &t, vec![row(1)]);
        for version in [0, 2] {
            let err = backend.read_table(&t, Some(version)).unwrap_err();
            assert!(matches!(err, StateError::VersionNotFound { .. }), "v{version}");
        }
    }

    #[test]
    fn read_changes_returns_rows_per_commit() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("t");
        append(&backend, &t, vec![row(1)]);
        append(&backend, &t, vec![row(2), row(3)]);
        append(&backend, &t, vec![row(4)]);

        let changes = backend.read_changes(&t, Some(1), Some(2)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].commit.version_id, 2);
        assert_eq!(changes[0].rows.len(), 2);

        let all = backend.read_changes(&t, None, None).unwrap();
        assert_eq!(
            all.iter().map(|c| c.commit.version_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn commit_metadata_roundtrips_through_history() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("t");
        let request = CommitRequest::new(Operation::Append, None, vec![row(1)])
            .with_batch_ids(vec!["b-1".into()])
            .with_details(serde_json::json!({"source": "pos"}));
        let info = backend.commit(&t, request).unwrap();

        let history = backend.history(&t).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].input_batch_ids, vec!["b-1".to_string()]);
        assert_eq!(history[0].details, Some(serde_json::json!({"source": "pos"})));
        assert_eq!(history[0].committed_at, info.committed_at);
        assert_eq!(backend.find_batch(&t, "b-1").unwrap(), Some(1));
        assert_eq!(backend.find_batch(&t, "b-2").unwrap(), None);
    }

    #[test]
    fn checkpoint_cas_and_monotonic() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let key = CheckpointKey::new("silver_orders", Layer::Silver);
        assert!(backend.get_checkpoint(&key).unwrap().is_none());

        backend.advance_checkpoint(&key, None, 2).unwrap();
        let err = backend.advance_checkpoint(&key, None, 3).unwrap_err();
        assert!(matches!(err, StateError::CheckpointConflict { .. }));

        let err = backend.advance_checkpoint(&key, Some(2), 1).unwrap_err();
        assert!(matches!(err, StateError::CheckpointRegression { .. }));

        backend.advance_checkpoint(&key, Some(2), 2).unwrap();
        backend.advance_checkpoint(&key, Some(2), 5).unwrap();
        let cp = backend.get_checkpoint(&key).unwrap().unwrap();
        assert_eq!(cp.upstream_version, 5);
        assert!(cp.updated_at.ends_with('Z'));
    }

    #[test]
    fn rejected_checkpoint_rolls_back_commit() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("silver_orders");
        let key = CheckpointKey::new(t.clone(), Layer::Silver);
        backend.advance_checkpoint(&key, None, 4).unwrap();

        let request = CommitRequest::new(Operation::Merge, None, vec![row(1)])
            .with_batch_ids(vec!["b-1".into()])
            .with_checkpoint(CheckpointAdvance {
                key: key.clone(),
                expected: Some(3),
                new: 5,
            });
        let err = backend.commit(&t, request).unwrap_err();
        assert!(matches!(err, StateError::CheckpointConflict { .. }));

        assert_eq!(backend.head_version(&t).unwrap(), None);
        assert_eq!(backend.find_batch(&t, "b-1").unwrap(), None);
        assert_eq!(
            backend.get_checkpoint(&key).unwrap().unwrap().upstream_version,
            4
        );
    }

    #[test]
    fn commit_with_checkpoint_moves_both() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t = table("gold_daily");
        let key = CheckpointKey::new(t.clone(), Layer::Gold);
        let request = CommitRequest::new(Operation::Overwrite, None, vec![row(1)])
            .with_checkpoint(CheckpointAdvance {
                key: key.clone(),
                expected: None,
                new: 7,
            });
        backend.commit(&t, request).unwrap();
        assert_eq!(backend.head_version(&t).unwrap(), Some(1));
        assert_eq!(
            backend.get_checkpoint(&key).unwrap().unwrap().upstream_version,
            7
        );
    }

    #[test]
    fn schema_insert_is_compare_and_set() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let v1 = SchemaDefinition::new("orders", 1)
            .with_column("id", ColumnSpec::new(ColumnType::Integer).required());
        backend.insert_schema(&v1, None).unwrap();

        let err = backend.insert_schema(&v1, None).unwrap_err();
        assert!(matches!(
            err,
            StateError::SchemaVersionConflict {
                actual: Some(1),
                ..
            }
        ));

        let v2 = v1
            .clone()
            .with_column("note", ColumnSpec::new(ColumnType::String));
        let v2 = SchemaDefinition { version: 2, ..v2 };
        backend.insert_schema(&v2, Some(1)).unwrap();

        let versions = backend.schema_versions(&table("orders")).unwrap();
        assert_eq!(versions, vec![v1, v2]);
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let dataset = DatasetId::new("orders");
        let run_id = backend.start_run(&dataset, Layer::Bronze).unwrap();
        assert!(run_id > 0);

        backend
            .complete_run(
                run_id,
                RunStatus::Completed,
                &RunStats {
                    records_read: 100,
                    records_written: 95,
                    records_quarantined: 5,
                    version_id: Some(1),
                    error_message: None,
                },
            )
            .unwrap();

        let runs = backend.list_runs(&dataset).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].layer, Layer::Bronze);
        assert_eq!(runs[0].stats.records_quarantined, 5);
        assert_eq!(runs[0].stats.version_id, Some(1));
        assert!(runs[0].finished_at.is_some());
    }

    #[test]
    fn runs_are_scoped_per_dataset() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let a = DatasetId::new("a");
        let b = DatasetId::new("b");
        let first = backend.start_run(&a, Layer::Silver).unwrap();
        let second = backend.start_run(&b, Layer::Silver).unwrap();
        assert!(second > first);
        assert_eq!(backend.list_runs(&a).unwrap().len(), 1);
        assert_eq!(backend.list_runs(&b).unwrap()[0].status, RunStatus::Running);
    }

    fn quarantine(batch_id: &str, json: &str) -> QuarantineRecord {
        QuarantineRecord {
            table: table("bronze_orders"),
            batch_id: batch_id.into(),
            record_json: json.into(),
            reason: "customer_id: required value is null".into(),
            quarantined_at: "2026-02-21T12:00:00Z".into(),
        }
    }

    #[test]
    fn quarantine_records_insert_and_count() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let dataset = DatasetId::new("orders");
        let run_id = backend.start_run(&dataset, Layer::Bronze).unwrap();
        let records = vec![
            quarantine("b-1", r#"{"id":1}"#),
            quarantine("b-1", r#"{"id":2}"#),
        ];
        let count = backend
            .insert_quarantine_records(&dataset, run_id, &records)
            .unwrap();
        assert_eq!(count, 2);
        let stored = backend.list_quarantine_records(&dataset).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].record_json, r#"{"id":2}"#);
    }

    #[test]
    fn quarantine_records_empty_insert() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let count = backend
            .insert_quarantine_records(&DatasetId::new("orders"), 1, &[])
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn quarantine_records_invalid_run_id_includes_operation_context() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let err = backend
            .insert_quarantine_records(
                &DatasetId::new("orders"),
                999,
                &[quarantine("b-1", r#"{"id":1}"#)],
            )
            .expect_err("invalid run id should fail");
        assert!(err.to_string().contains("insert_quarantine_records"));
    }

    #[test]
    fn file_backed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let t = table("t");
        {
            let backend = SqliteStateBackend::open(&path).unwrap();
            append(&backend, &t, vec![row(1), row(2)]);
        }
        let backend = SqliteStateBackend::open(&path).unwrap();
        assert_eq!(backend.head_version(&t).unwrap(), Some(1));
        assert_eq!(ids(&backend.read_table(&t, None).unwrap()), vec![1, 2]);
    }

    #[test]
    fn sqlite_to_iso8601_conversion() {
        let iso = SqliteStateBackend::sqlite_to_iso8601("2024-01-15 10:00:00");
        assert_eq!(iso, "2024-01-15T10:00:00Z");
    }
}
