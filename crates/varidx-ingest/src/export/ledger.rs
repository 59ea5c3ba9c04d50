//! Export ledger
//!
//! Per-index, per-batch export status kept in a SQLite file beside the batch
//! table. An interrupted export resumes by skipping batches already marked
//! `exported`; a run that exports everything archives its rows into
//! `export_runs` and clears them.

use crate::error::{IngestError, Result};
use crate::stats::RunReport;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Dispatched but not confirmed
    Pending,
    Exported,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Exported => "exported",
            BatchStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "exported" => Ok(BatchStatus::Exported),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(IngestError::TableMismatch(format!(
                "unknown ledger status '{other}'"
            ))),
        }
    }
}

/// A document that never made it into the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub run_id: String,
    pub index_name: String,
    pub batch_seq: u64,
    pub vid: String,
    pub error: String,
    pub recorded_at: String,
}

/// Ledger location for a batch table: `<table>.ledger`
pub fn ledger_path_for(table: &Path) -> PathBuf {
    let mut name = table.as_os_str().to_os_string();
    name.push(".ledger");
    PathBuf::from(name)
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS batch_exports (
            index_name TEXT NOT NULL,
            batch_seq INTEGER NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'exported', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (index_name, batch_seq)
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            index_name TEXT NOT NULL,
            batch_seq INTEGER NOT NULL,
            vid TEXT NOT NULL,
            error TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS export_runs (
            run_id TEXT PRIMARY KEY,
            index_name TEXT NOT NULL,
            batches INTEGER NOT NULL,
            summary TEXT NOT NULL,
            finished_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dead_letters_index ON dead_letters(index_name, batch_seq)",
        [],
    )?;

    Ok(())
}

/// Shared by every export worker; each call holds the lock briefly
pub struct ExportLedger {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl ExportLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        info!(path = %path.display(), "Opened export ledger");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Ledger held in memory, for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(conn) => conn,
            Err(poisoned) => {
                warn!("Export ledger lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn status(&self, index: &str, seq: u64) -> Result<Option<BatchStatus>> {
        let status: Option<String> = self
            .conn()
            .query_row(
                "SELECT status FROM batch_exports WHERE index_name = ?1 AND batch_seq = ?2",
                params![index, seq as i64],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    /// Batches already confirmed for `index`
    pub fn exported_seqs(&self, index: &str) -> Result<BTreeSet<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT batch_seq FROM batch_exports WHERE index_name = ?1 AND status = 'exported'",
        )?;
        let seqs = stmt
            .query_map(params![index], |row| row.get::<_, i64>(0))?
            .map(|seq| seq.map(|s| s as u64))
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(seqs)
    }

    /// Mark a batch dispatched; counts one more attempt
    pub fn mark_pending(&self, index: &str, seq: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            r#"
            INSERT INTO batch_exports (index_name, batch_seq, status, attempts, started_at, updated_at)
            VALUES (?1, ?2, 'pending', 1, ?3, ?3)
            ON CONFLICT(index_name, batch_seq) DO UPDATE SET
                status = 'pending',
                attempts = attempts + 1,
                updated_at = excluded.updated_at
            "#,
            params![index, seq as i64, now],
        )?;
        Ok(())
    }

    pub fn mark_exported(&self, index: &str, seq: u64) -> Result<()> {
        self.set_status(index, seq, BatchStatus::Exported, None)
    }

    pub fn mark_failed(&self, index: &str, seq: u64, error: &str) -> Result<()> {
        self.set_status(index, seq, BatchStatus::Failed, Some(error))
    }

    fn set_status(
        &self,
        index: &str,
        seq: u64,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = self.conn().execute(
            r#"
            UPDATE batch_exports
            SET status = ?3, last_error = ?4, updated_at = ?5
            WHERE index_name = ?1 AND batch_seq = ?2
            "#,
            params![index, seq as i64, status.as_str(), error, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(IngestError::TableMismatch(format!(
                "batch {seq} for index {index} was never dispatched"
            )));
        }
        Ok(())
    }

    pub fn record_dead_letter(
        &self,
        run_id: Uuid,
        index: &str,
        seq: u64,
        vid: &str,
        error: &str,
    ) -> Result<()> {
        self.conn().execute(
            r#"
            INSERT INTO dead_letters (run_id, index_name, batch_seq, vid, error, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                run_id.to_string(),
                index,
                seq as i64,
                vid,
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn dead_letters(&self, index: &str) -> Result<Vec<DeadLetter>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, index_name, batch_seq, vid, error, recorded_at
            FROM dead_letters
            WHERE index_name = ?1
            ORDER BY id
            "#,
        )?;
        let letters = stmt
            .query_map(params![index], |row| {
                Ok(DeadLetter {
                    run_id: row.get(0)?,
                    index_name: row.get(1)?,
                    batch_seq: row.get::<_, i64>(2)? as u64,
                    vid: row.get(3)?,
                    error: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(letters)
    }

    pub fn count_with_status(&self, index: &str, status: BatchStatus) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM batch_exports WHERE index_name = ?1 AND status = ?2",
            params![index, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Move a finished run into `export_runs` and clear its batch rows
    pub fn archive_run(&self, index: &str, report: &RunReport) -> Result<()> {
        let summary = serde_json::to_string(report)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let batches = tx.execute(
            "DELETE FROM batch_exports WHERE index_name = ?1",
            params![index],
        )?;
        tx.execute(
            r#"
            INSERT INTO export_runs (run_id, index_name, batches, summary, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                report.run_id.to_string(),
                index,
                batches as i64,
                summary,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        info!(index, batches, run_id = %report.run_id, "Archived export run");
        Ok(())
    }

    /// Archived reports for `index`, oldest first
    pub fn archived_runs(&self, index: &str) -> Result<Vec<RunReport>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT summary FROM export_runs WHERE index_name = ?1 ORDER BY finished_at, rowid",
        )?;
        let summaries = stmt
            .query_map(params![index], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        summaries
            .iter()
            .map(|summary| serde_json::from_str(summary).map_err(IngestError::from))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ledger_path() {
        assert_eq!(
            ledger_path_for(Path::new("/data/variants.db")),
            PathBuf::from("/data/variants.db.ledger")
        );
    }

    #[test]
    fn test_status_transitions() {
        let ledger = ExportLedger::in_memory().unwrap();
        assert_eq!(ledger.status("variants", 0).unwrap(), None);

        ledger.mark_pending("variants", 0).unwrap();
        ledger.mark_pending("variants", 1).unwrap();
        assert_eq!(ledger.status("variants", 0).unwrap(), Some(BatchStatus::Pending));

        ledger.mark_exported("variants", 0).unwrap();
        ledger.mark_failed("variants", 1, "HTTP 400").unwrap();
        assert_eq!(ledger.exported_seqs("variants").unwrap(), BTreeSet::from([0]));
        assert_eq!(ledger.count_with_status("variants", BatchStatus::Failed).unwrap(), 1);

        // another index is tracked separately
        assert!(ledger.exported_seqs("other").unwrap().is_empty());

        // re-dispatching a failed batch puts it back to pending
        ledger.mark_pending("variants", 1).unwrap();
        assert_eq!(ledger.status("variants", 1).unwrap(), Some(BatchStatus::Pending));
        let attempts: i64 = ledger
            .conn()
            .query_row(
                "SELECT attempts FROM batch_exports WHERE batch_seq = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_unknown_batch_cannot_be_marked() {
        let ledger = ExportLedger::in_memory().unwrap();
        assert!(ledger.mark_exported("variants", 9).is_err());
    }

    #[test]
    fn test_dead_letters_and_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("variants.db.ledger");
        let run_id = Uuid::new_v4();

        {
            let ledger = ExportLedger::open(&path).unwrap();
            ledger.mark_pending("variants", 0).unwrap();
            ledger.mark_exported("variants", 0).unwrap();
            ledger
                .record_dead_letter(run_id, "variants", 0, "1-5-A-G", "mapper_parsing_exception")
                .unwrap();
        }

        let ledger = ExportLedger::open(&path).unwrap();
        let letters = ledger.dead_letters("variants").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].vid, "1-5-A-G");
        assert_eq!(letters[0].run_id, run_id.to_string());

        let report = RunReport {
            run_id,
            batches_exported: 1,
            ..Default::default()
        };
        ledger.archive_run("variants", &report).unwrap();
        assert!(ledger.exported_seqs("variants").unwrap().is_empty());
        assert_eq!(ledger.archived_runs("variants").unwrap(), vec![report]);
        // dead letters outlive the archive
        assert_eq!(ledger.dead_letters("variants").unwrap().len(), 1);
    }
}
