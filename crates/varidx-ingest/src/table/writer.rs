//! Append-only batch table writer
//!
//! Single writer per table file. Every batch goes in as one transaction, so
//! a crash leaves either the whole batch or none of it.

use crate::error::{IngestError, Result};
use crate::flatten::FlattenedVariantRecord;
use crate::stats::RunReport;
use crate::table::batch::{Batch, BatchOutcome, Batcher};
use crate::table::schema::{self, ListColumns};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub(crate) fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM table_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO table_meta (key, value) VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![key, value],
    )?;
    Ok(())
}

pub struct BatchTableWriter {
    conn: Connection,
    path: PathBuf,
    shard: u32,
    /// Checksums of batches already on disk, by sequence number
    existing: BTreeMap<u64, String>,
    batcher: Batcher,
    insert_sql: String,
}

impl BatchTableWriter {
    /// Open (or create) the table at `path`
    ///
    /// Reopening a table written with another `batch_size` is a
    /// [`IngestError::TableMismatch`]: sequence numbers would no longer line
    /// up with the same records.
    pub fn open(path: &Path, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(IngestError::config("batch size must be greater than 0"));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        // surface an unwritable path as an IO error before SQLite sees it
        OpenOptions::new().create(true).append(true).open(path)?;

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn)?;

        match get_meta(&conn, schema::META_BATCH_SIZE)? {
            Some(stored) if stored != batch_size.to_string() => {
                return Err(IngestError::TableMismatch(format!(
                    "{} was written with batch size {stored}, not {batch_size}",
                    path.display()
                )));
            }
            Some(_) => {}
            None => set_meta(&conn, schema::META_BATCH_SIZE, &batch_size.to_string())?,
        }
        match get_meta(&conn, schema::META_SCHEMA_VERSION)? {
            Some(stored) if stored != schema::SCHEMA_VERSION => {
                return Err(IngestError::TableMismatch(format!(
                    "{} has schema version {stored}, expected {}",
                    path.display(),
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
            None => set_meta(&conn, schema::META_SCHEMA_VERSION, schema::SCHEMA_VERSION)?,
        }

        let existing = {
            let mut stmt = conn.prepare("SELECT batch_seq, checksum FROM batches")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?
        };

        if existing.is_empty() {
            info!(path = %path.display(), batch_size, "Created batch table");
        } else {
            info!(
                path = %path.display(),
                batch_size,
                persisted_batches = existing.len(),
                "Resuming batch table"
            );
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            shard: 0,
            existing,
            batcher: Batcher::new(batch_size),
            insert_sql: schema::insert_record_sql(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persisted_batches(&self) -> usize {
        self.existing.len()
    }

    pub fn set_source(&self, source: &str) -> Result<()> {
        if let Some(previous) = get_meta(&self.conn, schema::META_SOURCE)? {
            if previous != source {
                warn!(previous = %previous, current = %source, "Table was started from another input");
            }
        }
        set_meta(&self.conn, schema::META_SOURCE, source)
    }

    pub fn set_header(&self, header: &serde_json::Value) -> Result<()> {
        set_meta(&self.conn, schema::META_HEADER, &serde_json::to_string(header)?)
    }

    /// Buffer one record; writes a batch whenever one fills up
    pub fn push(&mut self, record: FlattenedVariantRecord) -> Result<Option<BatchOutcome>> {
        match self.batcher.push(record) {
            Some(batch) => self.write_batch(&batch).map(Some),
            None => Ok(None),
        }
    }

    /// Write the final short batch, if any
    pub fn flush(&mut self) -> Result<Option<BatchOutcome>> {
        match self.batcher.finish() {
            Some(batch) => self.write_batch(&batch).map(Some),
            None => Ok(None),
        }
    }

    /// Drop buffered records without writing them
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.batcher.discard();
        if dropped > 0 {
            warn!(records = dropped, "Discarded incomplete trailing batch");
        }
        dropped
    }

    /// Persist one batch, or confirm an identical copy is already there
    pub fn write_batch(&mut self, batch: &Batch) -> Result<BatchOutcome> {
        let checksum = batch.checksum()?;

        if let Some(stored) = self.existing.get(&batch.seq) {
            if stored.eq_ignore_ascii_case(&checksum) {
                debug!(seq = batch.seq, "Batch already persisted, skipping");
                return Ok(BatchOutcome::Resumed {
                    seq: batch.seq,
                    records: batch.len(),
                });
            }
            return Err(IngestError::TableMismatch(format!(
                "batch {} differs from the persisted copy (stored {stored}, computed {checksum})",
                batch.seq
            )));
        }

        let seq = batch.seq as i64;
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO batches (batch_seq, shard, record_count, checksum, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                seq,
                self.shard,
                batch.len() as i64,
                checksum,
                Utc::now().to_rfc3339()
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(&self.insert_sql)?;
            for (idx, record) in batch.records.iter().enumerate() {
                let row_idx = idx as i64;
                let lists = ListColumns::new(record)?;
                stmt.execute(schema::record_params(&seq, &row_idx, record, &lists).as_slice())?;
            }
        }
        tx.commit()?;

        debug!(seq = batch.seq, records = batch.len(), "Wrote batch");
        self.existing.insert(batch.seq, checksum);
        Ok(BatchOutcome::Written {
            seq: batch.seq,
            records: batch.len(),
        })
    }

    /// Record a finished run
    ///
    /// Fails if the table holds batches past the end of this run's output,
    /// which means it was built from a different input.
    pub fn mark_completed(&self, report: &RunReport) -> Result<()> {
        let next_seq = self.batcher.next_seq();
        if let Some((&stale, _)) = self.existing.range(next_seq..).next() {
            return Err(IngestError::TableMismatch(format!(
                "{} holds batch {stale} but this run produced only {next_seq} batches",
                self.path.display()
            )));
        }

        set_meta(&self.conn, schema::META_COMPLETED, "true")?;
        set_meta(&self.conn, schema::META_REPORT, &serde_json::to_string(report)?)?;
        info!(path = %self.path.display(), batches = next_seq, "Batch table completed");
        Ok(())
    }
}
