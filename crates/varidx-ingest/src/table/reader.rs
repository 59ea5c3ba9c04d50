//! Random access to a persisted batch table

use crate::error::{IngestError, Result};
use crate::stats::RunReport;
use crate::table::batch::Batch;
use crate::table::schema;
use crate::table::writer::get_meta;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use varidx_common::checksum::verify_checksum;

/// Read-only view of a batch table, shareable across export workers
pub struct BatchTableReader {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl BatchTableReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("batch table {} does not exist", path.display()),
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let version = get_meta(&conn, schema::META_SCHEMA_VERSION)?;
        if version.as_deref() != Some(schema::SCHEMA_VERSION) {
            return Err(IngestError::TableMismatch(format!(
                "{} has schema version {}, expected {}",
                path.display(),
                version.as_deref().unwrap_or("none"),
                schema::SCHEMA_VERSION
            )));
        }

        info!(path = %path.display(), "Opened batch table");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IngestError::TableMismatch("table connection lock poisoned".to_string()))
    }

    /// Persisted batch sequence numbers, ascending
    pub fn batch_seqs(&self) -> Result<Vec<u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT batch_seq FROM batches ORDER BY batch_seq")?;
        let seqs = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|seq| seq.map(|s| s as u64))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(seqs)
    }

    /// Load one batch and re-verify its checksum
    pub fn read_batch(&self, seq: u64) -> Result<Batch> {
        let conn = self.conn()?;
        let stored: Option<(String, i64)> = conn
            .query_row(
                "SELECT checksum, record_count FROM batches WHERE batch_seq = ?1",
                params![seq as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((checksum, record_count)) = stored else {
            return Err(IngestError::TableMismatch(format!(
                "batch {seq} is not present in {}",
                self.path.display()
            )));
        };

        let mut stmt = conn.prepare_cached(
            "SELECT * FROM variants WHERE batch_seq = ?1 ORDER BY row_idx",
        )?;
        let records = stmt
            .query_map(params![seq as i64], schema::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if records.len() as i64 != record_count {
            return Err(IngestError::TableMismatch(format!(
                "batch {seq} holds {} rows, expected {record_count}",
                records.len()
            )));
        }

        let batch = Batch::new(seq, records);
        verify_checksum(&checksum, &batch.checksum()?)?;
        debug!(seq, records = batch.len(), "Read batch");
        Ok(batch)
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        get_meta(&*self.conn()?, key)
    }

    /// Whether the parse job that built this table ran to the end
    pub fn is_completed(&self) -> Result<bool> {
        Ok(self.meta(schema::META_COMPLETED)?.as_deref() == Some("true"))
    }

    pub fn batch_size(&self) -> Result<Option<usize>> {
        Ok(self
            .meta(schema::META_BATCH_SIZE)?
            .and_then(|size| size.parse().ok()))
    }

    /// Annotation header captured from the input
    pub fn header(&self) -> Result<Option<serde_json::Value>> {
        match self.meta(schema::META_HEADER)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Report stored by the parse job
    pub fn parse_report(&self) -> Result<Option<RunReport>> {
        match self.meta(schema::META_REPORT)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn record_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COALESCE(SUM(record_count), 0) FROM batches",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::flatten::record::positive_zero;
    use crate::table::batch::tests::sample_record;
    use crate::table::writer::BatchTableWriter;
    use serde_json::json;
    use tempfile::TempDir;

    fn build_table(dir: &TempDir, count: i64, batch_size: usize) -> PathBuf {
        let path = dir.path().join("variants.db");
        let mut writer = BatchTableWriter::open(&path, batch_size).unwrap();
        writer.set_header(&json!({"annotator": "test"})).unwrap();
        for i in 0..count {
            writer.push(sample_record(i)).unwrap();
        }
        writer.flush().unwrap();
        writer.mark_completed(&RunReport::default()).unwrap();
        path
    }

    #[test]
    fn test_records_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = build_table(&dir, 7, 3);

        let reader = BatchTableReader::open(&path).unwrap();
        assert_eq!(reader.batch_seqs().unwrap(), vec![0, 1, 2]);
        assert_eq!(reader.record_count().unwrap(), 7);
        assert_eq!(reader.batch_size().unwrap(), Some(3));
        assert!(reader.is_completed().unwrap());
        assert_eq!(reader.header().unwrap(), Some(json!({"annotator": "test"})));
        assert!(reader.parse_report().unwrap().is_some());

        let batch = reader.read_batch(1).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.records[0], sample_record(3));
        assert_eq!(batch.records[2], sample_record(5));
        assert_eq!(reader.read_batch(2).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_batch_and_missing_table() {
        let dir = TempDir::new().unwrap();
        let path = build_table(&dir, 2, 10);
        let reader = BatchTableReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_batch(5).unwrap_err(),
            IngestError::TableMismatch(_)
        ));

        let err = BatchTableReader::open(&dir.path().join("absent.db"))
            .err()
            .unwrap();
        assert!(matches!(err, IngestError::Io(_)));
    }

    #[test]
    fn test_tampered_rows_fail_checksum() {
        let dir = TempDir::new().unwrap();
        let path = build_table(&dir, 2, 10);
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("UPDATE variants SET gene = 'OTHER' WHERE row_idx = 0", [])
                .unwrap();
        }

        let reader = BatchTableReader::open(&path).unwrap();
        let err = reader.read_batch(0).unwrap_err();
        assert!(matches!(err, IngestError::Common(_)));
    }

    #[test]
    fn test_negative_zero_survives_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("variants.db");
        let mut record = sample_record(1);
        record.conservation.phylop_score = Some(positive_zero(-0.0));

        let mut writer = BatchTableWriter::open(&path, 10).unwrap();
        writer.push(record.clone()).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let reader = BatchTableReader::open(&path).unwrap();
        assert_eq!(reader.read_batch(0).unwrap().records, vec![record]);
    }
}
