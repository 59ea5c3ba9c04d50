//! SQLite schema for the batch table

use crate::flatten::record::{
    ClinvarSummary, ConservationScores, FlattenedVariantRecord, PopulationFrequencies, VariantType,
};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, Row};

/// Bumped whenever the `variants` columns change
pub const SCHEMA_VERSION: &str = "1";

pub const META_BATCH_SIZE: &str = "batch_size";
pub const META_SCHEMA_VERSION: &str = "schema_version";
pub const META_SOURCE: &str = "source";
pub const META_HEADER: &str = "header";
pub const META_COMPLETED: &str = "completed";
pub const META_REPORT: &str = "report";

/// Leading columns of every record row, in insert order
const CORE_COLUMNS: &[(&str, &str)] = &[
    ("vid", "TEXT NOT NULL"),
    ("chromosome", "TEXT NOT NULL"),
    ("position", "INTEGER NOT NULL"),
    ("ref", "TEXT NOT NULL"),
    ("alt", "TEXT NOT NULL"),
    ("variant_type", "TEXT NOT NULL"),
    ("hgvsg", "TEXT"),
    ("begin", "INTEGER"),
    ("end", "INTEGER"),
    ("rsid", "TEXT"),
    ("gene", "TEXT"),
    ("genes", "TEXT NOT NULL"),
    ("canonical_transcript", "TEXT"),
    ("n_transcripts", "INTEGER NOT NULL"),
    ("all_consequences", "TEXT NOT NULL"),
    ("filters", "TEXT"),
    ("mapping_quality", "REAL"),
    ("fisher_strand_bias", "REAL"),
    ("quality", "REAL"),
    ("cytogenetic_band", "TEXT"),
];

/// Trailing columns, after the conservation and population blocks
const TAIL_COLUMNS: &[(&str, &str)] = &[
    ("max_gnomad_af", "REAL"),
    ("max_pop_af", "REAL"),
    ("clinvar_significance", "TEXT"),
    ("clinvar_variant_type", "TEXT"),
    ("clinvar_id", "TEXT"),
    ("clinvar_consensus", "TEXT NOT NULL"),
];

/// Every record column with its declared type, in insert order
pub fn record_columns() -> Vec<(&'static str, &'static str)> {
    CORE_COLUMNS
        .iter()
        .chain(ConservationScores::COLUMNS)
        .chain(PopulationFrequencies::COLUMNS)
        .chain(TAIL_COLUMNS)
        .copied()
        .collect()
}

/// Initialize batch table schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS table_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
        [],
    )?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS batches (
            batch_seq INTEGER PRIMARY KEY,
            shard INTEGER NOT NULL DEFAULT 0,
            record_count INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        [],
    )?;

    let columns = record_columns()
        .iter()
        .map(|(name, ty)| format!("\"{name}\" {ty}"))
        .collect::<Vec<_>>()
        .join(",\n            ");
    conn.execute(
        &format!(
            r#"
        CREATE TABLE IF NOT EXISTS variants (
            batch_seq INTEGER NOT NULL,
            row_idx INTEGER NOT NULL,
            {columns},
            PRIMARY KEY (batch_seq, row_idx),
            FOREIGN KEY (batch_seq) REFERENCES batches(batch_seq) ON DELETE CASCADE
        )
        "#
        ),
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_variants_vid ON variants(vid)",
        [],
    )?;

    Ok(())
}

/// `INSERT` statement binding `batch_seq`, `row_idx` and every record column
pub fn insert_record_sql() -> String {
    let columns = record_columns();
    let names = columns
        .iter()
        .map(|(name, _)| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len() + 2)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO variants (batch_seq, row_idx, {names}) VALUES ({placeholders})")
}

impl ToSql for VariantType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VariantType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// List-valued field stored as a JSON array
struct JsonList(Vec<String>);

impl FromSql for JsonList {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?)
            .map(JsonList)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Pre-serialised list columns for one record
pub struct ListColumns {
    genes: String,
    all_consequences: String,
}

impl ListColumns {
    pub fn new(record: &FlattenedVariantRecord) -> serde_json::Result<Self> {
        Ok(Self {
            genes: serde_json::to_string(&record.genes)?,
            all_consequences: serde_json::to_string(&record.all_consequences)?,
        })
    }
}

/// Bind values for one row, matching [`insert_record_sql`]
pub fn record_params<'a>(
    batch_seq: &'a i64,
    row_idx: &'a i64,
    record: &'a FlattenedVariantRecord,
    lists: &'a ListColumns,
) -> Vec<&'a dyn ToSql> {
    let core: [&'a dyn ToSql; 22] = [
        batch_seq,
        row_idx,
        &record.vid,
        &record.chromosome,
        &record.position,
        &record.ref_allele,
        &record.alt,
        &record.variant_type,
        &record.hgvsg,
        &record.begin,
        &record.end,
        &record.rsid,
        &record.gene,
        &lists.genes,
        &record.canonical_transcript,
        &record.n_transcripts,
        &lists.all_consequences,
        &record.filters,
        &record.mapping_quality,
        &record.fisher_strand_bias,
        &record.quality,
        &record.cytogenetic_band,
    ];
    let tail: [&'a dyn ToSql; 6] = [
        &record.max_gnomad_af,
        &record.max_pop_af,
        &record.clinvar.clinvar_significance,
        &record.clinvar.clinvar_variant_type,
        &record.clinvar.clinvar_id,
        &record.clinvar.clinvar_consensus,
    ];

    let mut params = core.to_vec();
    params.extend(record.conservation.sql_values());
    params.extend(record.population.sql_values());
    params.extend(tail);
    params
}

/// Rebuild a record from a `variants` row
pub fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FlattenedVariantRecord> {
    let JsonList(genes) = row.get("genes")?;
    let JsonList(all_consequences) = row.get("all_consequences")?;

    Ok(FlattenedVariantRecord {
        vid: row.get("vid")?,
        chromosome: row.get("chromosome")?,
        position: row.get("position")?,
        ref_allele: row.get("ref")?,
        alt: row.get("alt")?,
        variant_type: row.get("variant_type")?,
        hgvsg: row.get("hgvsg")?,
        begin: row.get("begin")?,
        end: row.get("end")?,
        rsid: row.get("rsid")?,
        gene: row.get("gene")?,
        genes,
        canonical_transcript: row.get("canonical_transcript")?,
        n_transcripts: row.get("n_transcripts")?,
        all_consequences,
        filters: row.get("filters")?,
        mapping_quality: row.get("mapping_quality")?,
        fisher_strand_bias: row.get("fisher_strand_bias")?,
        quality: row.get("quality")?,
        cytogenetic_band: row.get("cytogenetic_band")?,
        conservation: ConservationScores::from_row(row)?,
        population: PopulationFrequencies::from_row(row)?,
        max_gnomad_af: row.get("max_gnomad_af")?,
        max_pop_af: row.get("max_pop_af")?,
        clinvar: ClinvarSummary {
            clinvar_significance: row.get("clinvar_significance")?,
            clinvar_variant_type: row.get("clinvar_variant_type")?,
            clinvar_id: row.get("clinvar_id")?,
            clinvar_consensus: row.get("clinvar_consensus")?,
        },
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_twice() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('variants')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count as usize, record_columns().len() + 2);
    }

    #[test]
    fn test_insert_sql_placeholder_count() {
        let sql = insert_record_sql();
        let expected = record_columns().len() + 2;
        assert!(sql.contains(&format!("?{expected})")));
        assert!(sql.contains("\"end\""));
    }
}
