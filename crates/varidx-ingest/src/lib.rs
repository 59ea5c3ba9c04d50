//! varidx ingestion library
//!
//! Turns annotation-engine JSON dumps into flat, search-ready variant
//! documents in two independent, restartable jobs:
//!
//! - **parse**: stream the (gzipped) annotation input, flatten every
//!   variant into one [`FlattenedVariantRecord`], and persist fixed-size
//!   batches to a resumable SQLite table
//! - **export**: bulk-upsert the persisted batches into an
//!   Elasticsearch/OpenSearch index, keyed by `vid`, with retries,
//!   adaptive backpressure and a dead-letter ledger
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use varidx_ingest::config::{ExportConfig, ParseConfig};
//! use varidx_ingest::export::{ledger_path_for, BulkIndexExporter, ElasticsearchClient, ExportLedger};
//! use varidx_ingest::pipeline::ParseJob;
//! use varidx_ingest::table::BatchTableReader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let table = Path::new("./data/variants.db");
//!     let cancel = CancellationToken::new();
//!
//!     let parse = ParseJob::new(ParseConfig::from_env()?);
//!     let report = parse
//!         .run(Path::new("sample.json.gz"), table, cancel.clone())
//!         .await?;
//!     println!("flattened {} of {} units", report.flattened, report.parsed);
//!
//!     let config = ExportConfig::from_env()?;
//!     let exporter = BulkIndexExporter::new(
//!         Arc::new(ElasticsearchClient::new(&config)?),
//!         Arc::new(ExportLedger::open(&ledger_path_for(table))?),
//!         &config,
//!     );
//!     exporter
//!         .run(Arc::new(BatchTableReader::open(table)?), cancel)
//!         .await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod export;
pub mod flatten;
pub mod nirvana;
pub mod pipeline;
pub mod stats;
pub mod table;

pub use config::{ExportConfig, ParseConfig};
pub use error::{IngestError, Result};
pub use flatten::{FlattenedVariantRecord, VariantFlattener};
pub use nirvana::{AnnotationStreamParser, RawAnnotationUnit};
pub use pipeline::ParseJob;
pub use stats::{RunCounters, RunReport};
