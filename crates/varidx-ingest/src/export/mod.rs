//! Bulk export of persisted batches into a search index

pub mod client;
pub mod exporter;
pub mod ledger;
pub mod limiter;
pub mod request;
pub mod retry;

pub use client::{BulkSink, ElasticsearchClient};
pub use exporter::BulkIndexExporter;
pub use ledger::{ledger_path_for, BatchStatus, DeadLetter, ExportLedger};
pub use limiter::AdaptiveConcurrency;
pub use request::{BulkDocument, BulkRequest, ItemFailure};
pub use retry::RetryPolicy;
