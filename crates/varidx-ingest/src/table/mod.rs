//! Intermediate batch table
//!
//! The hand-off point between the parse job and the export job: an
//! append-only SQLite file of sequence-numbered, checksummed batches.

pub mod batch;
pub mod reader;
pub mod schema;
pub mod writer;

pub use batch::{Batch, BatchOutcome, Batcher};
pub use reader::BatchTableReader;
pub use writer::BatchTableWriter;
