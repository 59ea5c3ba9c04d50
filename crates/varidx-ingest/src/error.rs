//! Error taxonomy for the ingestion pipeline
//!
//! Errors fall into three classes:
//!
//! - **fatal**: abort the job (malformed envelope, unwritable table,
//!   authentication failure, unreachable cluster)
//! - **recoverable**: absorbed at the stage boundary and only counted
//!   (one bad record, one record missing a required field)
//! - **retryable**: retried with backoff by the exporter (transient cluster
//!   failures, individual document failures)

use thiserror::Error;
use varidx_common::CommonError;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The input envelope itself is unreadable
    #[error("Malformed annotation input: {0}")]
    MalformedInput(String),

    /// One position element could not be decoded
    #[error("Position #{index} could not be parsed: {message}")]
    RecordParse { index: u64, message: String },

    /// A unit lacks a field the flattened record cannot do without
    #[error("Annotation unit {context} is missing required field '{field}'")]
    Schema { field: &'static str, context: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table storage error: {0}")]
    Table(#[from] rusqlite::Error),

    /// The persisted table disagrees with the current run
    #[error("Table mismatch: {0}")]
    TableMismatch(String),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection failure, timeout, or a busy/unavailable cluster
    #[error("Transient index error: {message}")]
    TransientIndex { message: String, busy: bool },

    /// A single document was rejected inside an accepted bulk response
    #[error("Document {vid} failed to index: {reason}")]
    DocumentIndex { vid: String, reason: String },

    /// The cluster refused the request for a reason retrying cannot fix
    #[error("Bulk request rejected with HTTP {status}: {message}")]
    RequestRejected { status: u16, message: String },

    #[error("Search cluster rejected credentials: {0}")]
    Auth(String),

    #[error("Search cluster unreachable: {0}")]
    ExhaustedRetry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIndex {
            message: msg.into(),
            busy: false,
        }
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::TransientIndex {
            message: msg.into(),
            busy: true,
        }
    }

    /// Errors that end the whole job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedInput(_)
                | IngestError::Io(_)
                | IngestError::Table(_)
                | IngestError::TableMismatch(_)
                | IngestError::Common(_)
                | IngestError::Auth(_)
                | IngestError::ExhaustedRetry(_)
                | IngestError::Config(_)
                | IngestError::Worker(_)
        )
    }

    /// Errors worth another attempt after a backoff delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::TransientIndex { .. } | IngestError::DocumentIndex { .. }
        )
    }

    /// Whether the cluster signalled it is overloaded
    pub fn is_busy(&self) -> bool {
        matches!(self, IngestError::TransientIndex { busy: true, .. })
    }

    /// Counter key for per-record failures absorbed by the pipeline
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            IngestError::RecordParse { .. } => Some("record_parse"),
            IngestError::Schema { field, .. } => Some(match *field {
                "position" => "missing_position",
                "chromosome" => "missing_chromosome",
                "ref" => "missing_ref",
                "alt" => "missing_alt",
                _ => "schema",
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(IngestError::malformed("no positions").is_fatal());
        assert!(IngestError::Auth("401".into()).is_fatal());
        assert!(!IngestError::busy("429").is_fatal());
        assert!(IngestError::busy("429").is_retryable());
        assert!(IngestError::busy("429").is_busy());
        assert!(!IngestError::transient("timeout").is_busy());

        let schema = IngestError::Schema {
            field: "position",
            context: "chr1:?".into(),
        };
        assert!(!schema.is_fatal());
        assert!(!schema.is_retryable());
        assert_eq!(schema.skip_reason(), Some("missing_position"));
    }

    #[test]
    fn test_record_parse_skip_reason() {
        let err = IngestError::RecordParse {
            index: 7,
            message: "expected value".into(),
        };
        assert_eq!(err.skip_reason(), Some("record_parse"));
        assert!(err.to_string().contains("#7"));
    }
}
