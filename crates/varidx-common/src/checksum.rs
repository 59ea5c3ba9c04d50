//! Content checksums for persisted batches
//!
//! A batch checksum is the SHA-256 of the canonical JSON of each record,
//! newline-terminated, in persisted order. Record serialisation is
//! deterministic, so the same records always hash to the same digest.

use crate::error::{CommonError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;

/// Incremental SHA-256 digest that can also be used as an `io::Write` sink
#[derive(Default, Clone)]
pub struct Sha256Digest {
    hasher: Sha256,
}

impl Sha256Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Hex-encoded digest
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Write for Sha256Digest {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Checksum a sequence of serialisable records as newline-delimited JSON
pub fn checksum_records<'a, T, I>(records: I) -> Result<String>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut digest = Sha256Digest::new();
    for record in records {
        serde_json::to_writer(&mut digest, record)?;
        digest.update(b"\n");
    }
    Ok(digest.finish())
}

/// Compare a stored checksum with a freshly computed one
pub fn verify_checksum(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}
