//! varidx common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared pieces used by every varidx workspace member:
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: content digests for persisted batches
//!
//! # Example
//!
//! ```no_run
//! use varidx_common::checksum::Sha256Digest;
//! use varidx_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!
//!     let mut digest = Sha256Digest::new();
//!     digest.update(b"1-12345-A-G");
//!     tracing::info!(checksum = %digest.finish(), "digest computed");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
