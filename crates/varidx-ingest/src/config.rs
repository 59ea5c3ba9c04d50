//! Job configuration
//!
//! Both jobs read `VARIDX_*` environment variables (after `.env` has been
//! loaded by the binary); CLI flags override individual fields afterwards.

use crate::export::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Configuration for the parse job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseConfig {
    /// Records per persisted batch
    pub batch_size: usize,
    /// Flattening workers
    pub workers: usize,
    /// Queue capacity between stages, as a multiple of `batch_size`
    pub queue_multiple: usize,
    /// Stop after this many input positions
    pub max_positions: Option<u64>,
    /// Log progress every N parsed units
    pub progress_every: u64,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            workers: 4,
            queue_multiple: 2,
            max_positions: None,
            progress_every: 100_000,
        }
    }
}

impl ParseConfig {
    /// Load parse configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_or("VARIDX_BATCH_SIZE", defaults.batch_size),
            workers: env_or("VARIDX_PARSE_WORKERS", defaults.workers),
            queue_multiple: env_or("VARIDX_QUEUE_MULTIPLE", defaults.queue_multiple),
            max_positions: env_opt("VARIDX_MAX_POSITIONS"),
            progress_every: env_or("VARIDX_PROGRESS_EVERY", defaults.progress_every),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("VARIDX_BATCH_SIZE must be greater than 0");
        }
        if self.workers == 0 {
            anyhow::bail!("VARIDX_PARSE_WORKERS must be greater than 0");
        }
        if self.queue_multiple == 0 {
            anyhow::bail!("VARIDX_QUEUE_MULTIPLE must be greater than 0");
        }
        Ok(())
    }

    /// Bounded channel capacity between parser, workers and writer
    pub fn queue_capacity(&self) -> usize {
        self.batch_size.saturating_mul(self.queue_multiple)
    }
}

/// Configuration for the export job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Target index name
    pub index: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Batches in flight at once
    pub concurrency: usize,
    /// Attempts per bulk request and per failed document
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Documents per bulk request
    pub max_request_docs: usize,
    /// Body size ceiling per bulk request
    pub max_request_bytes: usize,
    /// Consecutive successes before a retired permit is restored
    pub recovery_successes: u32,
    /// Consecutive unreachable batches, with no success yet, before giving up
    pub unreachable_threshold: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 9200,
            index: "variants".to_string(),
            username: None,
            password: None,
            concurrency: 4,
            max_attempts: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            request_timeout_secs: 60,
            max_request_docs: 1000,
            max_request_bytes: 10 * 1024 * 1024,
            recovery_successes: 5,
            unreachable_threshold: 3,
        }
    }
}

impl ExportConfig {
    /// Load export configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            scheme: env_or("VARIDX_ES_SCHEME", defaults.scheme),
            host: env_or("VARIDX_ES_HOST", defaults.host),
            port: env_or("VARIDX_ES_PORT", defaults.port),
            index: env_or("VARIDX_ES_INDEX", defaults.index),
            username: env_opt("VARIDX_ES_USERNAME"),
            password: env_opt("VARIDX_ES_PASSWORD"),
            concurrency: env_or("VARIDX_EXPORT_CONCURRENCY", defaults.concurrency),
            max_attempts: env_or("VARIDX_MAX_ATTEMPTS", defaults.max_attempts),
            retry_base_delay_ms: env_or("VARIDX_RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_or("VARIDX_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms),
            request_timeout_secs: env_or(
                "VARIDX_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            max_request_docs: env_or("VARIDX_MAX_REQUEST_DOCS", defaults.max_request_docs),
            max_request_bytes: env_or("VARIDX_MAX_REQUEST_BYTES", defaults.max_request_bytes),
            recovery_successes: env_or("VARIDX_RECOVERY_SUCCESSES", defaults.recovery_successes),
            unreachable_threshold: env_or(
                "VARIDX_UNREACHABLE_THRESHOLD",
                defaults.unreachable_threshold,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.index.is_empty() {
            anyhow::bail!("VARIDX_ES_INDEX must not be empty");
        }
        if self.index.chars().any(|c| c.is_ascii_uppercase() || c == '/' || c == ' ') {
            anyhow::bail!(
                "Index name '{}' must be lowercase without '/' or spaces",
                self.index
            );
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            anyhow::bail!("VARIDX_ES_SCHEME must be http or https");
        }
        if self.concurrency == 0 {
            anyhow::bail!("VARIDX_EXPORT_CONCURRENCY must be greater than 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("VARIDX_MAX_ATTEMPTS must be greater than 0");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("VARIDX_RETRY_MAX_DELAY_MS must not be below VARIDX_RETRY_BASE_DELAY_MS");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("VARIDX_REQUEST_TIMEOUT_SECS must be greater than 0");
        }
        if self.max_request_docs == 0 || self.max_request_bytes == 0 {
            anyhow::bail!("Bulk request limits must be greater than 0");
        }
        if self.unreachable_threshold == 0 {
            anyhow::bail!("VARIDX_UNREACHABLE_THRESHOLD must be greater than 0");
        }
        if self.username.is_some() != self.password.is_some() {
            anyhow::bail!("VARIDX_ES_USERNAME and VARIDX_ES_PASSWORD must be set together");
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }
}
