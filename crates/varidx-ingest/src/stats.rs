//! Run counters shared by concurrent workers
//!
//! One [`RunCounters`] is created per job, cloned (via `Arc`) into every
//! worker, and turned into a [`RunReport`] when the job ends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub struct RunCounters {
    run_id: Uuid,
    started: Instant,
    parsed: AtomicU64,
    flattened: AtomicU64,
    skip_reasons: Mutex<BTreeMap<String, u64>>,
    batches_written: AtomicU64,
    batches_resumed: AtomicU64,
    indexed: AtomicU64,
    dead_lettered: AtomicU64,
    batches_exported: AtomicU64,
    batches_failed: AtomicU64,
    batches_interrupted: AtomicU64,
    retries: AtomicU64,
}

impl Default for RunCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCounters {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            parsed: AtomicU64::new(0),
            flattened: AtomicU64::new(0),
            skip_reasons: Mutex::new(BTreeMap::new()),
            batches_written: AtomicU64::new(0),
            batches_resumed: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            batches_exported: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            batches_interrupted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flattened(&self) {
        self.flattened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, reason: &str) {
        match self.skip_reasons.lock() {
            Ok(mut reasons) => *reasons.entry(reason.to_string()).or_insert(0) += 1,
            Err(poisoned) => {
                warn!(reason, "Skip counter lock poisoned, recovering");
                *poisoned
                    .into_inner()
                    .entry(reason.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    pub fn record_batch_written(&self) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_resumed(&self) {
        self.batches_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_indexed(&self, documents: u64) {
        self.indexed.fetch_add(documents, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_exported(&self) {
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_interrupted(&self) {
        self.batches_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parsed(&self) -> u64 {
        self.parsed.load(Ordering::Relaxed)
    }

    pub fn flattened(&self) -> u64 {
        self.flattened.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn skip_reasons(&self) -> BTreeMap<String, u64> {
        match self.skip_reasons.lock() {
            Ok(reasons) => reasons.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Snapshot every counter
    pub fn report(&self) -> RunReport {
        let skip_reasons = self.skip_reasons();
        RunReport {
            run_id: self.run_id,
            parsed: self.parsed(),
            flattened: self.flattened(),
            skipped: skip_reasons.values().sum(),
            skip_reasons,
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_resumed: self.batches_resumed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_interrupted: self.batches_interrupted.load(Ordering::Relaxed),
            retries: self.retries(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// End-of-run totals, enough to reconcile input against output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub parsed: u64,
    pub flattened: u64,
    pub skipped: u64,
    pub skip_reasons: BTreeMap<String, u64>,
    pub batches_written: u64,
    pub batches_resumed: u64,
    pub indexed: u64,
    pub dead_lettered: u64,
    pub batches_exported: u64,
    pub batches_failed: u64,
    pub batches_interrupted: u64,
    pub retries: u64,
    pub elapsed_ms: u64,
}

impl RunReport {
    /// `parsed == flattened + skipped`
    pub fn is_balanced(&self) -> bool {
        self.parsed == self.flattened + self.skipped
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_concurrent_updates() {
        let counters = Arc::new(RunCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counters.record_parsed();
                        if i % 2 == 0 {
                            counters.record_flattened();
                        } else {
                            counters.record_skip("record_parse");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = counters.report();
        assert_eq!(report.parsed, 800);
        assert_eq!(report.flattened, 400);
        assert_eq!(report.skipped, 400);
        assert_eq!(report.skip_reasons["record_parse"], 400);
        assert!(report.is_balanced());
    }

    #[test]
    fn test_report_serializes() {
        let counters = RunCounters::new();
        counters.record_skip("missing_position");
        counters.record_retry();
        counters.record_retry();

        let json = serde_json::to_value(counters.report()).unwrap();
        assert_eq!(json["skip_reasons"]["missing_position"], 1);
        assert_eq!(json["retries"], 2);
        assert_eq!(json["run_id"], counters.run_id().to_string());
    }
}
