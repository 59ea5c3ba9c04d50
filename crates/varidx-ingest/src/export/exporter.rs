//! Bulk export of a batch table into a search index
//!
//! Batches are dispatched in sequence order, up to the adaptive concurrency
//! limit at once. Each batch is split into bulk requests; a request is
//! retried as a whole on transient failures, and documents rejected inside
//! an accepted request are retried one by one and dead-lettered when they
//! keep failing.

use crate::config::ExportConfig;
use crate::error::{IngestError, Result};
use crate::export::client::BulkSink;
use crate::export::ledger::ExportLedger;
use crate::export::limiter::AdaptiveConcurrency;
use crate::export::request::{split_requests, BulkDocument, BulkRequest, ItemFailure};
use crate::export::retry::RetryPolicy;
use crate::stats::{RunCounters, RunReport};
use crate::table::{Batch, BatchTableReader};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How one batch ended
#[derive(Debug)]
enum BatchExport {
    Exported { indexed: u64, dead_lettered: u64 },
    Failed { error: IngestError, unreachable: bool },
    /// Cancelled between requests; stays pending in the ledger
    Interrupted,
}

/// Run-wide bookkeeping shared by the batch tasks
#[derive(Debug, Default)]
struct RunState {
    succeeded: AtomicU64,
    failed: AtomicU64,
    unreachable: AtomicU64,
    consecutive_unreachable: AtomicU32,
    fatal: Mutex<Option<IngestError>>,
}

impl RunState {
    fn fail(&self, err: IngestError, abort: &CancellationToken) {
        error!(error = %err, "Aborting export");
        let mut fatal = match self.fatal.lock() {
            Ok(fatal) => fatal,
            Err(poisoned) => poisoned.into_inner(),
        };
        fatal.get_or_insert(err);
        abort.cancel();
    }

    fn take_fatal(&self) -> Option<IngestError> {
        match self.fatal.lock() {
            Ok(mut fatal) => fatal.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn on_exported(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.consecutive_unreachable.store(0, Ordering::Relaxed);
    }

    /// Returns the current unreachable streak when nothing has succeeded yet
    fn on_failed(&self, unreachable: bool) -> Option<u32> {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if !unreachable {
            self.consecutive_unreachable.store(0, Ordering::Relaxed);
            return None;
        }
        self.unreachable.fetch_add(1, Ordering::Relaxed);
        let streak = self.consecutive_unreachable.fetch_add(1, Ordering::Relaxed) + 1;
        (self.succeeded.load(Ordering::Relaxed) == 0).then_some(streak)
    }

    /// Every batch that finished failed on connectivity
    fn cluster_unreachable(&self) -> bool {
        let failed = self.failed.load(Ordering::Relaxed);
        self.succeeded.load(Ordering::Relaxed) == 0
            && failed > 0
            && self.unreachable.load(Ordering::Relaxed) == failed
    }
}

/// Sends the batches of one table to one index
#[derive(Clone)]
pub struct BulkIndexExporter {
    sink: Arc<dyn BulkSink>,
    ledger: Arc<ExportLedger>,
    config: ExportConfig,
    policy: RetryPolicy,
    limiter: AdaptiveConcurrency,
    counters: Arc<RunCounters>,
}

impl BulkIndexExporter {
    pub fn new(sink: Arc<dyn BulkSink>, ledger: Arc<ExportLedger>, config: &ExportConfig) -> Self {
        Self {
            sink,
            ledger,
            policy: config.retry_policy(),
            limiter: AdaptiveConcurrency::new(config.concurrency, config.recovery_successes),
            config: config.clone(),
            counters: Arc::new(RunCounters::new()),
        }
    }

    /// Live counters, for progress display
    pub fn counters(&self) -> Arc<RunCounters> {
        Arc::clone(&self.counters)
    }

    /// Concurrency shared by every batch of this exporter's runs
    pub fn concurrency(&self) -> &AdaptiveConcurrency {
        &self.limiter
    }

    fn index(&self) -> &str {
        &self.config.index
    }

    /// Run a ledger call on the blocking pool
    async fn with_ledger<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ExportLedger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))?
    }

    /// Export every batch not yet confirmed in the ledger
    ///
    /// Returns the run report, or the fatal error that stopped the run. A
    /// cancelled run returns its report with the unfinished batches left
    /// pending.
    pub async fn run(
        &self,
        table: Arc<BatchTableReader>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let index = self.index().to_string();
        if !table.is_completed()? {
            warn!(table = %table.path().display(), "Exporting a table whose parse run has not completed");
        }

        let seqs = table.batch_seqs()?;
        let done = self.ledger.exported_seqs(&index)?;
        let todo: Vec<u64> = seqs.iter().copied().filter(|s| !done.contains(s)).collect();
        for _ in seqs.iter().filter(|s| done.contains(s)) {
            self.counters.record_batch_resumed();
        }
        info!(
            run_id = %self.counters.run_id(),
            index = %index,
            batches = seqs.len(),
            already_exported = seqs.len() - todo.len(),
            concurrency = self.config.concurrency,
            "Starting export"
        );

        let limiter = self.limiter.clone();
        let abort = cancel.child_token();
        let state = Arc::new(RunState::default());
        let mut tasks = JoinSet::new();

        for seq in todo {
            let permit = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                permit = limiter.acquire() => permit,
            };
            if abort.is_cancelled() {
                break;
            }

            let worker = self.clone();
            let task_table = Arc::clone(&table);
            let task_limiter = limiter.clone();
            let task_abort = abort.clone();
            let task_state = Arc::clone(&state);
            tasks.spawn(async move {
                let _permit = permit;
                worker
                    .process_batch(seq, task_table, &task_limiter, &task_abort, &task_state)
                    .await;
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    state.fail(IngestError::Worker(e.to_string()), &abort);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                state.fail(IngestError::Worker(e.to_string()), &abort);
            }
        }

        let report = self.counters.report();
        if let Some(err) = state.take_fatal() {
            return Err(err);
        }
        if cancel.is_cancelled() {
            warn!(
                interrupted = report.batches_interrupted,
                "Export cancelled, unfinished batches left pending"
            );
            return Ok(report);
        }
        if state.cluster_unreachable() {
            return Err(IngestError::ExhaustedRetry(format!(
                "all {} attempted batches failed to reach the cluster",
                report.batches_failed
            )));
        }

        if report.batches_failed == 0 && report.batches_interrupted == 0 {
            self.ledger.archive_run(&index, &report)?;
        } else {
            warn!(
                failed = report.batches_failed,
                "Export finished with failed batches; rerun to retry them"
            );
        }
        info!(
            indexed = report.indexed,
            dead_lettered = report.dead_lettered,
            batches_exported = report.batches_exported,
            retries = report.retries,
            elapsed_ms = report.elapsed_ms,
            "Export finished"
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        seq: u64,
        table: Arc<BatchTableReader>,
        limiter: &AdaptiveConcurrency,
        abort: &CancellationToken,
        state: &RunState,
    ) {
        let index = self.index().to_string();
        let pending = {
            let index = index.clone();
            self.with_ledger(move |ledger| ledger.mark_pending(&index, seq))
                .await
        };
        if let Err(e) = pending {
            state.fail(e, abort);
            return;
        }

        let batch = match tokio::task::spawn_blocking(move || table.read_batch(seq)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => return state.fail(e, abort),
            Err(e) => return state.fail(IngestError::Worker(e.to_string()), abort),
        };

        let outcome = match self.export_batch(&batch, limiter, abort).await {
            Ok(outcome) => outcome,
            Err(e) => return state.fail(e, abort),
        };

        let recorded = match outcome {
            BatchExport::Exported {
                indexed,
                dead_lettered,
            } => {
                self.counters.record_batch_exported();
                state.on_exported();
                debug!(seq, indexed, dead_lettered, "Batch exported");
                self.with_ledger(move |ledger| ledger.mark_exported(&index, seq))
                    .await
            }
            BatchExport::Failed { error, unreachable } => {
                self.counters.record_batch_failed();
                warn!(seq, error = %error, "Batch failed");
                if let Some(streak) = state.on_failed(unreachable) {
                    if streak >= self.config.unreachable_threshold {
                        state.fail(
                            IngestError::ExhaustedRetry(format!(
                                "{streak} consecutive batches could not reach the cluster"
                            )),
                            abort,
                        );
                    }
                }
                let error = error.to_string();
                self.with_ledger(move |ledger| ledger.mark_failed(&index, seq, &error))
                    .await
            }
            BatchExport::Interrupted => {
                self.counters.record_batch_interrupted();
                debug!(seq, "Batch interrupted");
                Ok(())
            }
        };
        if let Err(e) = recorded {
            state.fail(e, abort);
        }
    }

    async fn export_batch(
        &self,
        batch: &Batch,
        limiter: &AdaptiveConcurrency,
        cancel: &CancellationToken,
    ) -> Result<BatchExport> {
        let requests = match split_requests(
            self.index(),
            &batch.records,
            self.config.max_request_docs,
            self.config.max_request_bytes,
        ) {
            Ok(requests) => requests,
            Err(error) => {
                return Ok(BatchExport::Failed {
                    error,
                    unreachable: false,
                })
            }
        };

        let mut indexed = 0u64;
        let mut dead_lettered = 0u64;
        let mut reached = false;
        for request in &requests {
            if cancel.is_cancelled() {
                return Ok(BatchExport::Interrupted);
            }

            let failures = match self.send_with_retry(request, limiter, cancel).await {
                Ok(failures) => failures,
                Err(IngestError::Cancelled) => return Ok(BatchExport::Interrupted),
                Err(e) if e.is_fatal() => return Err(e),
                Err(error) => {
                    let unreachable = !reached
                        && matches!(error, IngestError::TransientIndex { busy: false, .. });
                    return Ok(BatchExport::Failed { error, unreachable });
                }
            };
            reached = true;

            let accepted = (request.len() - failures.len()) as u64;
            self.counters.record_indexed(accepted);
            indexed += accepted;

            for failure in failures {
                match self
                    .retry_document(batch.seq, request, failure, limiter, cancel)
                    .await
                {
                    Ok(true) => {
                        self.counters.record_indexed(1);
                        indexed += 1;
                    }
                    Ok(false) => dead_lettered += 1,
                    Err(IngestError::Cancelled) => return Ok(BatchExport::Interrupted),
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(BatchExport::Exported {
            indexed,
            dead_lettered,
        })
    }

    /// Wait out a backoff delay unless cancelled first
    async fn backoff(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn send_with_retry(
        &self,
        request: &BulkRequest,
        limiter: &AdaptiveConcurrency,
        cancel: &CancellationToken,
    ) -> Result<Vec<ItemFailure>> {
        let mut attempt = 1;
        loop {
            match self.sink.send(request).await {
                Ok(failures) => {
                    limiter.on_success();
                    return Ok(failures);
                }
                Err(e) => {
                    if e.is_busy() {
                        limiter.on_busy();
                    }
                    if !e.is_retryable() || !self.policy.should_retry(attempt) {
                        return Err(e);
                    }

                    let delay = self.policy.delay_for(attempt);
                    self.counters.record_retry();
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Bulk request failed, retrying"
                    );
                    self.backoff(delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Resend one rejected document until it is accepted or attempts run out
    ///
    /// Returns `false` when the document was dead-lettered.
    async fn retry_document(
        &self,
        seq: u64,
        request: &BulkRequest,
        failure: ItemFailure,
        limiter: &AdaptiveConcurrency,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if failure.is_busy() {
            limiter.on_busy();
        }
        let document: Option<&BulkDocument> =
            request.documents.iter().find(|d| d.vid == failure.vid);
        let mut last_error = failure.reason.clone();

        if let Some(document) = document {
            let single = BulkRequest::single(document.clone());
            // the bulk request was attempt 1
            for attempt in 2..=self.policy.max_attempts() {
                self.counters.record_retry();
                self.backoff(self.policy.delay_for(attempt - 1), cancel)
                    .await?;

                match self.sink.send(&single).await {
                    Ok(failures) => match failures.into_iter().next() {
                        None => {
                            limiter.on_success();
                            debug!(vid = %failure.vid, attempt, "Document indexed on retry");
                            return Ok(true);
                        }
                        Some(again) => {
                            if again.is_busy() {
                                limiter.on_busy();
                            }
                            last_error = again.reason;
                        }
                    },
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        if e.is_busy() {
                            limiter.on_busy();
                        }
                        last_error = e.to_string();
                        if !e.is_retryable() {
                            break;
                        }
                    }
                }
            }
        }

        let document_error = IngestError::DocumentIndex {
            vid: failure.vid.clone(),
            reason: last_error,
        };
        warn!(seq, vid = %failure.vid, error = %document_error, "Document dead-lettered");
        let run_id = self.counters.run_id();
        let index = self.index().to_string();
        let vid = failure.vid.clone();
        let error = document_error.to_string();
        self.with_ledger(move |ledger| {
            ledger.record_dead_letter(run_id, &index, seq, &vid, &error)
        })
        .await?;
        self.counters.record_dead_letter();
        Ok(false)
    }
}
