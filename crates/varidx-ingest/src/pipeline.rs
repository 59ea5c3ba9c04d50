//! The parse job: annotation input → batch table
//!
//! Three stages joined by bounded channels:
//!
//! 1. one blocking parser thread reading the input in order
//! 2. `workers` flattening tasks sharing the unit queue
//! 3. one blocking writer thread that restores input order and cuts batches
//!
//! When the table writer stalls the queues fill and the parser blocks on
//! send. On cancellation the parser stops, the queues drain, and the trailing
//! incomplete batch is discarded.

use crate::config::ParseConfig;
use crate::error::{IngestError, Result};
use crate::flatten::{FlattenedVariantRecord, VariantFlattener};
use crate::nirvana::{AnnotationStreamParser, RawAnnotationUnit};
use crate::stats::{RunCounters, RunReport};
use crate::table::{BatchOutcome, BatchTableWriter};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type UnitMessage = (u64, RawAnnotationUnit);
/// `None` marks a unit that was skipped, so the writer can advance past it
type RecordMessage = (u64, Option<FlattenedVariantRecord>);

fn note_outcome(counters: &RunCounters, outcome: &BatchOutcome) {
    match outcome {
        BatchOutcome::Written { seq, records } => {
            counters.record_batch_written();
            debug!(seq, records, "Batch written");
        }
        BatchOutcome::Resumed { seq, records } => {
            counters.record_batch_resumed();
            debug!(seq, records, "Batch already present");
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> IngestError {
    IngestError::Worker(e.to_string())
}

pub struct ParseJob {
    config: ParseConfig,
    counters: Arc<RunCounters>,
}

impl ParseJob {
    pub fn new(config: ParseConfig) -> Self {
        Self {
            config,
            counters: Arc::new(RunCounters::new()),
        }
    }

    /// Live counters, for progress display
    pub fn counters(&self) -> Arc<RunCounters> {
        Arc::clone(&self.counters)
    }

    /// Parse `input` into the table at `output`
    ///
    /// The table is opened before any input is read, so an unwritable output
    /// fails the job immediately.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.config
            .validate()
            .map_err(|e| IngestError::config(e.to_string()))?;

        let writer = BatchTableWriter::open(output, self.config.batch_size)?;
        writer.set_source(&input.display().to_string())?;
        let parser =
            AnnotationStreamParser::open(input)?.with_max_positions(self.config.max_positions);

        info!(
            run_id = %self.counters.run_id(),
            input = %input.display(),
            output = %output.display(),
            batch_size = self.config.batch_size,
            workers = self.config.workers,
            "Starting parse"
        );
        self.run_with(parser, writer, cancel).await
    }

    /// Drive an already-open parser into an already-open table
    pub async fn run_with(
        &self,
        mut parser: AnnotationStreamParser,
        writer: BatchTableWriter,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let capacity = self.config.queue_capacity().max(1);
        let (unit_tx, unit_rx) = mpsc::channel::<UnitMessage>(capacity);
        let (record_tx, mut record_rx) = mpsc::channel::<RecordMessage>(capacity);

        let parser_task = {
            let counters = Arc::clone(&self.counters);
            let cancel = cancel.clone();
            let progress_every = self.config.progress_every.max(1);
            tokio::task::spawn_blocking(move || -> Result<Option<Value>> {
                let mut seq = 0u64;
                for item in parser.by_ref() {
                    if cancel.is_cancelled() {
                        info!("Parse cancelled, stopping input");
                        break;
                    }
                    match item {
                        Ok(unit) => {
                            counters.record_parsed();
                            if unit_tx.blocking_send((seq, unit)).is_err() {
                                // downstream stopped; its error is reported instead
                                break;
                            }
                            seq += 1;
                        }
                        Err(e) => match e.skip_reason() {
                            Some(reason) => {
                                counters.record_parsed();
                                counters.record_skip(reason);
                                warn!(error = %e, "Skipping unparseable position");
                            }
                            None => return Err(e),
                        },
                    }

                    let parsed = counters.parsed();
                    if parsed % progress_every == 0 {
                        info!(parsed, flattened = counters.flattened(), "Parse progress");
                    }
                }
                info!(
                    positions = parser.positions_read(),
                    units = seq,
                    "Finished reading input"
                );
                Ok(parser.header().cloned())
            })
        };

        let mut workers = JoinSet::new();
        let unit_rx = Arc::new(Mutex::new(unit_rx));
        for _ in 0..self.config.workers.max(1) {
            let unit_rx = Arc::clone(&unit_rx);
            let record_tx = record_tx.clone();
            let counters = Arc::clone(&self.counters);
            let flattener = VariantFlattener::new();
            workers.spawn(async move {
                loop {
                    let next = unit_rx.lock().await.recv().await;
                    let Some((seq, unit)) = next else { break };
                    let record = match flattener.flatten(&unit) {
                        Ok(record) => {
                            counters.record_flattened();
                            Some(record)
                        }
                        Err(e) => {
                            counters.record_skip(e.skip_reason().unwrap_or("schema"));
                            debug!(error = %e, "Skipping annotation unit");
                            None
                        }
                    };
                    if record_tx.send((seq, record)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(unit_rx);
        drop(record_tx);

        let writer_task = {
            let counters = Arc::clone(&self.counters);
            let mut writer = writer;
            tokio::task::spawn_blocking(move || -> Result<BatchTableWriter> {
                let mut next = 0u64;
                let mut reorder: BTreeMap<u64, Option<FlattenedVariantRecord>> = BTreeMap::new();
                while let Some((seq, record)) = record_rx.blocking_recv() {
                    reorder.insert(seq, record);
                    while let Some(record) = reorder.remove(&next) {
                        next += 1;
                        if let Some(record) = record {
                            if let Some(outcome) = writer.push(record)? {
                                note_outcome(&counters, &outcome);
                            }
                        }
                    }
                }
                Ok(writer)
            })
        };

        let parsed = parser_task.await.map_err(join_error);
        let mut worker_failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                worker_failure.get_or_insert(join_error(e));
            }
        }
        let mut writer = writer_task.await.map_err(join_error)??;

        let header = match parsed.and_then(|result| result) {
            Ok(header) => header,
            Err(e) => {
                writer.discard_pending();
                return Err(e);
            }
        };
        if let Some(e) = worker_failure {
            writer.discard_pending();
            return Err(e);
        }

        if cancel.is_cancelled() {
            writer.discard_pending();
            let report = self.counters.report();
            warn!(
                parsed = report.parsed,
                batches_written = report.batches_written,
                "Parse cancelled; rerun to resume"
            );
            return Ok(report);
        }

        let counters = Arc::clone(&self.counters);
        let report = tokio::task::spawn_blocking(move || -> Result<RunReport> {
            if let Some(outcome) = writer.flush()? {
                note_outcome(&counters, &outcome);
            }
            if let Some(header) = header {
                writer.set_header(&header)?;
            }
            let report = counters.report();
            writer.mark_completed(&report)?;
            Ok(report)
        })
        .await
        .map_err(join_error)??;

        info!(
            parsed = report.parsed,
            flattened = report.flattened,
            skipped = report.skipped,
            batches_written = report.batches_written,
            batches_resumed = report.batches_resumed,
            elapsed_ms = report.elapsed_ms,
            "Parse finished"
        );
        Ok(report)
    }
}
