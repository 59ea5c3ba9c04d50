//! varidx - annotation ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use varidx_common::logging::{init_logging, LogConfig, LogLevel};
use varidx_ingest::config::{ExportConfig, ParseConfig};
use varidx_ingest::export::{ledger_path_for, BulkIndexExporter, ElasticsearchClient, ExportLedger};
use varidx_ingest::pipeline::ParseJob;
use varidx_ingest::stats::{RunCounters, RunReport};
use varidx_ingest::table::BatchTableReader;

#[derive(Parser, Debug)]
#[command(name = "varidx")]
#[command(author, version, about = "Variant annotation ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flatten an annotation dump into a batch table
    Parse {
        /// Annotation JSON, plain or gzipped
        #[arg(short, long)]
        input: PathBuf,

        /// Batch table to create or resume
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Flattening workers
        #[arg(long)]
        workers: Option<usize>,

        /// Stop after this many input positions
        #[arg(long)]
        max_positions: Option<u64>,
    },

    /// Bulk-load a batch table into a search index
    Export {
        /// Batch table written by `parse`
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long)]
        index: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Batches in flight at once
        #[arg(long)]
        concurrency: Option<usize>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("varidx")
        .build();
    // environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let code = match execute(cli.command, cancel.clone()).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                if cancel.is_cancelled() {
                    130
                } else {
                    0
                }
            }
            Err(e) => {
                eprintln!("Error: failed to serialize run report: {e}");
                1
            }
        },
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            1
        }
    };

    // flush buffered file logs before exiting
    drop(guard);
    process::exit(code);
}

async fn execute(command: Command, cancel: CancellationToken) -> Result<RunReport> {
    match command {
        Command::Parse {
            input,
            output,
            batch_size,
            workers,
            max_positions,
        } => {
            let mut config = ParseConfig::from_env().context("Invalid parse configuration")?;
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if max_positions.is_some() {
                config.max_positions = max_positions;
            }
            config.validate()?;

            let job = ParseJob::new(config);
            let report = with_spinner(
                "Parsing",
                job.counters(),
                describe_parse,
                job.run(&input, &output, cancel),
            )
            .await
            .with_context(|| format!("Failed to parse {}", input.display()))?;
            Ok(report)
        }

        Command::Export {
            input,
            index,
            host,
            port,
            concurrency,
            max_attempts,
        } => {
            let mut config = ExportConfig::from_env().context("Invalid export configuration")?;
            if let Some(index) = index {
                config.index = index;
            }
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(max_attempts) = max_attempts {
                config.max_attempts = max_attempts;
            }
            config.validate()?;

            let table = Arc::new(
                BatchTableReader::open(&input)
                    .with_context(|| format!("Failed to open table {}", input.display()))?,
            );
            let ledger = Arc::new(ExportLedger::open(&ledger_path_for(&input))?);
            let client = Arc::new(ElasticsearchClient::new(&config)?);
            info!(url = %client.bulk_url(), index = %config.index, "Exporting");

            let exporter = BulkIndexExporter::new(client, ledger, &config);
            let report = with_spinner(
                "Exporting",
                exporter.counters(),
                describe_export,
                exporter.run(table, cancel),
            )
            .await
            .with_context(|| format!("Failed to export {}", input.display()))?;
            Ok(report)
        }
    }
}

fn describe_parse(r: &RunReport) -> String {
    format!(
        "{} parsed, {} flattened, {} skipped, {} batches",
        r.parsed,
        r.flattened,
        r.skipped,
        r.batches_written + r.batches_resumed
    )
}

fn describe_export(r: &RunReport) -> String {
    format!(
        "{} indexed, {} batches, {} failed, {} dead-lettered",
        r.indexed, r.batches_exported, r.batches_failed, r.dead_lettered
    )
}

/// Drive `job` while a spinner shows its live counters
async fn with_spinner<F, T>(
    label: &str,
    counters: Arc<RunCounters>,
    describe: fn(&RunReport) -> String,
    job: F,
) -> T
where
    F: Future<Output = T>,
{
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {prefix}: {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_prefix(label.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    tokio::pin!(job);
    let output = loop {
        tokio::select! {
            output = &mut job => break output,
            _ = ticker.tick() => spinner.set_message(describe(&counters.report())),
        }
    };
    spinner.finish_and_clear();
    output
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight work");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight work");
        },
    }
    token.cancel();
}
