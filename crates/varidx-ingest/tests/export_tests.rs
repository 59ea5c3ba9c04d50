//! Export job against a mock `_bulk` endpoint

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use varidx_ingest::config::{ExportConfig, ParseConfig};
use varidx_ingest::export::{
    ledger_path_for, BulkIndexExporter, ElasticsearchClient, ExportLedger,
};
use varidx_ingest::pipeline::ParseJob;
use varidx_ingest::table::BatchTableReader;
use varidx_ingest::{IngestError, RunReport};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

/// Parse `count` simple SNVs into a table with the given batch size
async fn build_table(dir: &Path, count: u64, batch_size: usize) -> PathBuf {
    let positions: Vec<String> = (1..=count)
        .map(|pos| {
            format!(
                r#"{{"chromosome":"chr3","position":{pos},"refAllele":"A","altAlleles":["T"],"variants":[{{"transcripts":[{{"hgnc":"BRAF","consequence":["synonymous_variant"]}}]}}]}}"#
            )
        })
        .collect();
    let input = dir.join("input.json");
    std::fs::write(
        &input,
        format!(r#"{{"header":{{}},"positions":[{}]}}"#, positions.join(",")),
    )
    .unwrap();

    let output = dir.join("variants.db");
    let config = ParseConfig {
        batch_size,
        workers: 2,
        ..Default::default()
    };
    ParseJob::new(config)
        .run(&input, &output, CancellationToken::new())
        .await
        .unwrap();
    output
}

fn config_for(server: &MockServer) -> ExportConfig {
    let address = server.address();
    ExportConfig {
        host: address.ip().to_string(),
        port: address.port(),
        index: "variants".to_string(),
        concurrency: 2,
        max_attempts: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 10,
        ..Default::default()
    }
}

async fn export(table: &Path, config: &ExportConfig) -> Result<RunReport, IngestError> {
    let reader = Arc::new(BatchTableReader::open(table).unwrap());
    let ledger = Arc::new(ExportLedger::open(&ledger_path_for(table)).unwrap());
    let client = Arc::new(ElasticsearchClient::new(config).unwrap());
    BulkIndexExporter::new(client, ledger, config)
        .run(reader, CancellationToken::new())
        .await
}

/// Document ids in a bulk request body
fn bulk_ids(request: &Request) -> Vec<String> {
    String::from_utf8_lossy(&request.body)
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|line| line["index"]["_id"].as_str().map(str::to_string))
        .collect()
}

/// Accepts every document, answering with one item per action line
struct AcceptAll;

impl Respond for AcceptAll {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let items: Vec<Value> = bulk_ids(request)
            .iter()
            .map(|id| json!({"index": {"_id": id, "status": 200}}))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({"took": 1, "errors": false, "items": items}))
    }
}

/// Rejects one document id every time
struct RejectOne(&'static str);

impl Respond for RejectOne {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let items: Vec<Value> = bulk_ids(request)
            .iter()
            .map(|id| {
                if id == self.0 {
                    json!({"index": {"_id": id, "status": 400,
                        "error": {"type": "mapper_parsing_exception", "reason": "bad field"}}})
                } else {
                    json!({"index": {"_id": id, "status": 201}})
                }
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({"took": 1, "errors": true, "items": items}))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_busy_twice_then_success_counts_two_retries() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), 5, 10).await;
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(429).set_body_string("es_rejected_execution_exception"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(AcceptAll)
        .expect(1)
        .mount(&server)
        .await;

    let report = export(&table, &config_for(&server)).await.unwrap();
    assert_eq!(report.batches_exported, 1);
    assert_eq!(report.batches_failed, 0);
    assert_eq!(report.retries, 2);
    assert_eq!(report.indexed, 5);
}

#[tokio::test]
async fn test_rerun_sends_same_document_ids() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), 25, 10).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(AcceptAll)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let first = export(&table, &config).await.unwrap();
    let after_first: BTreeSet<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .flat_map(bulk_ids)
        .collect();

    let second = export(&table, &config).await.unwrap();
    let after_second: BTreeSet<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .flat_map(bulk_ids)
        .collect();

    assert_eq!(first.indexed, 25);
    assert_eq!(second.indexed, 25);
    // ids are the document identity, so the distinct set is the index content
    assert_eq!(after_first.len(), 25);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn test_rejected_document_is_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), 6, 10).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(RejectOne("3-4-A-T"))
        .mount(&server)
        .await;

    let report = export(&table, &config_for(&server)).await.unwrap();
    assert_eq!(report.indexed, 5);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.batches_exported, 1);

    let ledger = ExportLedger::open(&ledger_path_for(&table)).unwrap();
    let letters = ledger.dead_letters("variants").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].vid, "3-4-A-T");
    assert!(letters[0].error.contains("mapper_parsing_exception"));
}

#[tokio::test]
async fn test_auth_failure_aborts_run() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), 30, 10).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let err = export(&table, &config_for(&server)).await.unwrap_err();
    assert!(matches!(err, IngestError::Auth(_)));
}

#[tokio::test]
async fn test_unreachable_cluster_fails_with_exhausted_retry() {
    let dir = TempDir::new().unwrap();
    let table = build_table(dir.path(), 20, 10).await;
    let config = ExportConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        concurrency: 1,
        max_attempts: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        request_timeout_secs: 2,
        ..Default::default()
    };

    let err = export(&table, &config).await.unwrap_err();
    assert!(matches!(err, IngestError::ExhaustedRetry(_)));
    assert!(err.is_fatal());
}
