//! Search-engine bulk endpoint client

use crate::config::ExportConfig;
use crate::error::{IngestError, Result};
use crate::export::request::{parse_bulk_response, BulkRequest, ItemFailure};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Response bodies quoted in errors are cut to this many characters
const MAX_ERROR_BODY: usize = 512;

/// Anything that accepts bulk requests
///
/// `Ok` carries the documents rejected inside an otherwise accepted request;
/// `Err` means the request as a whole failed.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn send(&self, request: &BulkRequest) -> Result<Vec<ItemFailure>>;
}

/// Elasticsearch/OpenSearch `_bulk` client
pub struct ElasticsearchClient {
    client: Client,
    bulk_url: String,
    credentials: Option<(String, String)>,
}

impl ElasticsearchClient {
    pub fn new(config: &ExportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| IngestError::config(format!("Failed to build HTTP client: {e}")))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            client,
            bulk_url: format!("{}/_bulk", config.base_url()),
            credentials,
        })
    }

    pub fn bulk_url(&self) -> &str {
        &self.bulk_url
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

/// Map a non-success status onto the error taxonomy
pub fn classify_status(status: StatusCode, body: &str) -> IngestError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status.as_u16() {
        401 | 403 => IngestError::Auth(message),
        429 | 503 => IngestError::busy(message),
        502 | 504 => IngestError::transient(message),
        code => IngestError::RequestRejected {
            status: code,
            message: truncate(body),
        },
    }
}

#[async_trait]
impl BulkSink for ElasticsearchClient {
    async fn send(&self, request: &BulkRequest) -> Result<Vec<ItemFailure>> {
        let mut builder = self
            .client
            .post(&self.bulk_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(request.body());
        if let Some((user, password)) = &self.credentials {
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                IngestError::transient(format!("bulk request timed out: {e}"))
            } else {
                IngestError::transient(format!("bulk request failed: {e}"))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IngestError::transient(format!("failed to read bulk response: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let failures = parse_bulk_response(request, &body)?;
        debug!(
            documents = request.len(),
            failed = failures.len(),
            "Bulk request accepted"
        );
        Ok(failures)
    }
}
