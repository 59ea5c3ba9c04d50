//! Bulk request bodies and bulk responses
//!
//! A request body is newline-delimited JSON: an `index` action line naming
//! `_index` and `_id = vid`, followed by the document itself. `index` replaces
//! an existing document with the same id, so resending a request is an
//! upsert.

use crate::error::Result;
use crate::flatten::FlattenedVariantRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

#[derive(Serialize)]
struct IndexAction<'a> {
    index: ActionMeta<'a>,
}

/// One action/document pair, already encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDocument {
    pub vid: String,
    pub lines: String,
}

impl BulkDocument {
    pub fn encode(index: &str, record: &FlattenedVariantRecord) -> Result<Self> {
        let action = IndexAction {
            index: ActionMeta {
                index,
                id: &record.vid,
            },
        };
        let mut lines = serde_json::to_string(&action)?;
        lines.push('\n');
        lines.push_str(&serde_json::to_string(record)?);
        lines.push('\n');
        Ok(Self {
            vid: record.vid.clone(),
            lines,
        })
    }

    pub fn len_bytes(&self) -> usize {
        self.lines.len()
    }
}

/// Documents sent together in one `_bulk` call, in batch order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BulkRequest {
    pub documents: Vec<BulkDocument>,
}

impl BulkRequest {
    pub fn single(document: BulkDocument) -> Self {
        Self {
            documents: vec![document],
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.documents.iter().map(BulkDocument::len_bytes).sum()
    }

    pub fn body(&self) -> String {
        let mut body = String::with_capacity(self.size_bytes());
        for document in &self.documents {
            body.push_str(&document.lines);
        }
        body
    }

    pub fn vids(&self) -> impl Iterator<Item = &str> {
        self.documents.iter().map(|d| d.vid.as_str())
    }
}

/// Pack records into requests of at most `max_docs` documents and
/// `max_bytes` of body, preserving record order
///
/// A single document larger than `max_bytes` still gets a request of its own.
pub fn split_requests(
    index: &str,
    records: &[FlattenedVariantRecord],
    max_docs: usize,
    max_bytes: usize,
) -> Result<Vec<BulkRequest>> {
    let max_docs = max_docs.max(1);
    let mut requests = Vec::new();
    let mut current = BulkRequest::default();
    let mut current_bytes = 0usize;

    for record in records {
        let document = BulkDocument::encode(index, record)?;
        let size = document.len_bytes();
        let full = current.len() >= max_docs || current_bytes + size > max_bytes;
        if !current.is_empty() && full {
            requests.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.documents.push(document);
    }
    if !current.is_empty() {
        requests.push(current);
    }
    Ok(requests)
}

#[derive(Debug, Deserialize)]
struct BulkItemResult {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseBody {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<BTreeMap<String, BulkItemResult>>,
}

/// A document the cluster rejected inside an accepted bulk response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub vid: String,
    pub status: u16,
    pub reason: String,
}

impl ItemFailure {
    /// The node's write queue was full for this document
    pub fn is_busy(&self) -> bool {
        self.status == 429
    }
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::Object(map) => {
            let kind = map.get("type").and_then(Value::as_str).unwrap_or("error");
            match map.get("reason").and_then(Value::as_str) {
                Some(reason) => format!("{kind}: {reason}"),
                None => kind.to_string(),
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Failed items of a 2xx bulk response, matched to the request by position
pub fn parse_bulk_response(request: &BulkRequest, body: &str) -> Result<Vec<ItemFailure>> {
    let response: BulkResponseBody = serde_json::from_str(body)?;
    if !response.errors {
        return Ok(Vec::new());
    }

    let mut failures = Vec::new();
    for (position, document) in request.documents.iter().enumerate() {
        let item = response
            .items
            .get(position)
            .and_then(|item| item.values().next());
        let failure = match item {
            Some(result) if result.error.is_none() && result.status < 300 => continue,
            Some(result) => ItemFailure {
                vid: document.vid.clone(),
                status: result.status,
                reason: result
                    .error
                    .as_ref()
                    .map(describe_error)
                    .unwrap_or_else(|| format!("status {}", result.status)),
            },
            None => ItemFailure {
                vid: document.vid.clone(),
                status: 0,
                reason: "missing from bulk response".to_string(),
            },
        };
        failures.push(failure);
    }
    Ok(failures)
}
