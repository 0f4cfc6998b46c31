//! Contracts with the downstream indexing service
//!
//! The runner asks a [`DedupOracle`] whether content is already stored and
//! hands fetched content to an [`IngestionPipeline`]. Ingestion must be
//! idempotent per content id.

use crate::error::{Result, SyncError};
use crate::models::{IngestStats, RawContent};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

/// "Has content id X already been stored?"
#[async_trait]
pub trait DedupOracle: Send + Sync {
    async fn already_stored(&self, content_id: &str) -> Result<bool>;
}

/// Chunk, embed and store a batch of documents
#[async_trait]
pub trait IngestionPipeline: Send + Sync {
    async fn ingest(&self, batch: Vec<RawContent>) -> Result<IngestStats>;
}

// === HTTP implementation ===

/// Client for an indexing service exposing `/documents/{id}` and `/ingest`
pub struct HttpPipeline {
    http: reqwest::Client,
    base: String,
}

#[derive(Serialize)]
struct IngestDocument<'a> {
    content_id: &'a str,
    source: &'a str,
    source_kind: &'a str,
    title: &'a str,
    path: &'a str,
    mime_type: Option<&'a str>,
    modified_time: Option<DateTime<Utc>>,
    content_base64: String,
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    documents: Vec<IngestDocument<'a>>,
}

impl HttpPipeline {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(base)?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DedupOracle for HttpPipeline {
    async fn already_stored(&self, content_id: &str) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/documents/{}", self.base, content_id))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(SyncError::Ingestion(format!("dedup lookup returned {}", s))),
        }
    }
}

#[async_trait]
impl IngestionPipeline for HttpPipeline {
    async fn ingest(&self, batch: Vec<RawContent>) -> Result<IngestStats> {
        if batch.is_empty() {
            return Ok(IngestStats::default());
        }

        let engine = base64::engine::general_purpose::STANDARD;
        let request = IngestRequest {
            documents: batch
                .iter()
                .map(|doc| IngestDocument {
                    content_id: &doc.content_id,
                    source: &doc.source_name,
                    source_kind: doc.source_kind.as_str(),
                    title: &doc.title,
                    path: &doc.path,
                    mime_type: doc.mime_type.as_deref(),
                    modified_time: doc.modified_time,
                    content_base64: engine.encode(&doc.bytes),
                })
                .collect(),
        };

        let response = self
            .http
            .post(format!("{}/ingest", self.base))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Ingestion(format!(
                "ingest returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response.json::<IngestStats>().await?)
    }
}

// === In-memory implementation ===

/// In-process ledger implementing both contracts.
///
/// Stored ids live only as long as the ledger. An optional per-item delay
/// simulates ingestion cost.
#[derive(Default)]
pub struct MemoryLedger {
    stored: Mutex<HashSet<String>>,
    per_item_delay: Duration,
    chunks_per_item: u64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            chunks_per_item: 1,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, per_item: Duration) -> Self {
        self.per_item_delay = per_item;
        self
    }

    pub fn seed<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stored.lock().extend(ids.into_iter().map(Into::into));
    }

    pub fn contains(&self, content_id: &str) -> bool {
        self.stored.lock().contains(content_id)
    }

    pub fn len(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupOracle for MemoryLedger {
    async fn already_stored(&self, content_id: &str) -> Result<bool> {
        Ok(self.contains(content_id))
    }
}

#[async_trait]
impl IngestionPipeline for MemoryLedger {
    async fn ingest(&self, batch: Vec<RawContent>) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        for doc in batch {
            if !self.per_item_delay.is_zero() {
                tokio::time::sleep(self.per_item_delay).await;
            }
            if self.stored.lock().insert(doc.content_id) {
                stats.processed += 1;
                stats.chunks += self.chunks_per_item;
            } else {
                stats.skipped += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;

    fn doc(id: &str) -> RawContent {
        RawContent {
            content_id: id.into(),
            source_name: "notes".into(),
            source_kind: SourceKind::Local,
            title: id.into(),
            path: id.into(),
            mime_type: Some("text/plain".into()),
            modified_time: None,
            bytes: b"hello".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_ledger_ingest_is_idempotent() {
        let ledger = MemoryLedger::new();
        let first = ledger.ingest(vec![doc("a"), doc("b")]).await.unwrap();
        assert_eq!(first.processed, 2);
        let second = ledger.ingest(vec![doc("a")]).await.unwrap();
        assert_eq!(second, IngestStats { processed: 0, skipped: 1, chunks: 0 });
        assert!(ledger.already_stored("b").await.unwrap());
        assert!(!ledger.already_stored("c").await.unwrap());
    }
}
