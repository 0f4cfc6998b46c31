//! Shared fakes for runner and scheduler tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use ragsync_core::connectors::content_id;
use ragsync_core::{
    Alert, ConnectorFactory, DedupOracle, DiscoveryPage, ItemMetadata, LocalSourceConfig, Notifier,
    RawContent, RemoteSourceConfig, Result, Source, SourceConfig, SourceConnector, SourceKind,
    SyncError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour of one fake source
pub struct FakeSource {
    pub name: String,
    pub kind: SourceKind,
    pub items: Vec<ItemMetadata>,
    pub page_size: usize,
    pub discovery_error: Option<String>,
    pub fetch_failures: HashSet<String>,
    pub reauth_on_fetch: bool,
    pub discover_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(name: &str, kind: SourceKind, count: usize) -> Self {
        let items = (0..count)
            .map(|i| {
                let path = format!("docs/item-{:03}.md", i);
                ItemMetadata {
                    content_id: content_id(name, kind, &path),
                    title: format!("item-{:03}.md", i),
                    mime_type: Some("text/markdown".into()),
                    size: Some(64),
                    modified_time: Some(Utc::now()),
                    locator: format!("{}-{}", name, i),
                    path,
                }
            })
            .collect();
        Self {
            name: name.to_string(),
            kind,
            items,
            page_size: 100,
            discovery_error: None,
            fetch_failures: HashSet::new(),
            reauth_on_fetch: false,
            discover_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn failing_discovery(mut self, message: &str) -> Self {
        self.discovery_error = Some(message.to_string());
        self
    }

    pub fn failing_fetch(mut self, indexes: &[usize]) -> Self {
        for i in indexes {
            self.fetch_failures.insert(self.items[*i].content_id.clone());
        }
        self
    }

    pub fn reauth_on_fetch(mut self) -> Self {
        self.reauth_on_fetch = true;
        self
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.content_id.clone()).collect()
    }

    /// Matching `Source` row
    pub fn source(&self) -> Source {
        let config = match self.kind {
            SourceKind::Remote => SourceConfig::Remote(RemoteSourceConfig::default()),
            SourceKind::Local => SourceConfig::Local(LocalSourceConfig {
                path: format!("/fake/{}", self.name).into(),
                recursive: true,
            }),
        };
        Source {
            id: 0,
            name: self.name.clone(),
            enabled: true,
            config,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn discover_calls(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

struct FakeConnector(Arc<FakeSource>);

#[async_trait]
impl SourceConnector for FakeConnector {
    async fn discover(&self, cursor: Option<&str>, page_size: usize) -> Result<DiscoveryPage> {
        let fake = &self.0;
        fake.discover_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &fake.discovery_error {
            return Err(SyncError::Discovery(message.clone()));
        }
        let offset: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let end = (offset + page_size).min(fake.items.len());
        Ok(DiscoveryPage {
            items: fake.items[offset..end].to_vec(),
            next_cursor: (end < fake.items.len()).then(|| end.to_string()),
        })
    }

    async fn fetch(&self, item: &ItemMetadata) -> Result<RawContent> {
        let fake = &self.0;
        fake.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if fake.reauth_on_fetch {
            return Err(SyncError::ReauthorizationRequired("token revoked".into()));
        }
        if fake.fetch_failures.contains(&item.content_id) {
            return Err(SyncError::Fetch(format!("{} unreadable", item.path)));
        }
        Ok(RawContent {
            content_id: item.content_id.clone(),
            source_name: fake.name.clone(),
            source_kind: fake.kind,
            title: item.title.clone(),
            path: item.path.clone(),
            mime_type: item.mime_type.clone(),
            modified_time: item.modified_time,
            bytes: b"# fake document".to_vec(),
        })
    }

    fn page_size(&self) -> usize {
        self.0.page_size
    }
}

/// Factory handing out fake connectors by source name
#[derive(Default)]
pub struct FakeFactory {
    sources: Mutex<HashMap<String, Arc<FakeSource>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, fake: FakeSource) -> Arc<FakeSource> {
        let fake = Arc::new(fake);
        self.sources.lock().insert(fake.name.clone(), fake.clone());
        fake
    }
}

impl ConnectorFactory for FakeFactory {
    fn connector(&self, source: &Source) -> Result<Box<dyn SourceConnector>> {
        let fake = self
            .sources
            .lock()
            .get(&source.name)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(source.name.clone()))?;
        Ok(Box::new(FakeConnector(fake)))
    }
}

/// Notifier that remembers every alert
#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

/// Dedup oracle that takes a fixed time per lookup and knows nothing
pub struct SlowOracle {
    pub per_lookup: Duration,
    pub lookups: AtomicUsize,
}

impl SlowOracle {
    pub fn new(per_lookup: Duration) -> Self {
        Self {
            per_lookup,
            lookups: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DedupOracle for SlowOracle {
    async fn already_stored(&self, _content_id: &str) -> Result<bool> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.per_lookup).await;
        Ok(false)
    }
}
