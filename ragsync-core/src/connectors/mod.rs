//! Source connectors
//!
//! Every connector works in two phases. `discover` returns cheap,
//! metadata-only pages in a fixed order. `fetch` retrieves the content of a
//! single item and is only called for items the dedup oracle has not seen.

pub mod local;
pub mod remote;

pub use local::LocalConnector;
pub use remote::{DriveClient, RemoteConnector, RemoteFolder};

use crate::error::Result;
use crate::models::{ItemMetadata, RawContent, Source, SourceConfig, SourceKind};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// One page of discovered items
#[derive(Debug, Clone, Default)]
pub struct DiscoveryPage {
    pub items: Vec<ItemMetadata>,
    /// `None` once the listing is exhausted
    pub next_cursor: Option<String>,
}

/// Two-phase access to one source's documents
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// List one page of item metadata. `cursor` is `None` for the first page.
    async fn discover(&self, cursor: Option<&str>, page_size: usize) -> Result<DiscoveryPage>;

    /// Retrieve the content of one discovered item.
    async fn fetch(&self, item: &ItemMetadata) -> Result<RawContent>;

    /// Page size suited to this connector's backend
    fn page_size(&self) -> usize;
}

/// Builds a connector for a source at the start of its turn
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, source: &Source) -> Result<Box<dyn SourceConnector>>;
}

/// Factory for the built-in local and remote connectors
pub struct DefaultConnectorFactory {
    drive: Arc<DriveClient>,
    local_page_size: usize,
}

impl DefaultConnectorFactory {
    pub fn new(drive: Arc<DriveClient>, local_page_size: usize) -> Self {
        Self {
            drive,
            local_page_size,
        }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn connector(&self, source: &Source) -> Result<Box<dyn SourceConnector>> {
        Ok(match &source.config {
            SourceConfig::Remote(remote) => Box::new(RemoteConnector::new(
                &source.name,
                remote.clone(),
                self.drive.clone(),
            )),
            SourceConfig::Local(local) => Box::new(LocalConnector::new(
                &source.name,
                local.clone(),
                self.local_page_size,
            )),
        })
    }
}

/// Deterministic content id: SHA-256 over source name, kind and path.
///
/// The provider's own file id is deliberately not part of it, so an item
/// that is re-shared under a new id keeps its identity.
pub fn content_id(source_name: &str, kind: SourceKind, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(path.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
