//! Local directory connector
//!
//! Discovery is a single directory walk per turn. The listing is sorted newest
//! first and served out in pages from memory; the cursor is an offset into it.

use super::{content_id, DiscoveryPage, SourceConnector};
use crate::error::{Result, SyncError};
use crate::models::{ItemMetadata, LocalSourceConfig, RawContent, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File extensions the downstream parsers understand
pub const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "pdf", "docx", "doc"];

pub struct LocalConnector {
    source_name: String,
    config: LocalSourceConfig,
    page_size: usize,
    listing: Mutex<Option<Vec<ItemMetadata>>>,
}

impl LocalConnector {
    pub fn new(source_name: &str, config: LocalSourceConfig, page_size: usize) -> Self {
        Self {
            source_name: source_name.to_string(),
            config,
            page_size,
            listing: Mutex::new(None),
        }
    }
}

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_lowercase();
            SUPPORTED_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Walk `root` once, returning supported files newest first
fn walk(source_name: &str, root: &Path, recursive: bool) -> Result<Vec<ItemMetadata>> {
    if !root.is_dir() {
        return Err(SyncError::Discovery(format!(
            "{} is not a readable directory",
            root.display()
        )));
    }

    let mut walker = WalkDir::new(root).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut items = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_supported(entry.path()) {
            continue;
        }
        // Hidden files and anything inside hidden directories
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("No metadata for {}: {}", entry.path().display(), e);
                continue;
            }
        };
        let rel_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        items.push(ItemMetadata {
            content_id: content_id(source_name, SourceKind::Local, &rel_path),
            title: entry.file_name().to_string_lossy().into_owned(),
            mime_type: mime_guess::from_path(entry.path())
                .first()
                .map(|m| m.essence_str().to_string()),
            size: Some(metadata.len()),
            modified_time: metadata.modified().ok().map(DateTime::<Utc>::from),
            locator: entry.path().to_string_lossy().into_owned(),
            path: rel_path,
        });
    }

    // Newest first; path breaks ties so the order is total
    items.sort_by(|a, b| {
        b.modified_time
            .cmp(&a.modified_time)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(items)
}

#[async_trait]
impl SourceConnector for LocalConnector {
    async fn discover(&self, cursor: Option<&str>, page_size: usize) -> Result<DiscoveryPage> {
        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| SyncError::Discovery(format!("bad cursor '{}'", c)))?,
            None => 0,
        };

        let mut listing = self.listing.lock().await;
        if offset == 0 || listing.is_none() {
            let name = self.source_name.clone();
            let root: PathBuf = self.config.path.clone();
            let recursive = self.config.recursive;
            let items = tokio::task::spawn_blocking(move || walk(&name, &root, recursive))
                .await
                .map_err(|e| SyncError::Discovery(format!("directory walk aborted: {}", e)))??;
            debug!("Walked {} files for '{}'", items.len(), self.source_name);
            *listing = Some(items);
        }

        let all = listing.as_deref().unwrap_or_default();
        let page_size = page_size.max(1);
        let end = (offset + page_size).min(all.len());
        let items = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_cursor = (end < all.len()).then(|| end.to_string());

        Ok(DiscoveryPage { items, next_cursor })
    }

    async fn fetch(&self, item: &ItemMetadata) -> Result<RawContent> {
        let bytes = tokio::fs::read(&item.locator)
            .await
            .map_err(|e| SyncError::Fetch(format!("{}: {}", item.path, e)))?;

        Ok(RawContent {
            content_id: item.content_id.clone(),
            source_name: self.source_name.clone(),
            source_kind: SourceKind::Local,
            title: item.title.clone(),
            path: item.path.clone(),
            mime_type: item.mime_type.clone(),
            modified_time: item.modified_time,
            bytes,
        })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
