//! Remote file store connector (Drive v3 REST API)
//!
//! All remote sources share one [`DriveClient`], and through it one
//! credential. Listing, export and download calls retry on rate limiting
//! and server errors, honouring `Retry-After` when the server sends one.

use super::{content_id, DiscoveryPage, SourceConnector};
use crate::config::SyncConfig;
use crate::credentials::CredentialManager;
use crate::error::{Result, SyncError};
use crate::models::{
    DiscoveryMode, ItemMetadata, RawContent, RemoteSourceConfig, SourceKind,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Retries after the first attempt on 429 / 5xx
pub const MAX_RETRIES: u32 = 3;

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a remote MIME type is retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retrieval {
    /// Native document, exported to the given type
    Export(&'static str),
    Download,
}

/// Remote MIME types the downstream parsers understand
pub const SUPPORTED_MIME_TYPES: &[(&str, Retrieval)] = &[
    ("application/vnd.google-apps.document", Retrieval::Export("text/plain")),
    ("application/vnd.google-apps.spreadsheet", Retrieval::Export("text/csv")),
    ("text/plain", Retrieval::Download),
    ("text/markdown", Retrieval::Download),
    ("application/pdf", Retrieval::Download),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Retrieval::Download,
    ),
];

pub fn retrieval_for(mime: &str) -> Option<Retrieval> {
    SUPPORTED_MIME_TYPES
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, r)| *r)
}

/// A remote folder, for picking a source's scope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
    pub modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Thin authenticated client for the remote store's REST API
pub struct DriveClient {
    http: reqwest::Client,
    base: String,
    credentials: Arc<CredentialManager>,
    page_size: usize,
    max_download_bytes: u64,
}

impl DriveClient {
    pub fn new(config: &SyncConfig, credentials: Arc<CredentialManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            http,
            base: config.drive_api_url.trim_end_matches('/').to_string(),
            credentials,
            page_size: config.remote_page_size,
            max_download_bytes: config.max_download_bytes,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    async fn list(&self, params: &[(&str, String)]) -> Result<FileList> {
        let token = self.credentials.ensure_valid().await?.access_token;
        let url = format!("{}/files", self.base);
        let response = send_with_retry(|| {
            self.http.get(&url).bearer_auth(&token).query(params)
        })
        .await
        .map_err(|e| SyncError::Discovery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Discovery(format!(
                "listing returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        response
            .json::<FileList>()
            .await
            .map_err(|e| SyncError::Discovery(format!("malformed listing: {}", e)))
    }

    /// Folders directly under `parent` (`None` = root), by name
    pub async fn list_folders(&self, parent: Option<&str>) -> Result<Vec<RemoteFolder>> {
        let parent = parent.unwrap_or("root");
        let query = format!(
            "mimeType='{}' and trashed=false and '{}' in parents",
            FOLDER_MIME,
            escape_query(parent)
        );

        let mut folders = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.clone()),
                ("pageSize", "100".to_string()),
                ("orderBy", "name".to_string()),
                (
                    "fields",
                    "nextPageToken, files(id, name, mimeType, modifiedTime)".to_string(),
                ),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let list = self.list(&params).await?;
            folders.extend(list.files.into_iter().map(|f| RemoteFolder {
                id: f.id,
                name: f.name,
                modified_time: f.modified_time,
            }));
            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(folders)
    }

    async fn download(&self, file_id: &str, retrieval: Retrieval) -> Result<Vec<u8>> {
        let token = self.credentials.ensure_valid().await?.access_token;
        let response = match retrieval {
            Retrieval::Export(target) => {
                let url = format!("{}/files/{}/export", self.base, file_id);
                send_with_retry(|| {
                    self.http
                        .get(&url)
                        .bearer_auth(&token)
                        .query(&[("mimeType", target)])
                })
                .await
            }
            Retrieval::Download => {
                let url = format!("{}/files/{}", self.base, file_id);
                send_with_retry(|| {
                    self.http
                        .get(&url)
                        .bearer_auth(&token)
                        .query(&[("alt", "media")])
                })
                .await
            }
        }
        .map_err(|e| SyncError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Fetch(format!("download returned {}", status)));
        }
        if let Some(len) = response.content_length() {
            if len > self.max_download_bytes {
                return Err(SyncError::Fetch(format!(
                    "{} bytes exceeds the {} byte limit",
                    len, self.max_download_bytes
                )));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;
        if bytes.len() as u64 > self.max_download_bytes {
            return Err(SyncError::Fetch(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_download_bytes
            )));
        }
        Ok(bytes.to_vec())
    }
}

/// Send a request, retrying on 429, 5xx and transport errors.
///
/// Returns the last response once retries run out, so callers can report
/// the final status.
async fn send_with_retry<F>(build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        match build().send().await {
            Ok(response) => {
                let status = response.status();
                let retryable =
                    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                if !retryable || attempt >= MAX_RETRIES {
                    return Ok(response);
                }
                let wait = retry_after(&response).unwrap_or_else(|| backoff(attempt));
                warn!(%status, attempt, "Remote API throttled, retrying in {:?}", wait);
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e.into());
                }
                let wait = backoff(attempt);
                warn!(attempt, "Remote request failed ({}), retrying in {:?}", e, wait);
                tokio::time::sleep(wait).await;
            }
        }
        attempt += 1;
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_BACKOFF))
}

fn backoff(attempt: u32) -> Duration {
    (BASE_BACKOFF * 2u32.saturating_pow(attempt)).min(MAX_BACKOFF)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Connector for one remote source
pub struct RemoteConnector {
    source_name: String,
    config: RemoteSourceConfig,
    drive: Arc<DriveClient>,
}

impl RemoteConnector {
    pub fn new(source_name: &str, config: RemoteSourceConfig, drive: Arc<DriveClient>) -> Self {
        Self {
            source_name: source_name.to_string(),
            config,
            drive,
        }
    }

    /// Listing query for this source, as of `now`
    pub fn query(&self, now: DateTime<Utc>) -> String {
        let mimes = SUPPORTED_MIME_TYPES
            .iter()
            .map(|(m, _)| format!("mimeType='{}'", m))
            .collect::<Vec<_>>()
            .join(" or ");

        let mut parts = vec![format!("({})", mimes), "trashed=false".to_string()];
        if let Some(folder) = &self.config.folder_id {
            parts.push(format!("'{}' in parents", escape_query(folder)));
        }
        if self.config.discovery_mode == DiscoveryMode::RecentlyTouched {
            match now.checked_sub_signed(self.config.lookback_window()) {
                Some(cutoff) => parts.push(format!(
                    "viewedByMeTime > '{}'",
                    cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)
                )),
                None => warn!(
                    "Lookback of {} days reaches past the calendar; not filtering",
                    self.config.lookback_days
                ),
            }
        }
        parts.join(" and ")
    }

    pub fn order_by(&self) -> &'static str {
        match self.config.discovery_mode {
            DiscoveryMode::RecentlyTouched => "viewedByMeTime desc",
            // Creation time never changes, so pages stay stable between runs
            DiscoveryMode::FullListing => "createdTime desc,name",
        }
    }

    /// Map one page of listed files to items.
    ///
    /// The content path is `{parent}/{name}`, so a re-shared copy keeps its
    /// content id. Files sharing a name within one folder would collide, so
    /// those get their provider id appended.
    fn to_items(&self, files: Vec<DriveFile>) -> Vec<ItemMetadata> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        for file in &files {
            *seen.entry(plain_path(file)).or_default() += 1;
        }
        files
            .into_iter()
            .map(|file| {
                let plain = plain_path(&file);
                let path = if seen.get(&plain).copied().unwrap_or(0) > 1 {
                    warn!(
                        source = %self.source_name,
                        "Several files named {} in one folder; keying {} by its id",
                        plain,
                        file.id
                    );
                    format!("{}#{}", plain, file.id)
                } else {
                    plain
                };
                self.to_item(file, path)
            })
            .collect()
    }

    fn to_item(&self, file: DriveFile, path: String) -> ItemMetadata {
        ItemMetadata {
            content_id: content_id(&self.source_name, SourceKind::Remote, &path),
            title: file.name,
            mime_type: Some(file.mime_type),
            size: file.size.and_then(|s| s.parse().ok()),
            modified_time: file.modified_time,
            locator: file.id,
            path,
        }
    }
}

fn plain_path(file: &DriveFile) -> String {
    let parent = file.parents.first().map(String::as_str).unwrap_or("root");
    format!("{}/{}", parent, file.name)
}

#[async_trait]
impl SourceConnector for RemoteConnector {
    async fn discover(&self, cursor: Option<&str>, page_size: usize) -> Result<DiscoveryPage> {
        let mut params = vec![
            ("q", self.query(Utc::now())),
            ("pageSize", page_size.clamp(1, 1000).to_string()),
            ("orderBy", self.order_by().to_string()),
            (
                "fields",
                "nextPageToken, files(id, name, mimeType, size, modifiedTime, parents)"
                    .to_string(),
            ),
        ];
        if let Some(token) = cursor {
            params.push(("pageToken", token.to_string()));
        }

        let list = self.drive.list(&params).await?;
        debug!(
            source = %self.source_name,
            count = list.files.len(),
            "Discovered remote page"
        );

        let files = list
            .files
            .into_iter()
            .filter(|f| retrieval_for(&f.mime_type).is_some())
            .collect();
        Ok(DiscoveryPage {
            items: self.to_items(files),
            next_cursor: list.next_page_token,
        })
    }

    async fn fetch(&self, item: &ItemMetadata) -> Result<RawContent> {
        let mime = item.mime_type.as_deref().unwrap_or_default();
        let retrieval = retrieval_for(mime)
            .ok_or_else(|| SyncError::Fetch(format!("unsupported type {}", mime)))?;

        let bytes = self.drive.download(&item.locator, retrieval).await?;
        let mime_type = match retrieval {
            Retrieval::Export(target) => Some(target.to_string()),
            Retrieval::Download => item.mime_type.clone(),
        };

        Ok(RawContent {
            content_id: item.content_id.clone(),
            source_name: self.source_name.clone(),
            source_kind: SourceKind::Remote,
            title: item.title.clone(),
            path: item.path.clone(),
            mime_type,
            modified_time: item.modified_time,
            bytes,
        })
    }

    fn page_size(&self) -> usize {
        self.drive.page_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_table() {
        assert_eq!(
            retrieval_for("application/vnd.google-apps.document"),
            Some(Retrieval::Export("text/plain"))
        );
        assert_eq!(retrieval_for("application/pdf"), Some(Retrieval::Download));
        assert_eq!(retrieval_for("image/png"), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_secs(2));
        assert_eq!(backoff(20), MAX_BACKOFF);
    }

    #[test]
    fn test_escape_query() {
        assert_eq!(escape_query("it's"), "it\\'s");
    }
}
