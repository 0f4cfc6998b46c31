//! Process-level settings
//!
//! These are fixed for the life of the daemon. Runtime knobs that the control
//! interface may change (interval, run mode, budget) live in the state store
//! instead, see [`crate::models::Configuration`].

use crate::error::{Result, SyncError};
use std::path::PathBuf;
use std::time::Duration;

/// Default base URL of the remote file store API
pub const DEFAULT_DRIVE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Default base URL of the downstream ingestion service
pub const DEFAULT_INGEST_URL: &str = "http://127.0.0.1:8000";

/// Read-only access to the remote file store
pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

/// Configuration for Ragsync
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory for the state database, token and logs
    pub data_dir: PathBuf,

    /// OAuth client registration (`credentials.json`)
    pub client_secret_path: PathBuf,

    /// Persisted credential (`token.json`)
    pub token_path: PathBuf,

    /// Remote file store API base URL
    pub drive_api_url: String,

    /// Downstream ingestion service base URL
    pub ingest_url: String,

    /// Control API bind address
    pub host: String,
    pub port: u16,

    /// Items per remote discovery page
    pub remote_page_size: usize,

    /// Items per local discovery page (the walk itself happens once)
    pub local_page_size: usize,

    /// Items fetched and ingested between two deadline checks
    pub sub_batch_size: usize,

    /// Per-request timeout for outbound HTTP
    pub http_timeout: Duration,

    /// Largest single download accepted from the remote store
    pub max_download_bytes: u64,

    pub scopes: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("", "", "Ragsync")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".ragsync"));

        Self::with_data_dir(data_dir)
    }
}

impl SyncConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            client_secret_path: data_dir.join("credentials.json"),
            token_path: data_dir.join("token.json"),
            data_dir,
            drive_api_url: DEFAULT_DRIVE_URL.into(),
            ingest_url: DEFAULT_INGEST_URL.into(),
            host: "127.0.0.1".into(),
            port: 7878,
            remote_page_size: 200,
            local_page_size: 100,
            sub_batch_size: 10,
            http_timeout: Duration::from_secs(30),
            max_download_bytes: 50 * 1024 * 1024,
            scopes: vec![DRIVE_READONLY_SCOPE.to_string()],
        }
    }

    /// Defaults, then a `.env` file, then `RAGSYNC_*` variables
    pub fn from_env() -> Result<Self> {
        // A missing .env is the normal case
        let _ = dotenvy::dotenv();

        let mut config = match std::env::var("RAGSYNC_DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => Self::with_data_dir(dir),
            _ => Self::default(),
        };

        if let Ok(path) = std::env::var("RAGSYNC_CLIENT_SECRET") {
            config.client_secret_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("RAGSYNC_TOKEN_PATH") {
            config.token_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("RAGSYNC_INGEST_URL") {
            config.ingest_url = url;
        }
        if let Ok(url) = std::env::var("RAGSYNC_DRIVE_URL") {
            config.drive_api_url = url;
        }
        if let Ok(host) = std::env::var("RAGSYNC_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("RAGSYNC_PORT") {
            config.port = port
                .parse()
                .map_err(|_| SyncError::InvalidConfig(format!("RAGSYNC_PORT: {}", port)))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.drive_api_url)?;
        url::Url::parse(&self.ingest_url)?;
        if self.sub_batch_size == 0 || self.remote_page_size == 0 || self.local_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "page and sub-batch sizes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ragsync.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_data_dir() {
        let config = SyncConfig::with_data_dir("/var/lib/ragsync");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/ragsync/ragsync.db"));
        assert_eq!(config.token_path, PathBuf::from("/var/lib/ragsync/token.json"));
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/ragsync/logs"));
        assert_eq!(config.sub_batch_size, 10);
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut config = SyncConfig::with_data_dir("/tmp/x");
        config.ingest_url = "not a url".into();
        assert!(config.validate().is_err());
    }
}
