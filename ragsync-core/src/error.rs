//! Error types for Ragsync

use thiserror::Error;

/// Result type for Ragsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur in Ragsync
///
/// Errors are caught at the narrowest scope that still lets the run make
/// progress: a `Fetch` error costs one item, a `Discovery` or
/// `ReauthorizationRequired` error costs one source's turn, and nothing
/// below the scheduler terminates the process.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    /// Client registration artifact is absent; fatal to authorization only.
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Credential is unusable and cannot be refreshed.
    #[error("Reauthorization required: {0}")]
    ReauthorizationRequired(String),

    /// Provider rejected an authorization step. Message is the provider's own.
    #[error("{0}")]
    Auth(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Ingestion error: {0}")]
    Ingestion(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Other(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Http(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidConfig(err.to_string())
    }
}
