//! HTTP client for the daemon's control API

use anyhow::{anyhow, Context, Result};
use ragsync_core::{
    ConfigUpdate, Configuration, CredentialStatus, DaemonStatus, FireOutcome, NewSource,
    RemoteFolder, RunRecord, Source, SourceId, SourceUpdate,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:7878";

/// What `POST /api/trigger` answered
#[derive(Debug)]
pub enum TriggerResponse {
    /// Run started in the background
    Started,
    /// Run finished (`--wait`)
    Finished(FireOutcome),
    AlreadyRunning,
}

#[derive(Debug, Deserialize)]
pub struct LogTail {
    pub file: Option<String>,
    pub lines: Vec<String>,
}

pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
}

impl DaemonClient {
    pub fn new(base: &str) -> Result<Self> {
        reqwest::Url::parse(base).with_context(|| format!("invalid daemon URL '{}'", base))?;
        // Generous: a waited trigger lasts as long as the run budget
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60 * 60))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(method, path, body).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<reqwest::Response>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base, path);
        debug!("{} {}", method, url);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.with_context(|| {
            format!("cannot reach ragsyncd at {} (is the daemon running?)", self.base)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(api_error(status, response).await)
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        self.request::<(), _>(Method::GET, "/api/status", None).await
    }

    pub async fn configuration(&self) -> Result<Configuration> {
        self.request::<(), _>(Method::GET, "/api/config", None).await
    }

    pub async fn update_configuration(&self, update: &ConfigUpdate) -> Result<Configuration> {
        self.request(Method::POST, "/api/config", Some(update)).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.request::<(), _>(Method::GET, &format!("/api/history?limit={}", limit), None)
            .await
    }

    pub async fn logs(&self, lines: usize) -> Result<LogTail> {
        self.request::<(), _>(Method::GET, &format!("/api/logs?lines={}", lines), None)
            .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send::<()>(Method::POST, "/api/pause", None).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.send::<()>(Method::POST, "/api/resume", None).await?;
        Ok(())
    }

    pub async fn trigger(&self, wait: bool) -> Result<TriggerResponse> {
        let path = if wait {
            "/api/trigger?wait=true"
        } else {
            "/api/trigger"
        };
        match self.send::<()>(Method::POST, path, None).await {
            Ok(response) if wait => Ok(TriggerResponse::Finished(response.json().await?)),
            Ok(_) => Ok(TriggerResponse::Started),
            Err(e) if is_conflict(&e) => Ok(TriggerResponse::AlreadyRunning),
            Err(e) => Err(e),
        }
    }

    // === Sources ===

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.request::<(), _>(Method::GET, "/api/sources", None).await
    }

    pub async fn create_source(&self, source: &NewSource) -> Result<Source> {
        self.request(Method::POST, "/api/sources", Some(source)).await
    }

    pub async fn update_source(&self, id: SourceId, update: &SourceUpdate) -> Result<Source> {
        self.request(Method::PUT, &format!("/api/sources/{}", id), Some(update))
            .await
    }

    pub async fn get_source(&self, id: SourceId) -> Result<Source> {
        self.request::<(), _>(Method::GET, &format!("/api/sources/{}", id), None)
            .await
    }

    pub async fn delete_source(&self, id: SourceId) -> Result<()> {
        self.send::<()>(Method::DELETE, &format!("/api/sources/{}", id), None)
            .await?;
        Ok(())
    }

    // === Credentials ===

    pub async fn auth_status(&self) -> Result<CredentialStatus> {
        self.request::<(), _>(Method::GET, "/api/auth/status", None).await
    }

    pub async fn authorization_url(&self) -> Result<String> {
        let body: serde_json::Value = self
            .request::<(), _>(Method::GET, "/api/auth/url", None)
            .await?;
        body["url"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow!("daemon returned no authorization URL"))
    }

    /// Exchange an authorization code; returns the account identity
    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let body: serde_json::Value = self
            .request(
                Method::POST,
                "/api/auth/code",
                Some(&serde_json::json!({ "code": code })),
            )
            .await?;
        Ok(body["identity"].as_str().unwrap_or("unknown account").to_string())
    }

    pub async fn revoke(&self) -> Result<()> {
        self.send::<()>(Method::DELETE, "/api/auth", None).await?;
        Ok(())
    }

    pub async fn folders(&self, parent: Option<&str>) -> Result<Vec<RemoteFolder>> {
        let path = match parent {
            Some(parent) => format!("/api/folders?parent={}", parent),
            None => "/api/folders".to_string(),
        };
        self.request::<(), _>(Method::GET, &path, None).await
    }
}

/// Daemon-side failure, carrying the HTTP status
#[derive(Debug, thiserror::Error)]
#[error("{message} ({status})")]
pub struct ApiFailure {
    pub status: StatusCode,
    pub message: String,
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> anyhow::Error {
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or(text);
    anyhow::Error::new(ApiFailure { status, message })
}

fn is_conflict(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiFailure>()
        .map_or(false, |f| f.status == StatusCode::CONFLICT)
}
