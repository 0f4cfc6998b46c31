//! # Ragsync control API
//!
//! Local REST interface to a running Ragsync daemon.
//!
//! ## Endpoints
//!
//! - `GET /api/health` - Health check
//! - `GET /api/status` - Scheduler, last run, credential and source counts
//! - `GET /api/logs?lines=N` - Tail of today's daemon log
//! - `GET /api/config` - Runtime configuration
//! - `POST /api/config` - Change interval, run mode or run budget
//! - `GET /api/history?limit=N` - Run history, newest first
//! - `GET /api/sources` - List sources
//! - `POST /api/sources` - Add a source
//! - `GET /api/sources/:id` - Get one source
//! - `PUT /api/sources/:id` - Update a source
//! - `DELETE /api/sources/:id` - Remove a source
//! - `POST /api/pause` / `POST /api/resume` - Scheduler state
//! - `POST /api/trigger` - Start a run now (202, or 409 if one is in flight)
//! - `GET /api/auth/status` - Credential status
//! - `GET /api/auth/url` - Authorization URL for the consent screen
//! - `POST /api/auth/code` - Exchange an authorization code
//! - `DELETE /api/auth` - Forget the stored credential
//! - `GET /api/folders?parent=ID` - Remote folders, for picking a source scope

mod error;

pub use error::ApiError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use ragsync_core::{
    ConfigUpdate, Configuration, CredentialStatus, DaemonStatus, FireOutcome, NewSource,
    RagSync, RemoteFolder, RunRecord, Source, SourceId, SourceUpdate,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// File name prefix of the daemon's daily log files
pub const LOG_FILE_PREFIX: &str = "ragsyncd.log";

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<RagSync>,
    pub log_dir: PathBuf,
}

impl AppState {
    pub fn new(sync: Arc<RagSync>) -> Self {
        let log_dir = sync.config().log_dir();
        Self { sync, log_dir }
    }
}

/// Build the router with CORS and tracing middleware
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/logs", get(get_logs))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/history", get(get_history))
        // Sources
        .route("/api/sources", get(list_sources).post(add_source))
        .route(
            "/api/sources/:id",
            get(get_source).put(update_source).delete(remove_source),
        )
        // Scheduler control
        .route("/api/pause", post(pause))
        .route("/api/resume", post(resume))
        .route("/api/trigger", post(trigger))
        // Credentials
        .route("/api/auth", delete(revoke_credential))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/url", get(auth_url))
        .route("/api/auth/code", post(exchange_code))
        .route("/api/folders", get(list_folders))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /api/status
///
/// Scheduler state and counters, the most recent run, the credential
/// status and how many sources are configured.
async fn get_status(State(state): State<AppState>) -> Result<Json<DaemonStatus>, ApiError> {
    Ok(Json(state.sync.status().await?))
}

/// GET /api/logs
///
/// ## Query Parameters
/// - `lines` (optional): Number of trailing lines (default: 100)
async fn get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogParams>,
) -> Result<Json<LogTail>, ApiError> {
    let wanted = params.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let Some(file) = latest_log_file(&state.log_dir).await? else {
        return Ok(Json(LogTail {
            file: None,
            lines: Vec::new(),
        }));
    };

    let contents = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot read {}: {}", file.display(), e)))?;
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(wanted);

    Ok(Json(LogTail {
        file: Some(file.display().to_string()),
        lines: all[start..].iter().map(|l| l.to_string()).collect(),
    }))
}

/// GET /api/config
async fn get_config(State(state): State<AppState>) -> Result<Json<Configuration>, ApiError> {
    Ok(Json(state.sync.configuration().await?))
}

/// POST /api/config
///
/// ## Request Body
/// ```json
/// { "interval_minutes": 30, "run_mode": "only-if-powered", "run_budget_secs": 300 }
/// ```
/// All fields are optional. Nothing is written unless every field is valid.
async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<Configuration>, ApiError> {
    Ok(Json(state.sync.update_configuration(&update).await?))
}

/// GET /api/history
///
/// ## Query Parameters
/// - `limit` (optional): Maximum records to return (default: 50)
async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.sync.history(limit).await?))
}

/// GET /api/sources
async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<Source>>, ApiError> {
    Ok(Json(state.sync.list_sources().await?))
}

/// POST /api/sources
///
/// ## Request Body
/// ```json
/// { "name": "notes", "kind": "local", "path": "/home/me/notes", "recursive": true }
/// { "name": "drive", "kind": "remote", "folder_id": "0AbC", "discovery_mode": "full-listing" }
/// ```
async fn add_source(
    State(state): State<AppState>,
    Json(source): Json<NewSource>,
) -> Result<(StatusCode, Json<Source>), ApiError> {
    let created = state.sync.create_source(source).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/sources/:id
async fn get_source(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.sync.get_source(id).await?))
}

/// PUT /api/sources/:id
///
/// Partial update. A `config` object replaces the kind-specific settings
/// wholesale, so switching kind drops the old kind's fields.
async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
    Json(update): Json<SourceUpdate>,
) -> Result<Json<Source>, ApiError> {
    Ok(Json(state.sync.update_source(id, update).await?))
}

/// DELETE /api/sources/:id
async fn remove_source(
    State(state): State<AppState>,
    Path(id): Path<SourceId>,
) -> Result<StatusCode, ApiError> {
    state.sync.delete_source(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/pause
async fn pause(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.sync.pause().await?;
    Ok(Json(serde_json::json!({ "state": "paused" })))
}

/// POST /api/resume
async fn resume(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.sync.resume().await?;
    Ok(Json(serde_json::json!({ "state": "running" })))
}

/// POST /api/trigger
///
/// Starts a manual run. The paused state is ignored; the run mode is not.
///
/// ## Query Parameters
/// - `wait` (optional): When true, respond with the fire outcome once the
///   run is over instead of returning 202 straight away
async fn trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
) -> Result<axum::response::Response, ApiError> {
    if params.wait.unwrap_or(false) {
        return match state.sync.trigger_now().await? {
            FireOutcome::AlreadyRunning => Err(ApiError::Conflict(
                "a run is already in flight".to_string(),
            )),
            outcome => Ok(Json(outcome).into_response()),
        };
    }

    match state.sync.scheduler().spawn_trigger() {
        Some(handle) => {
            tokio::spawn(async move {
                match handle.await {
                    Ok(Ok(outcome)) => info!("Manual trigger finished: {}", outcome_label(&outcome)),
                    Ok(Err(e)) => warn!("Manual trigger failed: {}", e),
                    Err(e) => warn!("Manual trigger task aborted: {}", e),
                }
            });
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "result": "started" })),
            )
                .into_response())
        }
        None => Err(ApiError::Conflict("a run is already in flight".to_string())),
    }
}

/// GET /api/auth/status
async fn auth_status(State(state): State<AppState>) -> Json<CredentialStatus> {
    Json(state.sync.credential_status().await)
}

/// GET /api/auth/url
async fn auth_url(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let url = state.sync.authorization_url()?;
    Ok(Json(serde_json::json!({ "url": url })))
}

/// POST /api/auth/code
///
/// ## Request Body
/// ```json
/// { "code": "4/0Ab..." }
/// ```
async fn exchange_code(
    State(state): State<AppState>,
    Json(payload): Json<CodeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let code = payload.code.trim();
    if code.is_empty() {
        return Err(ApiError::BadRequest("code must not be empty".to_string()));
    }
    let identity = state.sync.exchange_code(code).await?;
    Ok(Json(serde_json::json!({ "identity": identity })))
}

/// DELETE /api/auth
async fn revoke_credential(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.sync.revoke_credential().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/folders
///
/// ## Query Parameters
/// - `parent` (optional): Folder id to list under (default: root)
async fn list_folders(
    State(state): State<AppState>,
    Query(params): Query<FolderParams>,
) -> Result<Json<Vec<RemoteFolder>>, ApiError> {
    Ok(Json(
        state
            .sync
            .list_remote_folders(params.parent.as_deref())
            .await?,
    ))
}

// ============================================================================
// Helpers
// ============================================================================

fn outcome_label(outcome: &FireOutcome) -> String {
    match outcome {
        FireOutcome::Completed { record } => format!("{} run {}", record.outcome, record.run_id),
        FireOutcome::Paused => "paused".to_string(),
        FireOutcome::ConditionNotMet { reason } => format!("skipped ({})", reason),
        FireOutcome::AlreadyRunning => "already running".to_string(),
    }
}

/// Most recent daily log file in `dir`, if any
async fn latest_log_file(dir: &std::path::Path) -> Result<Option<PathBuf>, ApiError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    // Rotated files end in the date, so the name sorts chronologically
    let mut latest: Option<PathBuf> = None;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
    {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let path = entry.path();
        if latest.as_ref().map_or(true, |l| path > *l) {
            latest = Some(path);
        }
    }
    Ok(latest)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogParams {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogTail {
    file: Option<String>,
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    wait: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CodeRequest {
    code: String,
}

#[derive(Debug, Deserialize)]
struct FolderParams {
    parent: Option<String>,
}
