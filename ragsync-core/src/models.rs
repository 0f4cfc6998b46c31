//! Core data models for Ragsync
//!
//! A `Source` is one named ingestion target. Every scheduler run produces a
//! `RunRecord` with a per-source breakdown. Runtime knobs live in
//! `Configuration`, which is read fresh from storage on every fire.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// === Defaults and limits ===

/// Default minutes between scheduled fires
pub const DEFAULT_INTERVAL_MINUTES: u64 = 60;

/// Default wall-clock budget for a whole run, in seconds
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 600;

/// Default remote lookback window (24 months)
pub const DEFAULT_LOOKBACK_DAYS: u32 = 730;

/// Longest accepted lookback window (a century)
pub const MAX_LOOKBACK_DAYS: u32 = 36_500;

/// Longest accepted interval between scheduled runs (a week)
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Longest accepted run budget (a day)
pub const MAX_RUN_BUDGET_SECS: u64 = 24 * 60 * 60;

/// Run history retention cap, enforced on every write
pub const RUN_HISTORY_CAP: usize = 500;

/// Maximum characters of an error kept in an alert message
pub const ALERT_ERROR_CHARS: usize = 100;

/// Maximum characters of the run-level error summary
pub const RUN_ERROR_CHARS: usize = 200;

/// Unique identifier for a configured source
pub type SourceId = i64;

// === Sources ===

/// Discriminant of a source, as stored in the `kind` column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Remote,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Remote => "remote",
            SourceKind::Local => "local",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "remote" | "gdrive" => Ok(SourceKind::Remote),
            "local" => Ok(SourceKind::Local),
            other => Err(SyncError::InvalidSource(format!("unknown source kind: {}", other))),
        }
    }
}

/// How a remote source orders its discovery listing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Most recently touched first, bounded by the lookback window
    #[default]
    RecentlyTouched,
    /// Stable total order over everything in scope
    FullListing,
}

impl DiscoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMode::RecentlyTouched => "recently-touched",
            DiscoveryMode::FullListing => "full-listing",
        }
    }
}

impl FromStr for DiscoveryMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "recently-touched" | "accessed" | "recent" => Ok(DiscoveryMode::RecentlyTouched),
            "full-listing" | "all" | "full" => Ok(DiscoveryMode::FullListing),
            other => Err(SyncError::InvalidSource(format!(
                "unknown discovery mode: {}",
                other
            ))),
        }
    }
}

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

fn default_true() -> bool {
    true
}

/// Settings meaningful only to remote sources
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSourceConfig {
    /// Folder to scope discovery to; `None` means the entire remote root
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

impl Default for RemoteSourceConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            discovery_mode: DiscoveryMode::RecentlyTouched,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl RemoteSourceConfig {
    pub fn lookback_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.lookback_days as i64)
    }
}

/// Settings meaningful only to local sources
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

/// Kind-specific settings of a source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Remote(RemoteSourceConfig),
    Local(LocalSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceConfig::Remote(_) => SourceKind::Remote,
            SourceConfig::Local(_) => SourceKind::Local,
        }
    }

    /// Check the fields relevant to this kind. Fields of the other kind are
    /// never looked at.
    pub fn validate(&self) -> Result<()> {
        match self {
            SourceConfig::Remote(remote) => {
                if remote.lookback_days == 0 {
                    return Err(SyncError::InvalidSource(
                        "lookback_days must be greater than zero".into(),
                    ));
                }
                if remote.lookback_days > MAX_LOOKBACK_DAYS {
                    return Err(SyncError::InvalidSource(format!(
                        "lookback_days must be at most {}",
                        MAX_LOOKBACK_DAYS
                    )));
                }
                if let Some(folder) = &remote.folder_id {
                    if folder.trim().is_empty() {
                        return Err(SyncError::InvalidSource(
                            "folder_id must not be blank; omit it for the whole root".into(),
                        ));
                    }
                }
                Ok(())
            }
            SourceConfig::Local(local) => {
                if local.path.as_os_str().is_empty() {
                    return Err(SyncError::InvalidSource(
                        "local sources need a filesystem path".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// A named, typed ingestion target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub config: SourceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        self.config.kind()
    }

    /// Build a typed source from a stored row.
    ///
    /// The row carries the columns of every kind; only the ones relevant to
    /// `row.kind` are read.
    pub fn from_row(row: SourceRow) -> Result<Self> {
        let name = validate_name(&row.name)?;
        let kind: SourceKind = row.kind.parse()?;

        let config = match kind {
            SourceKind::Remote => SourceConfig::Remote(RemoteSourceConfig {
                folder_id: row.remote_folder_id.filter(|f| !f.trim().is_empty()),
                discovery_mode: match row.discovery_mode.as_deref() {
                    Some(mode) => mode.parse()?,
                    None => DiscoveryMode::default(),
                },
                lookback_days: match row.lookback_days.filter(|d| *d > 0) {
                    Some(days) => u32::try_from(days)
                        .ok()
                        .filter(|d| *d <= MAX_LOOKBACK_DAYS)
                        .ok_or_else(|| {
                            SyncError::InvalidSource(format!(
                                "source '{}' has out-of-range lookback_days {}",
                                name, days
                            ))
                        })?,
                    None => DEFAULT_LOOKBACK_DAYS,
                },
            }),
            SourceKind::Local => {
                let path = row
                    .local_path
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        SyncError::InvalidSource(format!(
                            "local source '{}' has no filesystem path",
                            name
                        ))
                    })?;
                SourceConfig::Local(LocalSourceConfig {
                    path: PathBuf::from(path),
                    recursive: row.recursive.unwrap_or(true),
                })
            }
        };

        Ok(Source {
            id: row.id,
            name,
            enabled: row.enabled,
            config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Raw storage row for a source, before kind-specific validation
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: SourceId,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub remote_folder_id: Option<String>,
    pub discovery_mode: Option<String>,
    pub lookback_days: Option<i64>,
    pub local_path: Option<String>,
    pub recursive: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: SourceConfig,
}

impl NewSource {
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config: SourceConfig::Local(LocalSourceConfig {
                path: path.into(),
                recursive,
            }),
        }
    }

    pub fn remote(name: impl Into<String>, remote: RemoteSourceConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config: SourceConfig::Remote(remote),
        }
    }
}

/// Partial update of a source; `None` leaves the field untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub config: Option<SourceConfig>,
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidSource("source name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

// === Discovered items and content ===

/// Cheap, metadata-only description of a discovered item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemMetadata {
    /// Deterministic id derived from source name, kind and path
    pub content_id: String,
    /// Path of the item within its source scope
    pub path: String,
    pub title: String,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub modified_time: Option<DateTime<Utc>>,
    /// Provider handle used to fetch the content (remote file id, absolute
    /// local path). Never used for identity.
    pub locator: String,
}

/// Retrieved document content, handed to the ingestion pipeline
#[derive(Clone)]
pub struct RawContent {
    pub content_id: String,
    pub source_name: String,
    pub source_kind: SourceKind,
    pub title: String,
    pub path: String,
    pub mime_type: Option<String>,
    pub modified_time: Option<DateTime<Utc>>,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for RawContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawContent")
            .field("content_id", &self.content_id)
            .field("source_name", &self.source_name)
            .field("title", &self.title)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Counts reported by the ingestion pipeline for one batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestStats {
    pub processed: u64,
    pub skipped: u64,
    pub chunks: u64,
}

// === Runs ===

/// Aggregate outcome of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Partial,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failure => "failure",
        }
    }

    /// Classify a per-source breakdown.
    ///
    /// `Failure` only when every visited source errored before processing
    /// anything; `Partial` when at least one source errored; otherwise
    /// `Success`. An empty breakdown is a success.
    pub fn classify(breakdown: &IndexMap<String, SourceRunStats>) -> Self {
        let errored = breakdown.values().filter(|s| s.error.is_some()).count();
        if errored == 0 {
            return RunOutcome::Success;
        }
        let all_failed_empty = breakdown
            .values()
            .all(|s| s.error.is_some() && s.processed == 0);
        if all_failed_empty {
            RunOutcome::Failure
        } else {
            RunOutcome::Partial
        }
    }

    pub fn needs_alert(&self) -> bool {
        !matches!(self, RunOutcome::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "partial" => Ok(RunOutcome::Partial),
            "failure" => Ok(RunOutcome::Failure),
            other => Err(SyncError::Other(format!("unknown run outcome: {}", other))),
        }
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    #[default]
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTrigger {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            other => Err(SyncError::Other(format!("unknown run trigger: {}", other))),
        }
    }
}

/// Per-source slice of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SourceRunStats {
    pub processed: u64,
    pub skipped: u64,
    /// Items whose fetch failed; counted and skipped
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub chunks: u64,
    #[serde(default)]
    pub error: Option<String>,
    /// Discovery stopped because a whole page was already stored
    #[serde(default)]
    pub caught_up: bool,
    /// The source's turn ended on its time budget
    #[serde(default)]
    pub budget_exhausted: bool,
    #[serde(default)]
    pub elapsed_secs: f64,
}

/// One execution of the runner, as persisted in the run history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Row id, assigned on insert
    #[serde(default)]
    pub id: Option<i64>,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub trigger: RunTrigger,
    pub outcome: RunOutcome,
    pub duration_secs: f64,
    pub total_items_processed: u64,
    pub total_items_skipped: u64,
    #[serde(default)]
    pub total_chunks: u64,
    /// Truncated summary naming the first failing source
    pub error: Option<String>,
    pub first_failure: Option<String>,
    pub per_source: IndexMap<String, SourceRunStats>,
}

impl RunRecord {
    /// Aggregate a breakdown (in visiting order) into a record.
    pub fn from_breakdown(
        run_id: Uuid,
        timestamp: DateTime<Utc>,
        trigger: RunTrigger,
        duration: Duration,
        per_source: IndexMap<String, SourceRunStats>,
    ) -> Self {
        let outcome = RunOutcome::classify(&per_source);
        let first = per_source
            .iter()
            .find_map(|(name, stats)| stats.error.as_ref().map(|e| (name.clone(), e.clone())));

        let (first_failure, error) = match first {
            Some((name, err)) => {
                let summary = format!("{}: {}", name, truncate_chars(&err, RUN_ERROR_CHARS));
                (Some(name), Some(summary))
            }
            None => (None, None),
        };

        Self {
            id: None,
            run_id,
            timestamp,
            trigger,
            outcome,
            duration_secs: duration.as_secs_f64(),
            total_items_processed: per_source.values().map(|s| s.processed).sum(),
            total_items_skipped: per_source.values().map(|s| s.skipped).sum(),
            total_chunks: per_source.values().map(|s| s.chunks).sum(),
            error,
            first_failure,
            per_source,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }
}

/// Truncate to at most `max` characters, marking the cut with "..."
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}...", cut)
}

// === Runtime configuration ===

/// Config table keys
pub mod config_keys {
    pub const INTERVAL: &str = "interval";
    pub const RUN_MODE: &str = "run_mode";
    pub const SCHEDULER_STATE: &str = "scheduler_state";
    pub const RUN_BUDGET: &str = "run_budget";
}

/// Environment condition a run requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunMode {
    AlwaysIfAwake,
    OnlyIfPowered,
    /// Persisted value this build does not know; the gate fails open on it
    Unrecognized(String),
}

impl RunMode {
    pub fn as_str(&self) -> &str {
        match self {
            RunMode::AlwaysIfAwake => "always-if-awake",
            RunMode::OnlyIfPowered => "only-if-powered",
            RunMode::Unrecognized(raw) => raw,
        }
    }

    /// Lenient parse used when reading storage; never fails.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "always-if-awake" | "awake-only" => RunMode::AlwaysIfAwake,
            "only-if-powered" | "plugged-in-only" => RunMode::OnlyIfPowered,
            _ => RunMode::Unrecognized(s.to_string()),
        }
    }
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::AlwaysIfAwake
    }
}

impl FromStr for RunMode {
    type Err = SyncError;

    /// Strict parse used by the control interface
    fn from_str(s: &str) -> Result<Self> {
        match RunMode::parse_lenient(s) {
            RunMode::Unrecognized(raw) => Err(SyncError::InvalidConfig(format!(
                "run_mode must be 'always-if-awake' or 'only-if-powered', got '{}'",
                raw
            ))),
            mode => Ok(mode),
        }
    }
}

impl From<String> for RunMode {
    fn from(s: String) -> Self {
        RunMode::parse_lenient(&s)
    }
}

impl From<RunMode> for String {
    fn from(mode: RunMode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether scheduled fires are allowed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    #[default]
    Running,
    Paused,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Running => "running",
            SchedulerState::Paused => "paused",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulerState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "running" => Ok(SchedulerState::Running),
            "paused" => Ok(SchedulerState::Paused),
            other => Err(SyncError::InvalidConfig(format!(
                "unknown scheduler state: {}",
                other
            ))),
        }
    }
}

/// Typed view of the config table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub interval_minutes: u64,
    pub run_mode: RunMode,
    pub scheduler_state: SchedulerState,
    pub run_budget_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            run_mode: RunMode::AlwaysIfAwake,
            scheduler_state: SchedulerState::Running,
            run_budget_secs: DEFAULT_RUN_BUDGET_SECS,
        }
    }
}

impl Configuration {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.clamp(1, MAX_INTERVAL_MINUTES) * 60)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs.min(MAX_RUN_BUDGET_SECS))
    }
}

/// Partial configuration change from the control interface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default)]
    pub run_mode: Option<String>,
    #[serde(default)]
    pub run_budget_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &str) -> SourceRow {
        let now = Utc::now();
        SourceRow {
            id: 1,
            name: "docs".into(),
            kind: kind.into(),
            enabled: true,
            remote_folder_id: None,
            discovery_mode: None,
            lookback_days: None,
            local_path: None,
            recursive: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_out_of_range_lookback_is_rejected() {
        let mut r = row("remote");
        r.lookback_days = Some(u32::MAX as i64 + 7);
        assert!(matches!(Source::from_row(r), Err(SyncError::InvalidSource(_))));

        let mut r = row("remote");
        r.lookback_days = Some(MAX_LOOKBACK_DAYS as i64 + 1);
        assert!(matches!(Source::from_row(r), Err(SyncError::InvalidSource(_))));

        let mut r = row("remote");
        r.lookback_days = Some(30);
        match Source::from_row(r).unwrap().config {
            SourceConfig::Remote(remote) => assert_eq!(remote.lookback_days, 30),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_durations_are_clamped() {
        let config = Configuration {
            interval_minutes: u64::MAX,
            run_budget_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(config.interval(), Duration::from_secs(MAX_INTERVAL_MINUTES * 60));
        assert_eq!(config.run_budget(), Duration::from_secs(MAX_RUN_BUDGET_SECS));
    }

    #[test]
    fn test_remote_row_ignores_local_columns() {
        let mut r = row("remote");
        r.local_path = Some("/should/not/matter".into());
        r.recursive = Some(false);
        let source = Source::from_row(r).unwrap();
        match source.config {
            SourceConfig::Remote(remote) => {
                assert_eq!(remote.folder_id, None);
                assert_eq!(remote.discovery_mode, DiscoveryMode::RecentlyTouched);
                assert_eq!(remote.lookback_days, DEFAULT_LOOKBACK_DAYS);
            }
            _ => panic!("expected remote config"),
        }
    }

    #[test]
    fn test_local_row_requires_path() {
        let err = Source::from_row(row("local")).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSource(_)));

        let mut r = row("local");
        r.local_path = Some("/home/me/notes".into());
        r.discovery_mode = Some("garbage-that-is-ignored".into());
        let source = Source::from_row(r).unwrap();
        assert_eq!(source.kind(), SourceKind::Local);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Source::from_row(row("ftp")).is_err());
    }

    #[test]
    fn test_new_source_json_shape() {
        let json = r#"{"name":"notes","kind":"local","path":"/tmp/notes"}"#;
        let parsed: NewSource = serde_json::from_str(json).unwrap();
        assert!(parsed.enabled);
        assert_eq!(
            parsed.config,
            SourceConfig::Local(LocalSourceConfig {
                path: PathBuf::from("/tmp/notes"),
                recursive: true,
            })
        );

        let json = r#"{"name":"drive","kind":"remote","discovery_mode":"full-listing"}"#;
        let parsed: NewSource = serde_json::from_str(json).unwrap();
        match parsed.config {
            SourceConfig::Remote(remote) => {
                assert_eq!(remote.discovery_mode, DiscoveryMode::FullListing);
                assert_eq!(remote.lookback_days, 730);
            }
            _ => panic!("expected remote"),
        }
    }

    fn stats(processed: u64, error: Option<&str>) -> SourceRunStats {
        SourceRunStats {
            processed,
            error: error.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_outcome_classification() {
        let mut map = IndexMap::new();
        assert_eq!(RunOutcome::classify(&map), RunOutcome::Success);

        map.insert("a".to_string(), stats(3, None));
        assert_eq!(RunOutcome::classify(&map), RunOutcome::Success);

        map.insert("b".to_string(), stats(0, Some("listing failed")));
        assert_eq!(RunOutcome::classify(&map), RunOutcome::Partial);

        let mut all_failed = IndexMap::new();
        all_failed.insert("a".to_string(), stats(0, Some("x")));
        all_failed.insert("b".to_string(), stats(0, Some("y")));
        assert_eq!(RunOutcome::classify(&all_failed), RunOutcome::Failure);

        // Errored after making progress is not a total failure
        let mut late = IndexMap::new();
        late.insert("a".to_string(), stats(2, Some("token expired")));
        assert_eq!(RunOutcome::classify(&late), RunOutcome::Partial);
    }

    #[test]
    fn test_record_names_first_failure() {
        let mut map = IndexMap::new();
        map.insert("drive".to_string(), stats(1, None));
        map.insert("work".to_string(), stats(0, Some(&"e".repeat(500))));
        map.insert("notes".to_string(), stats(0, Some("later")));

        let record = RunRecord::from_breakdown(
            Uuid::new_v4(),
            Utc::now(),
            RunTrigger::Manual,
            Duration::from_secs(3),
            map,
        );
        assert_eq!(record.outcome, RunOutcome::Partial);
        assert_eq!(record.first_failure.as_deref(), Some("work"));
        let summary = record.error.unwrap();
        assert!(summary.starts_with("work: eee"));
        assert!(summary.chars().count() <= "work: ".len() + RUN_ERROR_CHARS + 3);
        assert_eq!(record.total_items_processed, 1);
    }

    #[test]
    fn test_run_mode_aliases() {
        assert_eq!(RunMode::parse_lenient("awake-only"), RunMode::AlwaysIfAwake);
        assert_eq!(RunMode::parse_lenient("plugged-in-only"), RunMode::OnlyIfPowered);
        assert!(matches!(RunMode::parse_lenient("moonlight"), RunMode::Unrecognized(_)));
        assert!("moonlight".parse::<RunMode>().is_err());
        assert_eq!("only-if-powered".parse::<RunMode>().unwrap(), RunMode::OnlyIfPowered);
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo...");
    }
}
