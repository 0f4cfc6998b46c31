//! State store: source registry, runtime configuration and run history
//!
//! Everything lives in one SQLite file owned by a single daemon. Access is
//! serialized through one connection mutex.

use crate::error::{Result, SyncError};
use crate::models::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

pub struct StateStore {
    db: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory store, for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Self::init_schema(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                remote_folder_id TEXT,
                discovery_mode TEXT,
                lookback_days INTEGER,
                local_path TEXT,
                recursive INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                trigger TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_secs REAL NOT NULL,
                total_processed INTEGER NOT NULL,
                total_skipped INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                first_failure TEXT,
                per_source_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_run_history_timestamp ON run_history(timestamp);
        "#,
        )?;

        // Defaults never overwrite an existing value
        let defaults = Configuration::default();
        let seeds = [
            (config_keys::INTERVAL, defaults.interval_minutes.to_string()),
            (config_keys::RUN_MODE, defaults.run_mode.to_string()),
            (
                config_keys::SCHEDULER_STATE,
                defaults.scheduler_state.as_str().to_string(),
            ),
            (config_keys::RUN_BUDGET, defaults.run_budget_secs.to_string()),
        ];
        for (key, value) in seeds {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SyncError::Database(rusqlite::Error::InvalidQuery))
    }

    // === Sources ===

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(&format!("{} ORDER BY id", SOURCE_SELECT))?;
        let rows = stmt
            .query_map([], read_source_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(db);

        // A row that no longer validates is reported and left out, so one
        // bad entry cannot take the whole registry down.
        let mut sources = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id;
            match raw.into_row().and_then(Source::from_row) {
                Ok(source) => sources.push(source),
                Err(e) => warn!("Ignoring invalid source row {}: {}", id, e),
            }
        }
        Ok(sources)
    }

    /// Enabled sources, in creation order
    pub async fn list_enabled_sources(&self) -> Result<Vec<Source>> {
        Ok(self
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    pub async fn get_source(&self, id: SourceId) -> Result<Source> {
        let raw = {
            let db = self.lock()?;
            db.query_row(
                &format!("{} WHERE id = ?1", SOURCE_SELECT),
                params![id],
                read_source_row,
            )
            .optional()?
        };
        match raw {
            Some(raw) => Source::from_row(raw.into_row()?),
            None => Err(SyncError::NotFound(format!("source {}", id))),
        }
    }

    pub async fn create_source(&self, new: NewSource) -> Result<Source> {
        let name = validate_name(&new.name)?;
        new.config.validate()?;

        let now = Utc::now().to_rfc3339();
        let cols = SourceColumns::from(&new.config);
        let id = {
            let db = self.lock()?;
            db.execute(
                r#"INSERT INTO sources
                   (name, kind, enabled, remote_folder_id, discovery_mode, lookback_days,
                    local_path, recursive, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)"#,
                params![
                    name,
                    cols.kind,
                    new.enabled,
                    cols.remote_folder_id,
                    cols.discovery_mode,
                    cols.lookback_days,
                    cols.local_path,
                    cols.recursive,
                    now
                ],
            )
            .map_err(|e| unique_violation(e, &name))?;
            db.last_insert_rowid()
        };

        debug!("Created {} source '{}' ({})", cols.kind, name, id);
        self.get_source(id).await
    }

    pub async fn update_source(&self, id: SourceId, update: SourceUpdate) -> Result<Source> {
        let current = self.get_source(id).await?;

        let name = match update.name {
            Some(n) => validate_name(&n)?,
            None => current.name,
        };
        let enabled = update.enabled.unwrap_or(current.enabled);
        let config = update.config.unwrap_or(current.config);
        config.validate()?;

        let cols = SourceColumns::from(&config);
        {
            let db = self.lock()?;
            db.execute(
                r#"UPDATE sources SET
                   name = ?1, kind = ?2, enabled = ?3, remote_folder_id = ?4,
                   discovery_mode = ?5, lookback_days = ?6, local_path = ?7,
                   recursive = ?8, updated_at = ?9
                   WHERE id = ?10"#,
                params![
                    name,
                    cols.kind,
                    enabled,
                    cols.remote_folder_id,
                    cols.discovery_mode,
                    cols.lookback_days,
                    cols.local_path,
                    cols.recursive,
                    Utc::now().to_rfc3339(),
                    id
                ],
            )
            .map_err(|e| unique_violation(e, &name))?;
        }

        self.get_source(id).await
    }

    pub async fn set_source_enabled(&self, id: SourceId, enabled: bool) -> Result<Source> {
        self.update_source(
            id,
            SourceUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_source(&self, id: SourceId) -> Result<()> {
        let db = self.lock()?;
        let removed = db.execute("DELETE FROM sources WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(SyncError::NotFound(format!("source {}", id)));
        }
        Ok(())
    }

    // === Configuration ===

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let db = self.lock()?;
        let value = db
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Typed configuration, read fresh from the table.
    ///
    /// Unparseable numbers fall back to their defaults; an unknown run mode
    /// is kept as-is so the gate can report it.
    pub async fn load_configuration(&self) -> Result<Configuration> {
        let pairs: Vec<(String, String)> = {
            let db = self.lock()?;
            let mut stmt = db.prepare("SELECT key, value FROM config")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut config = Configuration::default();
        for (key, value) in pairs {
            match key.as_str() {
                config_keys::INTERVAL => match value.trim().parse::<u64>() {
                    Ok(m) if (1..=MAX_INTERVAL_MINUTES).contains(&m) => config.interval_minutes = m,
                    _ => warn!("Bad interval '{}' in config, using default", value),
                },
                config_keys::RUN_BUDGET => match value.trim().parse::<u64>() {
                    Ok(s) if (1..=MAX_RUN_BUDGET_SECS).contains(&s) => config.run_budget_secs = s,
                    _ => warn!("Bad run_budget '{}' in config, using default", value),
                },
                config_keys::RUN_MODE => config.run_mode = RunMode::parse_lenient(&value),
                config_keys::SCHEDULER_STATE => match SchedulerState::from_str(&value) {
                    Ok(state) => config.scheduler_state = state,
                    Err(_) => warn!("Bad scheduler_state '{}' in config", value),
                },
                _ => {}
            }
        }
        Ok(config)
    }

    pub async fn set_scheduler_state(&self, state: SchedulerState) -> Result<()> {
        self.set_config(config_keys::SCHEDULER_STATE, state.as_str())
            .await
    }

    /// Validate every field of `update`, then write them together.
    pub async fn apply_config_update(&self, update: &ConfigUpdate) -> Result<Configuration> {
        let mut writes: Vec<(&str, String)> = Vec::new();

        if let Some(minutes) = update.interval_minutes {
            if minutes == 0 {
                return Err(SyncError::InvalidConfig(
                    "interval must be at least one minute".into(),
                ));
            }
            if minutes > MAX_INTERVAL_MINUTES {
                return Err(SyncError::InvalidConfig(format!(
                    "interval must be at most {} minutes",
                    MAX_INTERVAL_MINUTES
                )));
            }
            writes.push((config_keys::INTERVAL, minutes.to_string()));
        }
        if let Some(mode) = &update.run_mode {
            let mode: RunMode = mode.parse()?;
            writes.push((config_keys::RUN_MODE, mode.to_string()));
        }
        if let Some(secs) = update.run_budget_secs {
            if secs == 0 {
                return Err(SyncError::InvalidConfig(
                    "run budget must be at least one second".into(),
                ));
            }
            if secs > MAX_RUN_BUDGET_SECS {
                return Err(SyncError::InvalidConfig(format!(
                    "run budget must be at most {} seconds",
                    MAX_RUN_BUDGET_SECS
                )));
            }
            writes.push((config_keys::RUN_BUDGET, secs.to_string()));
        }

        {
            let mut db = self.lock()?;
            let tx = db.transaction()?;
            for (key, value) in &writes {
                tx.execute(
                    "INSERT INTO config (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            tx.commit()?;
        }

        self.load_configuration().await
    }

    // === Run history ===

    /// Append a run and trim the log to [`RUN_HISTORY_CAP`]. Returns the row id.
    pub async fn record_run(&self, record: &RunRecord) -> Result<i64> {
        let per_source = serde_json::to_string(&record.per_source)?;
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            r#"INSERT INTO run_history
               (run_id, timestamp, trigger, outcome, duration_secs, total_processed,
                total_skipped, total_chunks, error, first_failure, per_source_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                record.run_id.to_string(),
                record.timestamp.to_rfc3339(),
                record.trigger.as_str(),
                record.outcome.as_str(),
                record.duration_secs,
                record.total_items_processed as i64,
                record.total_items_skipped as i64,
                record.total_chunks as i64,
                record.error,
                record.first_failure,
                per_source
            ],
        )?;
        let id = tx.last_insert_rowid();
        let trimmed = tx.execute(
            "DELETE FROM run_history WHERE id NOT IN
             (SELECT id FROM run_history ORDER BY id DESC LIMIT ?1)",
            params![RUN_HISTORY_CAP as i64],
        )?;
        tx.commit()?;

        if trimmed > 0 {
            debug!("Trimmed {} old run records", trimmed);
        }
        Ok(id)
    }

    /// Most recent runs first
    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let rows: Vec<RawRun> = {
            let db = self.lock()?;
            let mut stmt = db.prepare(
                r#"SELECT id, run_id, timestamp, trigger, outcome, duration_secs,
                          total_processed, total_skipped, total_chunks, error,
                          first_failure, per_source_json
                   FROM run_history ORDER BY id DESC LIMIT ?1"#,
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(RawRun {
                        id: row.get(0)?,
                        run_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        trigger: row.get(3)?,
                        outcome: row.get(4)?,
                        duration_secs: row.get(5)?,
                        total_processed: row.get(6)?,
                        total_skipped: row.get(7)?,
                        total_chunks: row.get(8)?,
                        error: row.get(9)?,
                        first_failure: row.get(10)?,
                        per_source_json: row.get(11)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        rows.into_iter().map(RawRun::into_record).collect()
    }

    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        Ok(self.history(1).await?.into_iter().next())
    }

    pub async fn run_count(&self) -> Result<usize> {
        let db = self.lock()?;
        let count: i64 = db.query_row("SELECT COUNT(*) FROM run_history", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

const SOURCE_SELECT: &str = r#"SELECT id, name, kind, enabled, remote_folder_id, discovery_mode,
       lookback_days, local_path, recursive, created_at, updated_at FROM sources"#;

/// Source row as read, timestamps still text
struct RawSourceRow {
    id: SourceId,
    name: String,
    kind: String,
    enabled: bool,
    remote_folder_id: Option<String>,
    discovery_mode: Option<String>,
    lookback_days: Option<i64>,
    local_path: Option<String>,
    recursive: Option<bool>,
    created_at: String,
    updated_at: String,
}

impl RawSourceRow {
    fn into_row(self) -> Result<SourceRow> {
        Ok(SourceRow {
            id: self.id,
            name: self.name,
            kind: self.kind,
            enabled: self.enabled,
            remote_folder_id: self.remote_folder_id,
            discovery_mode: self.discovery_mode,
            lookback_days: self.lookback_days,
            local_path: self.local_path,
            recursive: self.recursive,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn read_source_row(row: &rusqlite::Row) -> rusqlite::Result<RawSourceRow> {
    Ok(RawSourceRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        enabled: row.get(3)?,
        remote_folder_id: row.get(4)?,
        discovery_mode: row.get(5)?,
        lookback_days: row.get(6)?,
        local_path: row.get(7)?,
        recursive: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Kind-specific column values for a write; the other kind's columns are NULL
struct SourceColumns {
    kind: &'static str,
    remote_folder_id: Option<String>,
    discovery_mode: Option<&'static str>,
    lookback_days: Option<i64>,
    local_path: Option<String>,
    recursive: Option<bool>,
}

impl From<&SourceConfig> for SourceColumns {
    fn from(config: &SourceConfig) -> Self {
        match config {
            SourceConfig::Remote(remote) => Self {
                kind: SourceKind::Remote.as_str(),
                remote_folder_id: remote.folder_id.clone(),
                discovery_mode: Some(remote.discovery_mode.as_str()),
                lookback_days: Some(remote.lookback_days as i64),
                local_path: None,
                recursive: None,
            },
            SourceConfig::Local(local) => Self {
                kind: SourceKind::Local.as_str(),
                remote_folder_id: None,
                discovery_mode: None,
                lookback_days: None,
                local_path: Some(local.path.to_string_lossy().into_owned()),
                recursive: Some(local.recursive),
            },
        }
    }
}

struct RawRun {
    id: i64,
    run_id: String,
    timestamp: String,
    trigger: String,
    outcome: String,
    duration_secs: f64,
    total_processed: i64,
    total_skipped: i64,
    total_chunks: i64,
    error: Option<String>,
    first_failure: Option<String>,
    per_source_json: String,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            id: Some(self.id),
            run_id: uuid::Uuid::parse_str(&self.run_id)
                .map_err(|e| SyncError::Other(format!("bad run id {}: {}", self.run_id, e)))?,
            timestamp: parse_timestamp(&self.timestamp)?,
            trigger: self.trigger.parse()?,
            outcome: self.outcome.parse()?,
            duration_secs: self.duration_secs,
            total_items_processed: self.total_processed.max(0) as u64,
            total_items_skipped: self.total_skipped.max(0) as u64,
            total_chunks: self.total_chunks.max(0) as u64,
            error: self.error,
            first_failure: self.first_failure,
            per_source: serde_json::from_str(&self.per_source_json)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Other(format!("bad timestamp '{}': {}", s, e)))
}

fn unique_violation(err: rusqlite::Error, name: &str) -> SyncError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SyncError::InvalidSource(format!("a source named '{}' already exists", name))
        }
        _ => SyncError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn record(processed: u64) -> RunRecord {
        let mut per_source = IndexMap::new();
        per_source.insert(
            "notes".to_string(),
            SourceRunStats {
                processed,
                ..Default::default()
            },
        );
        RunRecord::from_breakdown(
            Uuid::new_v4(),
            Utc::now(),
            RunTrigger::Scheduled,
            Duration::from_millis(1500),
            per_source,
        )
    }

    #[tokio::test]
    async fn test_defaults_seeded() {
        let store = StateStore::open_in_memory().unwrap();
        let config = store.load_configuration().await.unwrap();
        assert_eq!(config.interval_minutes, 60);
        assert_eq!(config.run_mode, RunMode::AlwaysIfAwake);
        assert_eq!(config.scheduler_state, SchedulerState::Running);
        assert_eq!(
            store.get_config("run_mode").await.unwrap().as_deref(),
            Some("always-if-awake")
        );
    }

    #[tokio::test]
    async fn test_reopen_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = StateStore::open(&path).await.unwrap();
            store.set_config("interval", "15").await.unwrap();
        }
        let store = StateStore::open(&path).await.unwrap();
        assert_eq!(store.load_configuration().await.unwrap().interval_minutes, 15);
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_run(&record(3)).await.unwrap();
        store.record_run(&record(5)).await.unwrap();

        let history = store.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].total_items_processed, 5);
        assert_eq!(history[0].per_source["notes"].processed, 5);
        assert_eq!(store.last_run().await.unwrap().unwrap().total_items_processed, 5);
    }

    #[tokio::test]
    async fn test_config_update_is_all_or_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let bad = ConfigUpdate {
            interval_minutes: Some(10),
            run_mode: Some("whenever".into()),
            run_budget_secs: None,
        };
        assert!(store.apply_config_update(&bad).await.is_err());
        assert_eq!(store.load_configuration().await.unwrap().interval_minutes, 60);
    }
}
