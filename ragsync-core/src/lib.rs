//! # Ragsync Core
//!
//! Time-budgeted background sync of documents into a personal RAG index.
//!
//! Ragsync periodically pulls documents from named sources (remote file
//! store folders, local directories) and hands new ones to a downstream
//! ingestion service, without exceeding a wall-clock budget per run and
//! without reprocessing content that is already indexed.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           RagSync                             │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Scheduler ──► ConditionGate                                  │
//! │      │                                                        │
//! │      ▼                                                        │
//! │  MultiSourceRunner ──► SourceConnector (remote │ local)       │
//! │      │        │                 │                             │
//! │      │        ▼                 ▼                             │
//! │      │   DedupOracle     CredentialManager                    │
//! │      ▼                                                        │
//! │  IngestionPipeline                                            │
//! │                                                               │
//! │  StateStore: sources • configuration • run history (SQLite)   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ragsync_core::{RagSync, SyncConfig, NewSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sync = RagSync::with_config(SyncConfig::from_env()?).await?;
//!     sync.create_source(NewSource::local("notes", "/home/me/notes", true)).await?;
//!     sync.start();
//!     Ok(())
//! }
//! ```

pub mod condition;
pub mod config;
pub mod connectors;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod models;
pub mod notify;
pub mod runner;
pub mod scheduler;
pub mod storage;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use models::*;

pub use condition::{ConditionGate, GateDecision, PowerProbe};
pub use connectors::{ConnectorFactory, DiscoveryPage, RemoteFolder, SourceConnector};
pub use credentials::{CredentialManager, CredentialStatus, TokenProvider};
pub use dedup::{DedupOracle, HttpPipeline, IngestionPipeline, MemoryLedger};
pub use notify::{Alert, Notifier};
pub use runner::MultiSourceRunner;
pub use scheduler::{FireOutcome, Scheduler, SchedulerStats};
pub use storage::StateStore;

use connectors::{DefaultConnectorFactory, DriveClient};
use credentials::OAuthProvider;
use notify::DesktopNotifier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Main Ragsync instance: the context object shared by the daemon's parts
pub struct RagSync {
    store: Arc<StateStore>,
    credentials: Arc<CredentialManager>,
    drive: Arc<DriveClient>,
    scheduler: Scheduler,
    config: SyncConfig,
}

/// Everything the control interface reports in one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub scheduler: SchedulerStats,
    pub last_run: Option<RunRecord>,
    pub credential: CredentialStatus,
    pub sources: usize,
    pub enabled_sources: usize,
}

/// Builder for [`RagSync`]; every collaborator has a production default
pub struct RagSyncBuilder {
    config: SyncConfig,
    in_memory_state: bool,
    oracle: Option<Arc<dyn DedupOracle>>,
    pipeline: Option<Arc<dyn IngestionPipeline>>,
    gate: Option<ConditionGate>,
    notifier: Option<Arc<dyn Notifier>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    factory: Option<Arc<dyn ConnectorFactory>>,
}

impl RagSyncBuilder {
    /// Keep state in memory instead of the database file
    pub fn in_memory_state(mut self) -> Self {
        self.in_memory_state = true;
        self
    }

    /// Use one object as both dedup oracle and ingestion pipeline
    pub fn ledger<T>(mut self, ledger: Arc<T>) -> Self
    where
        T: DedupOracle + IngestionPipeline + 'static,
    {
        self.oracle = Some(ledger.clone());
        self.pipeline = Some(ledger);
        self
    }

    pub fn gate(mut self, gate: ConditionGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub async fn build(self) -> Result<RagSync> {
        let config = self.config;
        config.validate()?;

        let store = if self.in_memory_state {
            StateStore::open_in_memory()?
        } else {
            std::fs::create_dir_all(&config.data_dir)?;
            StateStore::open(&config.db_path()).await?
        };
        let store = Arc::new(store);

        let provider: Arc<dyn TokenProvider> = match self.token_provider {
            Some(provider) => provider,
            None => Arc::new(OAuthProvider::new(&config)?),
        };
        let credentials = Arc::new(CredentialManager::new(provider, &config.token_path));
        let drive = Arc::new(DriveClient::new(&config, credentials.clone())?);

        let factory: Arc<dyn ConnectorFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultConnectorFactory::new(
                drive.clone(),
                config.local_page_size,
            )),
        };

        let (oracle, pipeline) = match (self.oracle, self.pipeline) {
            (Some(oracle), Some(pipeline)) => (oracle, pipeline),
            _ => {
                let http = Arc::new(HttpPipeline::new(&config.ingest_url, config.http_timeout)?);
                (
                    http.clone() as Arc<dyn DedupOracle>,
                    http as Arc<dyn IngestionPipeline>,
                )
            }
        };

        let runner = Arc::new(
            MultiSourceRunner::new(factory, oracle, pipeline)
                .with_sub_batch_size(config.sub_batch_size),
        );
        let gate = Arc::new(self.gate.unwrap_or_else(ConditionGate::system));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(DesktopNotifier) as Arc<dyn Notifier>);

        let scheduler = Scheduler::new(store.clone(), gate, runner, notifier);

        info!("Ragsync initialized at {}", config.data_dir.display());
        Ok(RagSync {
            store,
            credentials,
            drive,
            scheduler,
            config,
        })
    }
}

impl RagSync {
    /// Create a new instance with default configuration
    pub async fn new() -> Result<Self> {
        Self::with_config(SyncConfig::default()).await
    }

    /// Create a new instance with custom configuration
    pub async fn with_config(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: SyncConfig) -> RagSyncBuilder {
        RagSyncBuilder {
            config,
            in_memory_state: false,
            oracle: None,
            pipeline: None,
            gate: None,
            notifier: None,
            token_provider: None,
            factory: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // === Lifecycle ===

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    // === Sources ===

    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        self.store.list_sources().await
    }

    pub async fn get_source(&self, id: SourceId) -> Result<Source> {
        self.store.get_source(id).await
    }

    pub async fn create_source(&self, source: NewSource) -> Result<Source> {
        let created = self.store.create_source(source).await?;
        info!("Added {} source '{}'", created.kind(), created.name);
        Ok(created)
    }

    pub async fn update_source(&self, id: SourceId, update: SourceUpdate) -> Result<Source> {
        self.store.update_source(id, update).await
    }

    pub async fn set_source_enabled(&self, id: SourceId, enabled: bool) -> Result<Source> {
        self.store.set_source_enabled(id, enabled).await
    }

    pub async fn delete_source(&self, id: SourceId) -> Result<()> {
        self.store.delete_source(id).await?;
        info!("Removed source {}", id);
        Ok(())
    }

    // === Configuration ===

    pub async fn configuration(&self) -> Result<Configuration> {
        self.store.load_configuration().await
    }

    pub async fn update_configuration(&self, update: &ConfigUpdate) -> Result<Configuration> {
        let config = self.store.apply_config_update(update).await?;
        info!(
            "Configuration updated: every {} min, {} mode, {}s budget",
            config.interval_minutes, config.run_mode, config.run_budget_secs
        );
        Ok(config)
    }

    // === Runs ===

    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.store.history(limit).await
    }

    pub async fn last_run(&self) -> Result<Option<RunRecord>> {
        self.store.last_run().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.scheduler.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.scheduler.resume().await
    }

    pub async fn trigger_now(&self) -> Result<FireOutcome> {
        self.scheduler.trigger_now().await
    }

    pub async fn status(&self) -> Result<DaemonStatus> {
        let sources = self.store.list_sources().await?;
        Ok(DaemonStatus {
            scheduler: self.scheduler.stats().await?,
            last_run: self.store.last_run().await?,
            credential: self.credentials.status().await,
            enabled_sources: sources.iter().filter(|s| s.enabled).count(),
            sources: sources.len(),
        })
    }

    // === Credentials ===

    pub async fn credential_status(&self) -> CredentialStatus {
        self.credentials.status().await
    }

    pub fn authorization_url(&self) -> Result<String> {
        self.credentials.authorization_url()
    }

    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        self.credentials.exchange_code(code).await
    }

    pub async fn revoke_credential(&self) -> Result<()> {
        self.credentials.revoke().await
    }

    /// Remote folders under `parent` (`None` = root)
    pub async fn list_remote_folders(&self, parent: Option<&str>) -> Result<Vec<RemoteFolder>> {
        self.drive.list_folders(parent).await
    }
}
