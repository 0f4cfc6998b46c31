//! Multi-source runner
//!
//! One run visits the enabled sources in order (remote before local), giving
//! each an even slice of the run's time budget. Per source it pages through
//! discovery, drops items the dedup oracle already knows, and fetches and
//! ingests the rest in small sub-batches as they fill.
//!
//! There is no preemption. The budget is checked before every dedup lookup and
//! every sub-batch, so a source may overrun its slice by at most one lookup or
//! one sub-batch's fetch and ingest time.
//!
//! The runner keeps no cursors between runs. An interrupted source simply
//! rediscovers the head of its listing next time and skips what is stored.

use crate::connectors::{ConnectorFactory, SourceConnector};
use crate::dedup::{DedupOracle, IngestionPipeline};
use crate::error::SyncError;
use crate::models::{ItemMetadata, RunRecord, RunTrigger, Source, SourceKind, SourceRunStats};
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Items fetched and ingested between two budget checks
pub const DEFAULT_SUB_BATCH_SIZE: usize = 10;

pub struct MultiSourceRunner {
    factory: Arc<dyn ConnectorFactory>,
    oracle: Arc<dyn DedupOracle>,
    pipeline: Arc<dyn IngestionPipeline>,
    sub_batch_size: usize,
}

impl MultiSourceRunner {
    pub fn new(
        factory: Arc<dyn ConnectorFactory>,
        oracle: Arc<dyn DedupOracle>,
        pipeline: Arc<dyn IngestionPipeline>,
    ) -> Self {
        Self {
            factory,
            oracle,
            pipeline,
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
        }
    }

    pub fn with_sub_batch_size(mut self, size: usize) -> Self {
        self.sub_batch_size = size.max(1);
        self
    }

    /// Run a scheduled pass over `sources` within `total_budget`.
    pub async fn run(&self, sources: &[Source], total_budget: Duration) -> RunRecord {
        self.run_as(sources, total_budget, RunTrigger::Scheduled)
            .await
    }

    pub async fn run_as(
        &self,
        sources: &[Source],
        total_budget: Duration,
        trigger: RunTrigger,
    ) -> RunRecord {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, trigger = trigger.as_str());
        self.run_inner(run_id, sources, total_budget, trigger)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        sources: &[Source],
        total_budget: Duration,
        trigger: RunTrigger,
    ) -> RunRecord {
        let timestamp = Utc::now();
        let run_start = Instant::now();
        let run_deadline = deadline_after(run_start, total_budget);

        let ordered = visiting_order(sources);
        let per_source = per_source_budget(total_budget, ordered.len());
        info!(
            sources = ordered.len(),
            "Starting run with {:?} budget ({:?} per source)", total_budget, per_source
        );

        let mut breakdown = IndexMap::new();
        for (index, source) in ordered.iter().enumerate() {
            let source_start = Instant::now();
            if source_start >= run_deadline {
                info!(
                    "Run budget spent, deferring {} source(s) to the next run",
                    ordered.len() - index
                );
                break;
            }
            let deadline = deadline_after(source_start, per_source).min(run_deadline);

            let mut stats = self.run_source(source, deadline).await;
            stats.elapsed_secs = source_start.elapsed().as_secs_f64();
            breakdown.insert(source.name.clone(), stats);
        }

        let record = RunRecord::from_breakdown(
            run_id,
            timestamp,
            trigger,
            run_start.elapsed(),
            breakdown,
        );
        info!(
            outcome = %record.outcome,
            processed = record.total_items_processed,
            skipped = record.total_items_skipped,
            "Run finished in {:.2}s",
            record.duration_secs
        );
        record
    }

    #[instrument(skip_all, fields(source = %source.name, kind = %source.kind()))]
    async fn run_source(&self, source: &Source, deadline: Instant) -> SourceRunStats {
        let mut stats = SourceRunStats::default();

        let connector = match self.factory.connector(source) {
            Ok(connector) => connector,
            Err(e) => {
                warn!("Could not prepare connector: {}", e);
                stats.error = Some(e.to_string());
                return stats;
            }
        };
        let page_size = connector.page_size();
        let mut cursor: Option<String> = None;

        'pages: loop {
            if Instant::now() >= deadline {
                stats.budget_exhausted = true;
                break;
            }

            let page = match connector.discover(cursor.as_deref(), page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Discovery failed: {}", e);
                    stats.error = Some(e.to_string());
                    break;
                }
            };

            let discovered = page.items.len();
            let mut fresh = 0usize;
            let mut pending = Vec::with_capacity(self.sub_batch_size);
            for item in page.items {
                if Instant::now() >= deadline {
                    stats.budget_exhausted = true;
                    break 'pages;
                }
                if !self.is_new(&item, &mut stats).await {
                    continue;
                }
                fresh += 1;
                pending.push(item);
                if pending.len() == self.sub_batch_size
                    && !self.flush(connector.as_ref(), &mut pending, deadline, &mut stats).await
                {
                    break 'pages;
                }
            }
            if !pending.is_empty()
                && !self.flush(connector.as_ref(), &mut pending, deadline, &mut stats).await
            {
                break;
            }

            if fresh == 0 {
                // A full page of known items means everything older is known too
                stats.caught_up = discovered > 0;
                if stats.caught_up {
                    debug!("Caught up after {} known item(s)", discovered);
                }
                break;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            processed = stats.processed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Source turn done"
        );
        stats
    }

    /// Whether the oracle has yet to see `item`; known items count as skipped.
    /// A failed lookup lets the item through since ingestion is idempotent.
    async fn is_new(&self, item: &ItemMetadata, stats: &mut SourceRunStats) -> bool {
        match self.oracle.already_stored(&item.content_id).await {
            Ok(true) => {
                stats.skipped += 1;
                false
            }
            Ok(false) => true,
            Err(e) => {
                debug!("Dedup lookup failed for {}: {}", item.path, e);
                true
            }
        }
    }

    /// Fetch and ingest the pending sub-batch unless the deadline has passed.
    /// Returns false when the source's turn is over.
    async fn flush(
        &self,
        connector: &dyn SourceConnector,
        pending: &mut Vec<ItemMetadata>,
        deadline: Instant,
        stats: &mut SourceRunStats,
    ) -> bool {
        if Instant::now() >= deadline {
            stats.budget_exhausted = true;
            return false;
        }
        let result = self.fetch_and_ingest(connector, pending, stats).await;
        pending.clear();
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Source turn aborted: {}", e);
                stats.error = Some(e.to_string());
                false
            }
        }
    }

    /// Fetch one sub-batch and hand it to the pipeline.
    ///
    /// Item fetch failures are counted and skipped. An error is returned only
    /// when the rest of the source's turn cannot proceed.
    async fn fetch_and_ingest(
        &self,
        connector: &dyn SourceConnector,
        chunk: &[ItemMetadata],
        stats: &mut SourceRunStats,
    ) -> Result<(), SyncError> {
        let mut batch = Vec::with_capacity(chunk.len());
        for item in chunk {
            match connector.fetch(item).await {
                Ok(content) => batch.push(content),
                Err(e @ SyncError::ReauthorizationRequired(_)) => return Err(e),
                Err(e) => {
                    warn!("Fetch failed for {}: {}", item.path, e);
                    stats.failed += 1;
                }
            }
        }
        if batch.is_empty() {
            return Ok(());
        }

        let ingested = self.pipeline.ingest(batch).await?;
        stats.processed += ingested.processed;
        stats.skipped += ingested.skipped;
        stats.chunks += ingested.chunks;
        Ok(())
    }
}

/// Remote sources first, each group keeping its given order
pub fn visiting_order(sources: &[Source]) -> Vec<&Source> {
    let mut ordered: Vec<&Source> = sources.iter().filter(|s| s.enabled).collect();
    ordered.sort_by_key(|s| match s.kind() {
        SourceKind::Remote => 0,
        SourceKind::Local => 1,
    });
    ordered
}

/// `start + budget`, saturating at a far-off instant instead of overflowing
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(Duration::from_secs(FAR_FUTURE_SECS)))
        .unwrap_or(start)
}

const FAR_FUTURE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Static even split of the run budget
pub fn per_source_budget(total: Duration, sources: usize) -> Duration {
    total / sources.max(1) as u32
}
