//! Interval scheduler for sync runs
//!
//! A single loop sleeps for the configured interval, fires, and only then
//! reads the interval again, so a changed interval applies from the next
//! fire on. At most one run is in flight: a fire that arrives while a run
//! is executing is dropped, not queued.

use crate::condition::ConditionGate;
use crate::error::Result;
use crate::models::{RunOutcome, RunRecord, RunTrigger, SchedulerState};
use crate::notify::{Alert, Notifier};
use crate::runner::MultiSourceRunner;
use crate::storage::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler state and statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub state: SchedulerState,
    pub interval_minutes: u64,
    pub run_mode: String,
    pub run_budget_secs: u64,
    /// The timer loop is alive
    pub loop_running: bool,
    pub run_in_flight: bool,
    pub total_fires: u64,
    pub total_runs: u64,
    pub total_skips: u64,
    pub total_dropped: u64,
    pub last_fire: Option<String>,
    pub next_fire: Option<String>,
    pub last_outcome: Option<RunOutcome>,
}

/// What a single fire did
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FireOutcome {
    Completed { record: Box<RunRecord> },
    Paused,
    ConditionNotMet { reason: String },
    AlreadyRunning,
}

#[derive(Default)]
struct InternalStats {
    total_fires: u64,
    total_runs: u64,
    total_skips: u64,
    total_dropped: u64,
    last_fire: Option<DateTime<Utc>>,
    next_fire: Option<DateTime<Utc>>,
    last_outcome: Option<RunOutcome>,
}

/// Marks a run as in flight until dropped
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct SchedulerInner {
    store: Arc<StateStore>,
    gate: Arc<ConditionGate>,
    runner: Arc<MultiSourceRunner>,
    notifier: Arc<dyn Notifier>,
    in_flight: Arc<AtomicBool>,
    loop_running: Arc<AtomicBool>,
    stats: RwLock<InternalStats>,
}

/// Background scheduler firing the runner on the configured interval
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    cancel: CancellationToken,
    task_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<StateStore>,
        gate: Arc<ConditionGate>,
        runner: Arc<MultiSourceRunner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                gate,
                runner,
                notifier,
                in_flight: Arc::new(AtomicBool::new(false)),
                loop_running: Arc::new(AtomicBool::new(false)),
                stats: RwLock::new(InternalStats::default()),
            }),
            cancel: CancellationToken::new(),
            task_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Start the background timer loop
    pub fn start(&self) {
        let mut handle = self.task_handle.lock();
        if handle.is_some() {
            info!("Scheduler already started");
            return;
        }

        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move {
            // Cleared on exit, a panicking loop included
            let _running = InFlightGuard::acquire(&inner.loop_running);
            info!("Scheduler started");
            inner.timer_loop(cancel).await;
            info!("Scheduler stopped");
        }));
    }

    /// Stop the timer. A run already in flight finishes on its own deadline.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fire as a scheduled tick would, honouring the paused state
    pub async fn fire(&self) -> Result<FireOutcome> {
        self.inner.fire(RunTrigger::Scheduled).await
    }

    /// Fire now, ignoring the paused state but not the condition gate.
    /// Waits for the run to finish.
    pub async fn trigger_now(&self) -> Result<FireOutcome> {
        self.inner.fire(RunTrigger::Manual).await
    }

    /// Start a manual fire in the background.
    ///
    /// Returns `None` without spawning when a run is already in flight.
    pub fn spawn_trigger(&self) -> Option<tokio::task::JoinHandle<Result<FireOutcome>>> {
        let guard = InFlightGuard::acquire(&self.inner.in_flight)?;
        let inner = self.inner.clone();
        Some(tokio::spawn(async move {
            inner.fire_guarded(guard, RunTrigger::Manual).await
        }))
    }

    pub async fn pause(&self) -> Result<()> {
        self.inner
            .store
            .set_scheduler_state(SchedulerState::Paused)
            .await?;
        info!("Scheduler paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner
            .store
            .set_scheduler_state(SchedulerState::Running)
            .await?;
        info!("Scheduler resumed");
        Ok(())
    }

    pub fn is_run_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Get scheduler statistics
    pub async fn stats(&self) -> Result<SchedulerStats> {
        let config = self.inner.store.load_configuration().await?;
        let s = self.inner.stats.read().await;
        Ok(SchedulerStats {
            state: config.scheduler_state,
            interval_minutes: config.interval_minutes,
            run_mode: config.run_mode.to_string(),
            run_budget_secs: config.run_budget_secs,
            loop_running: self.inner.loop_running.load(Ordering::SeqCst),
            run_in_flight: self.is_run_in_flight(),
            total_fires: s.total_fires,
            total_runs: s.total_runs,
            total_skips: s.total_skips,
            total_dropped: s.total_dropped,
            last_fire: s.last_fire.map(|d| d.to_rfc3339()),
            next_fire: s.next_fire.map(|d| d.to_rfc3339()),
            last_outcome: s.last_outcome,
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SchedulerInner {
    async fn timer_loop(&self, cancel: CancellationToken) {
        loop {
            // Re-read every cycle; changes apply from the next fire
            let interval = match self.store.load_configuration().await {
                Ok(config) => config.interval(),
                Err(e) => {
                    warn!("Could not read configuration, using default interval: {}", e);
                    Duration::from_secs(crate::models::DEFAULT_INTERVAL_MINUTES * 60)
                }
            };
            {
                let mut s = self.stats.write().await;
                s.next_fire = chrono::Duration::from_std(interval)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
            }
            debug!("Next fire in {:?}", interval);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.fire(RunTrigger::Scheduled).await {
                Ok(outcome) => debug!(?outcome, "Scheduled fire done"),
                Err(e) => warn!("Scheduled fire failed: {}", e),
            }
        }
    }

    async fn fire(&self, trigger: RunTrigger) -> Result<FireOutcome> {
        match InFlightGuard::acquire(&self.in_flight) {
            Some(guard) => self.fire_guarded(guard, trigger).await,
            None => {
                info!("Run already in flight, dropping {} fire", trigger.as_str());
                self.stats.write().await.total_dropped += 1;
                Ok(FireOutcome::AlreadyRunning)
            }
        }
    }

    async fn fire_guarded(&self, _guard: InFlightGuard, trigger: RunTrigger) -> Result<FireOutcome> {
        {
            let mut s = self.stats.write().await;
            s.total_fires += 1;
            s.last_fire = Some(Utc::now());
        }

        let config = self.store.load_configuration().await?;
        if trigger == RunTrigger::Scheduled && config.scheduler_state == SchedulerState::Paused {
            debug!("Scheduler paused, skipping fire");
            self.stats.write().await.total_skips += 1;
            return Ok(FireOutcome::Paused);
        }

        let decision = self.gate.evaluate(&config.run_mode).await;
        if !decision.allowed {
            info!("Skipping fire: {}", decision.reason);
            self.stats.write().await.total_skips += 1;
            return Ok(FireOutcome::ConditionNotMet {
                reason: decision.reason,
            });
        }

        let sources = self.store.list_enabled_sources().await?;
        let mut record = self
            .runner
            .run_as(&sources, config.run_budget(), trigger)
            .await;
        if let Some(alert) = Alert::from_record(&record) {
            self.notifier.notify(&alert).await;
        }
        match self.store.record_run(&record).await {
            Ok(id) => record.id = Some(id),
            Err(e) => error!(run_id = %record.run_id, "Could not record run: {}", e),
        }

        {
            let mut s = self.stats.write().await;
            s.total_runs += 1;
            s.last_outcome = Some(record.outcome);
        }
        Ok(FireOutcome::Completed {
            record: Box::new(record),
        })
    }
}
