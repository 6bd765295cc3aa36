//! Scheduler implementation
//!
//! Single-writer: all `RunState` mutation happens inside this task.
//! External readers get snapshots through the watch channel; external
//! control arrives through [`SchedulerControl`] and the shutdown channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use eyre::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::phase::{Phase, PhasePlan, Stage};
use super::SchedulerControl;
use crate::challenge::ChallengeBroker;
use crate::config::{ConcurrencyConfig, SchedulerConfig};
use crate::error::JobError;
use crate::limiter::Limiter;
use crate::retry::{RetryOutcome, RetryPolicy, run_with_retry};
use crate::sources::{EgressPool, ListingCatalog, ListingSource, Valuer};
use crate::status::{BatchProgress, RunState, RunStatus, StatusHandle};

/// Collaborators the scheduler drives
pub struct SchedulerDeps {
    pub sources: Vec<Arc<dyn ListingSource>>,
    pub catalog: Arc<dyn ListingCatalog>,
    pub valuer: Arc<dyn Valuer>,
    pub pool: Arc<dyn EgressPool>,
    pub broker: Arc<ChallengeBroker>,
}

/// Terminal state of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted,
    NoSources,
    /// The catalog was unreachable; the caller applies a longer
    /// inter-tick backoff
    PersistenceDown,
}

/// Control-and-observe handle for a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    control: SchedulerControl,
    broker: Arc<ChallengeBroker>,
    status: StatusHandle,
}

impl SchedulerHandle {
    /// Latest run-state snapshot
    pub fn status(&self) -> RunState {
        self.status.snapshot()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Abort at the next checkpoint, cancel any outstanding challenge,
    /// and suppress new cycles until [`SchedulerHandle::restart`].
    pub fn force_stop(&self) {
        self.control.force_stop();
        self.broker.cancel_active("force stop");
    }

    pub fn restart(&self) {
        self.control.restart();
    }
}

/// The multi-source batch cycle state machine
pub struct CycleScheduler {
    config: SchedulerConfig,
    concurrency: ConcurrencyConfig,
    retry: RetryPolicy,
    deps: SchedulerDeps,
    limiter: Arc<Limiter>,
    control: SchedulerControl,
    state: RunState,
    status_tx: watch::Sender<RunState>,
    /// Per-source records collected this cycle; resets only when that
    /// source's enrich backlog fully drains
    batch_counts: HashMap<String, u64>,
}

impl CycleScheduler {
    pub fn new(
        config: SchedulerConfig,
        concurrency: ConcurrencyConfig,
        retry: RetryPolicy,
        deps: SchedulerDeps,
        control: SchedulerControl,
    ) -> Self {
        let selected: Vec<String> = deps.sources.iter().map(|s| s.id().to_string()).collect();
        let state = RunState::new(selected, config.batch_limit);
        let (status_tx, _) = watch::channel(state.clone());
        let limiter = Arc::new(Limiter::new(concurrency.auto.floor));

        Self {
            config,
            concurrency,
            retry,
            deps,
            limiter,
            control,
            state,
            status_tx,
            batch_counts: HashMap::new(),
        }
    }

    /// Handle for status reads and force-stop, usable before and after
    /// the scheduler task is spawned
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control.clone(),
            broker: self.deps.broker.clone(),
            status: StatusHandle::new(self.status_tx.subscribe()),
        }
    }

    pub fn limiter(&self) -> Arc<Limiter> {
        self.limiter.clone()
    }

    /// Drive repeated cycles until the shutdown channel fires.
    ///
    /// The interval tick is the only thing that starts a cycle; ticks
    /// that land while a cycle is still running coalesce into a single
    /// delayed restart instead of a duplicate run.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            sources = ?self.state.selected_sources,
            interval_secs = self.config.run_interval_secs,
            "Scheduler starting"
        );

        let mut interval = tokio::time::interval(self.config.run_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler shutdown requested");
                    break;
                }
            }
        }

        self.reset_to_idle();
        info!("Scheduler stopped");
        Ok(())
    }

    /// One scheduler tick: start a cycle unless disabled or already running
    pub async fn tick(&mut self) {
        if !self.control.is_enabled() {
            debug!("Scheduler disabled, tick is a no-op");
            return;
        }
        if self.state.is_running {
            debug!("Run already in progress, tick is a no-op");
            return;
        }

        let outcome = self.run_cycle().await;
        if outcome == CycleOutcome::PersistenceDown {
            warn!(
                backoff_secs = self.config.run_interval_secs,
                "Catalog unreachable, backing off before the next cycle"
            );
            self.control.interruptible_sleep(self.config.run_interval()).await;
        }
    }

    /// Execute one full cycle over the selected sources
    async fn run_cycle(&mut self) -> CycleOutcome {
        // The plan derives from the selection once per cycle; wraparound
        // is the only point where a changed selection takes effect.
        let plan = PhasePlan::new(&self.state.selected_sources);
        if plan.is_empty() {
            debug!("No sources selected, nothing to schedule");
            return CycleOutcome::NoSources;
        }

        self.state.is_running = true;
        self.state.status = RunStatus::Running;
        self.state.last_run_at = Some(Utc::now());
        self.publish();

        let mut outcome = CycleOutcome::Completed;
        let mut current = plan.start();

        while let Some(phase) = current {
            if self.control.aborted() {
                info!(phase = %phase, "Abort observed between phases");
                outcome = CycleOutcome::Aborted;
                break;
            }

            self.state.phase = Some(phase.clone());
            self.publish();
            debug!(phase = %phase, "Entering phase");

            current = match phase.stage {
                Stage::Scrape => {
                    match self.deps.catalog.pending_count(&phase.source, self.config.only_missing).await {
                        Ok(pending)
                            if self.config.backpressure_threshold > 0
                                && pending >= self.config.backpressure_threshold =>
                        {
                            info!(
                                source = %phase.source,
                                pending,
                                threshold = self.config.backpressure_threshold,
                                "Enrich backlog over threshold, skipping straight to enrich"
                            );
                            Some(plan.enrich(phase.source_idx))
                        }
                        Ok(_) => {
                            self.run_scrape(&phase).await;
                            plan.next(&phase)
                        }
                        Err(e) => {
                            self.mark_persistence_down(&e);
                            outcome = CycleOutcome::PersistenceDown;
                            break;
                        }
                    }
                }
                Stage::Enrich => {
                    if self.run_enrich(&phase).await {
                        plan.next(&phase)
                    } else {
                        outcome = CycleOutcome::PersistenceDown;
                        break;
                    }
                }
                Stage::BreakBeforeEnrich | Stage::BreakAfter => {
                    self.control.interruptible_sleep(self.config.break_duration()).await;
                    plan.next(&phase)
                }
            };
        }

        if self.control.aborted() {
            outcome = CycleOutcome::Aborted;
        }

        self.state.phase = None;
        self.state.is_running = false;
        self.state.status = match outcome {
            CycleOutcome::Completed => RunStatus::Completed,
            CycleOutcome::Aborted | CycleOutcome::NoSources => RunStatus::Idle,
            CycleOutcome::PersistenceDown => RunStatus::Error,
        };
        self.publish();
        info!(?outcome, "Cycle finished");
        outcome
    }

    /// One bounded scrape pass. Never fails the cycle: errors become
    /// skip counts and the phase still completes.
    async fn run_scrape(&mut self, phase: &Phase) {
        let source_id = phase.source.clone();
        let Some(source) = self.deps.sources.iter().find(|s| s.id() == source_id).cloned() else {
            warn!(source = %source_id, "Selected source has no connector, skipping");
            return;
        };

        let collected = *self.batch_counts.get(&source_id).unwrap_or(&0);
        self.state.batch = BatchProgress {
            collected,
            limit: self.config.batch_limit,
        };
        if collected >= self.config.batch_limit {
            info!(
                source = %source_id,
                collected,
                limit = self.config.batch_limit,
                "Batch cap reached, scrape waits for enrich to drain"
            );
            return;
        }
        let allowance = self.config.batch_limit - collected;

        // Size the limiter from pool health; an explicit override wins.
        let healthy = self.deps.pool.healthy_units().await;
        let bound = self.concurrency.limit_for(&source_id, healthy);
        self.limiter.set_limit(bound);
        self.state.concurrency_limits.insert(source_id.clone(), bound);
        self.publish();

        let retry = self.retry.clone();
        let limiter = self.limiter.clone();
        let pool = self.deps.pool.clone();
        let label = phase.label();
        let scrape = {
            let source = source.clone();
            async move {
                run_with_retry(
                    &retry,
                    &label,
                    |_attempt| {
                        let source = source.clone();
                        let limiter = limiter.clone();
                        async move { limiter.run(source.scrape(allowance)).await }
                    },
                    |err| {
                        let pool = pool.clone();
                        let reason = err.to_string();
                        tokio::spawn(async move { pool.cooldown(&reason).await });
                    },
                )
                .await
            }
        };

        match self.watch_challenges(scrape).await {
            RetryOutcome::Succeeded { value: new_records, attempts } => {
                debug!(source = %source_id, new_records, attempts, "Scrape pass complete");
                *self.batch_counts.entry(source_id.clone()).or_insert(0) += new_records;
                self.state.batch.collected += new_records;
                self.state.stats_mut(&source_id).scraped += new_records;
            }
            RetryOutcome::Skipped { error, attempts } => {
                warn!(source = %source_id, attempts, error = %error, "Scrape pass skipped");
                self.state.stats_mut(&source_id).skipped += 1;
                self.state.last_error = Some(error.to_string());
            }
        }

        self.refresh_pending(&source_id).await;
        self.publish();
    }

    /// Re-entrant enrich pass: loops with a short delay while backlog
    /// remains, drains it, then resets the source's batch counter.
    /// Returns false only when the catalog itself is unreachable.
    async fn run_enrich(&mut self, phase: &Phase) -> bool {
        let source_id = phase.source.clone();

        loop {
            if self.control.aborted() {
                return true;
            }

            let refs = match self
                .deps
                .catalog
                .pending_valuations(&source_id, self.config.only_missing, self.config.enrich_chunk)
                .await
            {
                Ok(refs) => refs,
                Err(e) => {
                    self.mark_persistence_down(&e);
                    return false;
                }
            };

            if refs.is_empty() {
                debug!(source = %source_id, "Enrich backlog drained, batch counter reset");
                self.batch_counts.insert(source_id.clone(), 0);
                self.state.batch.collected = 0;
                self.state.stats_mut(&source_id).pending = 0;
                self.publish();
                return true;
            }

            let mut tasks = Vec::new();
            for record in refs {
                // Abort lands between queued sub-tasks, never mid-record.
                if self.control.aborted() {
                    break;
                }

                let retry = self.retry.clone();
                let limiter = self.limiter.clone();
                let valuer = self.deps.valuer.clone();
                let catalog = self.deps.catalog.clone();
                let pool = self.deps.pool.clone();
                tasks.push(async move {
                    let label = format!("enrich_{record}");
                    let outcome = run_with_retry(
                        &retry,
                        &label,
                        |_attempt| {
                            let limiter = limiter.clone();
                            let valuer = valuer.clone();
                            let catalog = catalog.clone();
                            let record = record.clone();
                            async move {
                                limiter
                                    .run(async move {
                                        match valuer.derive_value(&record).await? {
                                            Some(estimate) => {
                                                catalog.store_estimate(&record, estimate).await?;
                                                Ok(true)
                                            }
                                            None => {
                                                catalog.record_no_value(&record).await?;
                                                Ok(false)
                                            }
                                        }
                                    })
                                    .await
                            }
                        },
                        |err: &JobError| {
                            let pool = pool.clone();
                            let reason = err.to_string();
                            tokio::spawn(async move { pool.cooldown(&reason).await });
                        },
                    )
                    .await;

                    if let RetryOutcome::Skipped { .. } = &outcome {
                        // Processed-with-failure: take it out of the backlog
                        // so the drain can still complete.
                        let _ = catalog.record_no_value(&record).await;
                    }
                    outcome
                });
            }

            let outcomes = self.watch_challenges(futures::future::join_all(tasks)).await;
            let stats = self.state.stats_mut(&source_id);
            for outcome in outcomes {
                match outcome {
                    RetryOutcome::Succeeded { value: true, .. } => stats.enriched += 1,
                    RetryOutcome::Succeeded { value: false, .. } => stats.skipped += 1,
                    RetryOutcome::Skipped { .. } => stats.skipped += 1,
                }
            }

            self.refresh_pending(&source_id).await;
            self.publish();

            if self.control.aborted() {
                return true;
            }
            self.control.interruptible_sleep(self.config.enrich_retry_delay()).await;
        }
    }

    /// Await leaf work while mirroring challenge lifecycle into the
    /// published status.
    async fn watch_challenges<T>(&mut self, fut: impl Future<Output = T>) -> T {
        let mut challenges = self.deps.broker.subscribe();
        tokio::pin!(fut);

        loop {
            tokio::select! {
                out = &mut fut => {
                    if self.state.status == RunStatus::WaitingChallenge {
                        self.state.status = RunStatus::Running;
                        self.state.active_challenge = None;
                        self.publish();
                    }
                    return out;
                }
                changed = challenges.changed() => {
                    if changed.is_err() {
                        return fut.await;
                    }
                    let active = challenges.borrow_and_update().clone();
                    self.state.status = if active.is_some() {
                        RunStatus::WaitingChallenge
                    } else {
                        RunStatus::Running
                    };
                    self.state.active_challenge = active;
                    self.publish();
                }
            }
        }
    }

    async fn refresh_pending(&mut self, source_id: &str) {
        if let Ok(pending) = self.deps.catalog.pending_count(source_id, self.config.only_missing).await {
            self.state.stats_mut(source_id).pending = pending;
        }
    }

    fn mark_persistence_down(&mut self, error: &JobError) {
        error!(error = %error, "Catalog unreachable");
        self.state.last_error = Some(error.to_string());
    }

    fn reset_to_idle(&mut self) {
        self.state.status = RunStatus::Idle;
        self.state.is_running = false;
        self.state.phase = None;
        self.state.active_challenge = None;
        self.publish();
    }

    fn publish(&mut self) {
        self.state.enabled = self.control.is_enabled();
        self.status_tx.send_replace(self.state.clone());
    }
}
