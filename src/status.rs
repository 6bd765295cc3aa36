//! Read-only status surface over scheduler state
//!
//! The scheduler is the single writer; everyone else reads immutable
//! snapshots through a [`StatusHandle`]. No consumer can mutate scheduler
//! state from here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::challenge::Challenge;
use crate::scheduler::Phase;

/// Coarse run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    WaitingChallenge,
    Stopping,
    Error,
    Completed,
}

/// Per-source batch counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SourceStats {
    /// New records collected by scrape passes
    pub scraped: u64,
    /// Records that received a derived estimate
    pub enriched: u64,
    /// Units of work skipped after exhausted retries or absent values
    pub skipped: u64,
    /// Records still awaiting a valuation pass
    pub pending: u64,
}

/// Progress of the current cycle's scrape batch
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchProgress {
    /// Records collected this cycle for the current source
    pub collected: u64,
    /// Per-cycle cap
    pub limit: u64,
}

/// Snapshot of the scheduler's run state
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub is_running: bool,
    /// False after `force_stop` until explicitly re-enabled
    pub enabled: bool,
    pub phase: Option<Phase>,
    pub selected_sources: Vec<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub per_source: BTreeMap<String, SourceStats>,
    pub batch: BatchProgress,
    /// Effective limiter bound per source, as of its last scrape phase
    pub concurrency_limits: BTreeMap<String, usize>,
    pub active_challenge: Option<Challenge>,
}

impl RunState {
    pub fn new(selected_sources: Vec<String>, batch_limit: u64) -> Self {
        let per_source = selected_sources
            .iter()
            .map(|s| (s.clone(), SourceStats::default()))
            .collect();
        Self {
            status: RunStatus::Idle,
            is_running: false,
            enabled: true,
            phase: None,
            selected_sources,
            last_run_at: None,
            last_error: None,
            per_source,
            batch: BatchProgress {
                collected: 0,
                limit: batch_limit,
            },
            concurrency_limits: BTreeMap::new(),
            active_challenge: None,
        }
    }

    /// Stats entry for a source, created on first touch
    pub fn stats_mut(&mut self, source: &str) -> &mut SourceStats {
        self.per_source.entry(source.to_string()).or_default()
    }
}

/// Cloneable read handle onto the scheduler's published state
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<RunState>,
}

impl StatusHandle {
    pub fn new(rx: watch::Receiver<RunState>) -> Self {
        Self { rx }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> RunState {
        self.rx.borrow().clone()
    }

    /// Wait for the next state change. Used by UIs that render on update.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
