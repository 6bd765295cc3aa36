//! Phase scheduler
//!
//! Timer-driven state machine sequencing every selected source through
//! scrape → break → enrich → break. Leaf work runs under the
//! concurrency limiter with retry classification; scheduler state has
//! exactly one writer (the scheduler task) and is read through
//! [`crate::status::StatusHandle`] snapshots.

mod core;
mod phase;

pub use core::{CycleOutcome, CycleScheduler, SchedulerDeps, SchedulerHandle};
pub use phase::{Phase, PhasePlan, Stage};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

/// Cooperative cancellation surface shared with the scheduler.
///
/// The abort flag is polled at safe checkpoints only: between phases,
/// between queued sub-tasks, and inside breaks. In-flight leaf I/O is
/// never preemptively killed.
#[derive(Debug, Clone)]
pub struct SchedulerControl {
    abort: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Default for SchedulerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerControl {
    pub fn new() -> Self {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Halt scheduling of new work at the next safe checkpoint and
    /// suppress further cycles until [`SchedulerControl::restart`].
    pub fn force_stop(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
        info!("Force stop requested");
    }

    /// Re-enable scheduling after a force stop
    pub fn restart(&self) {
        self.abort.store(false, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        info!("Scheduler re-enabled");
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Sleep that ends early when a force stop lands
    pub async fn interruptible_sleep(&self, duration: Duration) {
        if self.aborted() {
            return;
        }
        let woken = self.wake.notified();
        tokio::pin!(woken);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = &mut woken => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_stop_and_restart() {
        let control = SchedulerControl::new();
        assert!(control.is_enabled());
        assert!(!control.aborted());

        control.force_stop();
        assert!(!control.is_enabled());
        assert!(control.aborted());

        control.restart();
        assert!(control.is_enabled());
        assert!(!control.aborted());
    }

    #[tokio::test]
    async fn test_force_stop_interrupts_sleep() {
        let control = SchedulerControl::new();

        let sleeper = {
            let control = control.clone();
            tokio::spawn(async move {
                control.interruptible_sleep(Duration::from_secs(60)).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.force_stop();

        tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .expect("sleep must end at force stop")
            .unwrap();
    }
}
