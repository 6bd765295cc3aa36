//! Standby promotion watcher
//!
//! A worker that lost the acquisition race polls for promotion on a
//! fixed interval plus random jitter, so a fleet of standbys does not
//! stampede a freshly stale lock. Promotion is one-way: a primary never
//! returns to standby except by process exit. While standing by, the
//! only side effects are the poll itself and log output.

use std::time::Duration;

use eyre::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::StandbyConfig;
use crate::lock::{LockGuard, LockManager};

/// Polls the lock until this process can become primary
pub struct StandbyWatcher {
    lock: LockManager,
    poll_interval: Duration,
    jitter_bound: Duration,
}

impl StandbyWatcher {
    pub fn new(lock: LockManager, config: &StandbyConfig) -> Self {
        Self {
            lock,
            poll_interval: config.poll_interval(),
            jitter_bound: config.jitter_bound(),
        }
    }

    /// Block until promoted or told to shut down.
    ///
    /// Returns `Ok(Some(guard))` on promotion; `Ok(None)` when a shutdown
    /// message arrives first. Each tick reclaims a stale marker if there
    /// is one, then retries acquisition.
    pub async fn wait_for_promotion(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<Option<LockGuard>> {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            jitter_secs = self.jitter_bound.as_secs(),
            "Entering standby, polling for promotion"
        );

        loop {
            let delay = self.jittered_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    info!("Standby shutting down before promotion");
                    return Ok(None);
                }
            }

            // acquire() reclaims a stale marker before giving up.
            match self.lock.acquire()? {
                Some(guard) => {
                    info!("Promoted from standby to primary");
                    return Ok(Some(guard));
                }
                None => debug!("Lock still held elsewhere, remaining on standby"),
            }
        }
    }

    /// Poll interval plus a uniform random jitter in `[0, jitter_bound]`
    fn jittered_delay(&self) -> Duration {
        let jitter_ms = self.jitter_bound.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}
