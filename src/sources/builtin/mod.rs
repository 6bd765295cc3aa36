//! Built-in collaborator implementations
//!
//! Filesystem-backed reference implementations of the collaborator
//! traits. They make the daemon and its tests runnable end to end;
//! production vendor connectors live outside this crate and replace the
//! drop-dir source.

mod comps_valuer;
mod drop_dir;
mod json_catalog;

pub use comps_valuer::CompsValuer;
pub use drop_dir::DropDirSource;
pub use json_catalog::JsonCatalog;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{EgressPool, InboxFetcher};
use crate::error::JobError;

/// Egress pool with a fixed unit count.
///
/// Stands in for a proxy/browser pool manager; cooldowns are counted but
/// capacity never actually degrades.
#[derive(Debug, Default)]
pub struct StaticEgressPool {
    units: usize,
    cooldowns: AtomicUsize,
}

impl StaticEgressPool {
    pub fn new(units: usize) -> Self {
        Self {
            units,
            cooldowns: AtomicUsize::new(0),
        }
    }

    /// Total cooldowns applied so far
    pub fn cooldown_count(&self) -> usize {
        self.cooldowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EgressPool for StaticEgressPool {
    async fn healthy_units(&self) -> usize {
        self.units
    }

    async fn cooldown(&self, reason: &str) {
        self.cooldowns.fetch_add(1, Ordering::SeqCst);
        warn!(reason, "Egress unit placed on cooldown");
    }
}

/// Inbox fetcher that watches for a dropped code file.
///
/// An external mail poller writes the extracted code to
/// `<dir>/<service>.code`; this fetcher picks it up and deletes it.
#[derive(Debug, Clone)]
pub struct FileInbox {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileInbox {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl InboxFetcher for FileInbox {
    async fn fetch_code(&self, service: &str, timeout: Duration) -> Result<String, JobError> {
        let path = self.dir.join(format!("{service}.code"));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                let code = contents.trim().to_string();
                if !code.is_empty() {
                    let _ = std::fs::remove_file(&path);
                    debug!(service, "Code file picked up from inbox directory");
                    return Ok(code);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(JobError::Other(format!("no code arrived for {service} within {timeout:?}")));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
