//! Interactive one-time-code arbitration
//!
//! Some vendor logins interrupt automation with a one-time code sent to
//! an inbox or surfaced in a UI. The broker owns exactly one outstanding
//! challenge per login flow and races the available resolution channels;
//! the first code wins and the rest are abandoned.

mod broker;
mod store;

pub use broker::{ChallengeBroker, ChallengeBrokerConfig};
pub use store::FileChallengeStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An outstanding one-time-code requirement raised during a login
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Unique id; submissions and store entries are keyed by this
    pub id: String,
    /// Service the login belongs to
    pub service: String,
    /// Human-readable prompt shown by whichever UI answers
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
}

impl Challenge {
    pub fn new(service: &str, prompt: &str, timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            service: service.to_string(),
            prompt: prompt.to_string(),
            created_at: now,
            timeout_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(120)),
        }
    }
}

/// Errors from challenge arbitration
#[derive(Debug, Error)]
pub enum ChallengeError {
    /// No channel produced a code in time; the login attempt fails and
    /// the daemon continues.
    #[error("no channel answered the {service} challenge within {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// The challenge was cleared while a waiter was still pending
    #[error("challenge cancelled: {0}")]
    Cancelled(String),

    /// The durable store misbehaved
    #[error("challenge store error: {0}")]
    Store(String),
}

impl ChallengeError {
    /// Retrying a login immediately after a failed challenge would just
    /// raise another one, so none of these are retryable.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Durable cross-process challenge store.
///
/// A UI running in another process answers challenges by resolving store
/// entries; the broker polls for that resolution.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Publish a new pending challenge
    async fn create(&self, challenge: &Challenge) -> Result<(), ChallengeError>;

    /// Check for a resolution. `Ok(None)` while still pending.
    async fn poll(&self, id: &str) -> Result<Option<String>, ChallengeError>;

    /// Remove a resolved entry after its code has been used
    async fn consume(&self, id: &str) -> Result<(), ChallengeError>;

    /// Withdraw a pending entry (another channel won, or the wait timed out)
    async fn cancel(&self, id: &str) -> Result<(), ChallengeError>;
}
