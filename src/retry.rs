//! Retry and recoverable-error classification
//!
//! One retry loop serves every job type. A failure is recoverable when
//! its category says so or when its message matches a known
//! transient-infrastructure signature; everything else fails after a
//! single attempt. Exhausting retries is a logged skip, never fatal to
//! the surrounding batch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::JobError;

/// Message fragments that identify transient infrastructure trouble.
///
/// Matched case-insensitively as substrings. Resource-specific lists can
/// extend this via [`RetryPolicy::with_signatures`].
pub const DEFAULT_TRANSIENT_SIGNATURES: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "timed out",
    "timeout",
    "dns",
    "name resolution",
    "detached",
    "execution context",
    "session expired",
    "login required",
    "resource busy",
    "temporarily unavailable",
];

/// Retry policy for a class of leaf work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts for a recoverable failure (first try included)
    pub max_attempts: u32,
    /// Fixed wait between attempts
    #[serde(with = "crate::config::duration_secs")]
    pub delay: Duration,
    /// Transient signature fragments, lowercase
    pub signatures: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            signatures: DEFAULT_TRANSIENT_SIGNATURES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    /// Replace the signature list for a specific resource type
    pub fn with_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signatures = signatures.into_iter().map(|s| s.into().to_lowercase()).collect();
        self
    }

    /// Classify a failure: retry with a fresh resource, or skip
    pub fn is_recoverable(&self, error: &JobError) -> bool {
        if error.is_retryable() {
            return true;
        }
        let message = error.message().to_lowercase();
        self.signatures.iter().any(|sig| message.contains(sig.as_str()))
    }
}

/// Terminal result of a retried unit of work
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// The operation eventually succeeded
    Succeeded { value: T, attempts: u32 },
    /// The unit of work is skipped; the batch continues without it
    Skipped { error: JobError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } => *attempts,
            RetryOutcome::Skipped { attempts, .. } => *attempts,
        }
    }
}

/// Drive an operation to a terminal outcome under the given policy.
///
/// The operation receives the 1-based attempt number and is expected to
/// acquire a fresh resource on each call. `on_recoverable` fires once per
/// recoverable failure, before the delay, so the caller can cool down the
/// implicated resource.
pub async fn run_with_retry<T, F, Fut, C>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
    mut on_recoverable: C,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
    C: FnMut(&JobError),
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Recovered after retry");
                }
                return RetryOutcome::Succeeded { value, attempts: attempt };
            }
            Err(error) => {
                if !policy.is_recoverable(&error) {
                    warn!(label, attempt, error = %error, "Non-recoverable failure, skipping");
                    return RetryOutcome::Skipped { error, attempts: attempt };
                }

                on_recoverable(&error);

                if attempt >= policy.max_attempts {
                    warn!(label, attempt, error = %error, "Retries exhausted, skipping");
                    return RetryOutcome::Skipped { error, attempts: attempt };
                }

                debug!(label, attempt, delay = ?policy.delay, error = %error, "Recoverable failure, will retry");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transient_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let outcome = run_with_retry(
            &fast_policy(),
            "scrape",
            move |_attempt| {
                let calls = calls_op.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::Transient("connection reset by peer".into()))
                    } else {
                        Ok(42u64)
                    }
                }
            },
            |_| {},
        )
        .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_recoverable_fails_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_op = calls.clone();

        let outcome: RetryOutcome<()> = run_with_retry(
            &fast_policy(),
            "scrape",
            move |_attempt| {
                let calls = calls_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Configuration("credential missing".into()))
                }
            },
            |_| {},
        )
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_cools_down_each_failure() {
        let cooldowns = Arc::new(AtomicU32::new(0));
        let cooldowns_hook = cooldowns.clone();

        let outcome: RetryOutcome<()> = run_with_retry(
            &fast_policy(),
            "enrich",
            |_attempt| async { Err(JobError::Transient("timed out".into())) },
            move |_| {
                cooldowns_hook.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(cooldowns.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_signature_match_makes_other_recoverable() {
        let policy = RetryPolicy::default();

        assert!(policy.is_recoverable(&JobError::Other("upstream Connection Reset mid-read".into())));
        assert!(policy.is_recoverable(&JobError::Other("page execution context was destroyed".into())));
        assert!(!policy.is_recoverable(&JobError::Other("listing layout changed".into())));
    }

    #[test]
    fn test_custom_signature_list() {
        let policy = RetryPolicy::default().with_signatures(["Vendor Hiccup"]);

        assert!(policy.is_recoverable(&JobError::Other("vendor hiccup while paging".into())));
        assert!(!policy.is_recoverable(&JobError::Other("connection reset".into())));
    }
}
