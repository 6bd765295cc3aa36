//! Error taxonomy for leaf units of work
//!
//! Failures inside a scrape or enrich pass are classified here so the
//! retry layer can decide between retrying with a fresh egress unit and
//! skipping the unit of work after a single attempt.

use thiserror::Error;

use crate::challenge::ChallengeError;

/// Errors produced by a single unit of batch work
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient infrastructure trouble (connection reset, DNS, detached
    /// session). Eligible for retry with a freshly acquired resource.
    #[error("transient failure: {0}")]
    Transient(String),

    /// No healthy egress capacity available right now
    #[error("egress capacity exhausted: {0}")]
    ResourceExhausted(String),

    /// An interactive login challenge failed or timed out
    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    /// A required credential or setting is missing. Fatal to this job
    /// only, never to the daemon.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything the classifier has no better name for
    #[error("{0}")]
    Other(String),
}

impl JobError {
    /// The message text the transient-signature classifier matches against
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether this error category is retryable regardless of message text
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Transient(_) => true,
            JobError::ResourceExhausted(_) => true,
            JobError::Challenge(e) => e.is_retryable(),
            JobError::Configuration(_) => false,
            JobError::Other(_) => false,
        }
    }
}

impl From<eyre::Report> for JobError {
    fn from(report: eyre::Report) -> Self {
        JobError::Other(format!("{report:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        assert!(JobError::Transient("connection reset by peer".into()).is_retryable());
        assert!(JobError::ResourceExhausted("no healthy proxies".into()).is_retryable());
    }

    #[test]
    fn test_configuration_is_not_retryable() {
        assert!(!JobError::Configuration("missing credential".into()).is_retryable());
        assert!(!JobError::Other("vendor layout changed".into()).is_retryable());
    }

    #[test]
    fn test_from_eyre_report() {
        let report = eyre::eyre!("boom");
        let err: JobError = report.into();
        assert!(matches!(err, JobError::Other(_)));
        assert_eq!(err.message(), "boom");
    }
}
