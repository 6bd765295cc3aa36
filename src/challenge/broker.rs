//! Challenge broker
//!
//! Owns the single outstanding challenge per login flow and races the
//! three resolution channels: an in-process submission, the durable
//! cross-process store (polled), and an automatic inbox fetch. First
//! code wins; the losing channels are abandoned and must never surface
//! an error for resolving late.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, info, warn};

use super::{Challenge, ChallengeError, ChallengeStore};
use crate::sources::InboxFetcher;

/// Broker tuning
#[derive(Debug, Clone)]
pub struct ChallengeBrokerConfig {
    /// How long to wait for any channel to answer
    pub timeout: Duration,
    /// Polling cadence against the durable store
    pub store_poll_interval: Duration,
}

impl Default for ChallengeBrokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            store_poll_interval: Duration::from_secs(2),
        }
    }
}

enum Resolution {
    Submitted(String),
    Store(String),
    Inbox(String),
    Cancelled(String),
    TimedOut,
}

/// Multi-channel one-time-code arbitration
pub struct ChallengeBroker {
    config: ChallengeBrokerConfig,
    store: Arc<dyn ChallengeStore>,
    inbox: Arc<dyn InboxFetcher>,
    /// One login flow at a time per service; held for the whole attempt
    login_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// In-process resolver map: UI submissions land here
    waiters: StdMutex<HashMap<String, oneshot::Sender<String>>>,
    /// Cancellation side-channel for the active request
    cancels: StdMutex<HashMap<String, oneshot::Sender<String>>>,
    /// Latest outstanding challenge, published to subscribers
    active_tx: watch::Sender<Option<Challenge>>,
}

impl ChallengeBroker {
    pub fn new(
        config: ChallengeBrokerConfig,
        store: Arc<dyn ChallengeStore>,
        inbox: Arc<dyn InboxFetcher>,
    ) -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            config,
            store,
            inbox,
            login_locks: StdMutex::new(HashMap::new()),
            waiters: StdMutex::new(HashMap::new()),
            cancels: StdMutex::new(HashMap::new()),
            active_tx,
        }
    }

    /// Subscribe to challenge lifecycle updates. Subscribers observe the
    /// latest value only and never mutate broker state.
    pub fn subscribe(&self) -> watch::Receiver<Option<Challenge>> {
        self.active_tx.subscribe()
    }

    /// The currently outstanding challenge, if any
    pub fn active(&self) -> Option<Challenge> {
        self.active_tx.borrow().clone()
    }

    /// In-process resolution channel: a UI in this process answers the
    /// challenge. Returns false when the challenge is no longer pending;
    /// a late submission is not an error.
    pub fn submit(&self, id: &str, code: &str) -> bool {
        let Some(tx) = self.waiters.lock().unwrap().remove(id) else {
            debug!(id, "Submission for a challenge that is no longer pending");
            return false;
        };
        tx.send(code.to_string()).is_ok()
    }

    /// Cancel the outstanding challenge, rejecting its waiter
    pub fn cancel_active(&self, reason: &str) {
        let Some(challenge) = self.active() else {
            return;
        };
        if let Some(tx) = self.cancels.lock().unwrap().remove(&challenge.id) {
            let _ = tx.send(reason.to_string());
        }
    }

    /// Raise a challenge for a login flow and wait for a code.
    ///
    /// Holds the service's login mutex for the whole attempt so two
    /// concurrent logins for one account cannot issue competing codes.
    pub async fn request(&self, service: &str, prompt: &str) -> Result<String, ChallengeError> {
        let login_lock = self.login_lock(service);
        let _login = login_lock.lock().await;

        let challenge = Challenge::new(service, prompt, self.config.timeout);
        let (code_tx, code_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(challenge.id.clone(), code_tx);
        self.cancels.lock().unwrap().insert(challenge.id.clone(), cancel_tx);

        if let Err(e) = self.store.create(&challenge).await {
            // The durable channel just won't answer; the other two still race.
            warn!(error = %e, service, "Failed to publish challenge to durable store");
        }
        self.active_tx.send_replace(Some(challenge.clone()));
        info!(id = %challenge.id, service, "Challenge raised, racing resolution channels");

        let resolution = self.race(&challenge, code_rx, cancel_rx).await;

        // Clear the challenge whatever the outcome. Late resolutions on the
        // losing channels find nothing to resolve and are ignored.
        self.waiters.lock().unwrap().remove(&challenge.id);
        self.cancels.lock().unwrap().remove(&challenge.id);
        self.active_tx.send_replace(None);

        match resolution {
            Resolution::Submitted(code) => {
                info!(id = %challenge.id, service, "Challenge answered in-process");
                let _ = self.store.cancel(&challenge.id).await;
                Ok(code)
            }
            Resolution::Store(code) => {
                info!(id = %challenge.id, service, "Challenge answered via durable store");
                let _ = self.store.consume(&challenge.id).await;
                Ok(code)
            }
            Resolution::Inbox(code) => {
                info!(id = %challenge.id, service, "Challenge answered from inbox");
                let _ = self.store.cancel(&challenge.id).await;
                Ok(code)
            }
            Resolution::Cancelled(reason) => {
                warn!(id = %challenge.id, service, reason = %reason, "Challenge cancelled");
                let _ = self.store.cancel(&challenge.id).await;
                Err(ChallengeError::Cancelled(reason))
            }
            Resolution::TimedOut => {
                warn!(id = %challenge.id, service, timeout = ?self.config.timeout, "Challenge timed out");
                let _ = self.store.cancel(&challenge.id).await;
                Err(ChallengeError::Timeout {
                    service: service.to_string(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    async fn race(
        &self,
        challenge: &Challenge,
        code_rx: oneshot::Receiver<String>,
        cancel_rx: oneshot::Receiver<String>,
    ) -> Resolution {
        let submitted = async {
            match code_rx.await {
                Ok(code) => code,
                // Sender dropped without sending; only cleanup does that,
                // and cleanup only runs after the race. Park forever.
                Err(_) => std::future::pending().await,
            }
        };

        let store_poll = async {
            loop {
                tokio::time::sleep(self.config.store_poll_interval).await;
                match self.store.poll(&challenge.id).await {
                    Ok(Some(code)) => return code,
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, id = %challenge.id, "Store poll failed, retrying"),
                }
            }
        };

        let inbox_fetch = async {
            match self.inbox.fetch_code(&challenge.service, self.config.timeout).await {
                Ok(code) => code,
                Err(e) => {
                    debug!(error = %e, service = %challenge.service, "Inbox channel gave up");
                    std::future::pending().await
                }
            }
        };

        let cancelled = async {
            match cancel_rx.await {
                Ok(reason) => reason,
                Err(_) => std::future::pending().await,
            }
        };

        tokio::select! {
            code = submitted => Resolution::Submitted(code),
            code = store_poll => Resolution::Store(code),
            code = inbox_fetch => Resolution::Inbox(code),
            reason = cancelled => Resolution::Cancelled(reason),
            _ = tokio::time::sleep(self.config.timeout) => Resolution::TimedOut,
        }
    }

    fn login_lock(&self, service: &str) -> Arc<Mutex<()>> {
        self.login_locks
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::FileChallengeStore;
    use crate::error::JobError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Inbox that never produces a code
    struct SilentInbox;

    #[async_trait]
    impl InboxFetcher for SilentInbox {
        async fn fetch_code(&self, _service: &str, timeout: Duration) -> Result<String, JobError> {
            tokio::time::sleep(timeout * 2).await;
            Err(JobError::Other("no message arrived".into()))
        }
    }

    /// Inbox that produces a fixed code after a delay
    struct DelayedInbox {
        code: String,
        delay: Duration,
    }

    #[async_trait]
    impl InboxFetcher for DelayedInbox {
        async fn fetch_code(&self, _service: &str, _timeout: Duration) -> Result<String, JobError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.code.clone())
        }
    }

    fn broker_with(
        dir: &TempDir,
        timeout: Duration,
        inbox: Arc<dyn InboxFetcher>,
    ) -> (Arc<ChallengeBroker>, Arc<FileChallengeStore>) {
        let store = Arc::new(FileChallengeStore::new(dir.path().join("challenges")));
        let config = ChallengeBrokerConfig {
            timeout,
            store_poll_interval: Duration::from_millis(10),
        };
        (Arc::new(ChallengeBroker::new(config, store.clone(), inbox)), store)
    }

    async fn wait_for_active(broker: &ChallengeBroker) -> Challenge {
        let mut rx = broker.subscribe();
        loop {
            if let Some(challenge) = rx.borrow_and_update().clone() {
                return challenge;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_in_process_submission_wins() {
        let dir = TempDir::new().unwrap();
        let (broker, _store) = broker_with(&dir, Duration::from_secs(10), Arc::new(SilentInbox));

        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("vendor-a", "enter code").await })
        };

        let challenge = wait_for_active(&broker).await;
        assert!(broker.submit(&challenge.id, "654321"));

        let code = task.await.unwrap().unwrap();
        assert_eq!(code, "654321");
        assert!(broker.active().is_none(), "challenge must clear on resolution");
        assert!(!broker.submit(&challenge.id, "late"), "late submission must be a no-op");
    }

    #[tokio::test]
    async fn test_durable_store_channel_wins() {
        let dir = TempDir::new().unwrap();
        let (broker, store) = broker_with(&dir, Duration::from_secs(10), Arc::new(SilentInbox));

        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("vendor-a", "enter code").await })
        };

        let challenge = wait_for_active(&broker).await;
        store.resolve(&challenge.id, "111222").unwrap();

        let code = task.await.unwrap().unwrap();
        assert_eq!(code, "111222");
        // The winning store entry is consumed.
        assert_eq!(store.poll(&challenge.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inbox_channel_wins() {
        let dir = TempDir::new().unwrap();
        let inbox = Arc::new(DelayedInbox {
            code: "987000".into(),
            delay: Duration::from_millis(20),
        });
        let (broker, store) = broker_with(&dir, Duration::from_secs(10), inbox);

        let code = broker.request("vendor-a", "enter code").await.unwrap();
        assert_eq!(code, "987000");
        // The abandoned store entry is withdrawn.
        assert!(store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_clears_challenge() {
        let dir = TempDir::new().unwrap();
        let (broker, store) = broker_with(&dir, Duration::from_millis(50), Arc::new(SilentInbox));

        let err = broker.request("vendor-a", "enter code").await.unwrap_err();
        assert!(matches!(err, ChallengeError::Timeout { .. }));
        assert!(broker.active().is_none());
        assert!(store.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_rejects_waiter() {
        let dir = TempDir::new().unwrap();
        let (broker, _store) = broker_with(&dir, Duration::from_secs(10), Arc::new(SilentInbox));

        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("vendor-a", "enter code").await })
        };

        wait_for_active(&broker).await;
        broker.cancel_active("force stop");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ChallengeError::Cancelled(_)));
        assert!(broker.active().is_none());
    }

    #[tokio::test]
    async fn test_logins_for_one_service_are_serialized() {
        let dir = TempDir::new().unwrap();
        let (broker, _store) = broker_with(&dir, Duration::from_secs(10), Arc::new(SilentInbox));

        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("vendor-a", "first login").await })
        };
        let first_challenge = wait_for_active(&broker).await;

        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.request("vendor-a", "second login").await })
        };

        // The second flow must not raise a challenge while the first holds
        // the login mutex.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.active().unwrap().id, first_challenge.id);

        assert!(broker.submit(&first_challenge.id, "111111"));
        assert_eq!(first.await.unwrap().unwrap(), "111111");

        let second_challenge = wait_for_active(&broker).await;
        assert_ne!(second_challenge.id, first_challenge.id);
        assert!(broker.submit(&second_challenge.id, "222222"));
        assert_eq!(second.await.unwrap().unwrap(), "222222");
    }
}
