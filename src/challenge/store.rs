//! File-backed durable challenge store
//!
//! One JSON file per challenge id under a shared directory. A UI in
//! another process answers by writing the code into the entry; the broker
//! polls for it.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Challenge, ChallengeError, ChallengeStore};

#[derive(Debug, Serialize, Deserialize)]
struct StoredChallenge {
    challenge: Challenge,
    code: Option<String>,
}

/// Challenge store shared between processes through the filesystem
#[derive(Debug, Clone)]
pub struct FileChallengeStore {
    dir: PathBuf,
}

impl FileChallengeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_entry(&self, id: &str) -> Result<Option<StoredChallenge>, ChallengeError> {
        match fs::read_to_string(self.entry_path(id)) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| ChallengeError::Store(format!("corrupt entry {id}: {e}"))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChallengeError::Store(e.to_string())),
        }
    }

    fn write_entry(&self, entry: &StoredChallenge) -> Result<(), ChallengeError> {
        fs::create_dir_all(&self.dir).map_err(|e| ChallengeError::Store(e.to_string()))?;
        let json = serde_json::to_string_pretty(entry).map_err(|e| ChallengeError::Store(e.to_string()))?;
        fs::write(self.entry_path(&entry.challenge.id), json).map_err(|e| ChallengeError::Store(e.to_string()))
    }

    fn remove_entry(&self, id: &str) -> Result<(), ChallengeError> {
        match fs::remove_file(self.entry_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChallengeError::Store(e.to_string())),
        }
    }

    /// Provider-side half of the store: record the code for a pending
    /// entry. Called by the UI process that collected the code.
    pub fn resolve(&self, id: &str, code: &str) -> Result<bool, ChallengeError> {
        match self.read_entry(id)? {
            Some(mut entry) => {
                entry.code = Some(code.to_string());
                self.write_entry(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pending entries, oldest first (for a UI listing unanswered challenges)
    pub fn pending(&self) -> Result<Vec<Challenge>, ChallengeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ChallengeError::Store(e.to_string())),
        };

        let mut pending = Vec::new();
        for entry in entries.flatten() {
            let Ok(contents) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if let Ok(stored) = serde_json::from_str::<StoredChallenge>(&contents) {
                if stored.code.is_none() {
                    pending.push(stored.challenge);
                }
            }
        }
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[async_trait]
impl ChallengeStore for FileChallengeStore {
    async fn create(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        debug!(id = %challenge.id, service = %challenge.service, "Publishing challenge to store");
        self.write_entry(&StoredChallenge {
            challenge: challenge.clone(),
            code: None,
        })
    }

    async fn poll(&self, id: &str) -> Result<Option<String>, ChallengeError> {
        Ok(self.read_entry(id)?.and_then(|entry| entry.code))
    }

    async fn consume(&self, id: &str) -> Result<(), ChallengeError> {
        debug!(id, "Consuming resolved challenge entry");
        self.remove_entry(id)
    }

    async fn cancel(&self, id: &str) -> Result<(), ChallengeError> {
        debug!(id, "Cancelling challenge entry");
        self.remove_entry(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FileChallengeStore {
        FileChallengeStore::new(dir.path().join("challenges"))
    }

    #[tokio::test]
    async fn test_create_poll_resolve_consume() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let challenge = Challenge::new("vendor-a", "Enter the emailed code", Duration::from_secs(120));

        store.create(&challenge).await.unwrap();
        assert_eq!(store.poll(&challenge.id).await.unwrap(), None);

        assert!(store.resolve(&challenge.id, "483921").unwrap());
        assert_eq!(store.poll(&challenge.id).await.unwrap(), Some("483921".to_string()));

        store.consume(&challenge.id).await.unwrap();
        assert_eq!(store.poll(&challenge.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_clears_pending_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let challenge = Challenge::new("vendor-a", "code?", Duration::from_secs(120));

        store.create(&challenge).await.unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);

        store.cancel(&challenge.id).await.unwrap();
        assert!(store.pending().unwrap().is_empty());

        // Resolving after cancellation is a no-op, not an error.
        assert!(!store.resolve(&challenge.id, "000000").unwrap());
    }

    #[tokio::test]
    async fn test_pending_lists_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = Challenge::new("vendor-a", "first", Duration::from_secs(120));
        let second = Challenge::new("vendor-b", "second", Duration::from_secs(120));
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
    }
}
