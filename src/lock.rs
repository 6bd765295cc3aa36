//! Singleton lock management
//!
//! At most one listingd worker may be active per deployment. The marker
//! is a plain-text file holding the owner's process id; acquisition is an
//! atomic create-if-absent so two racing processes can never both believe
//! they won. A marker left behind by a dead or wedged owner is reclaimed.
//!
//! Limitation: the lock is filesystem-local. All redundant workers must
//! share one filesystem; this does not coordinate across hosts.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

/// Default staleness threshold for an unresponsive owner's marker
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// Exclusive, staleness-aware singleton marker
#[derive(Debug, Clone)]
pub struct LockManager {
    /// Path to the marker file
    path: PathBuf,
    /// Age beyond which a live owner's marker is considered abandoned
    stale_after: Duration,
}

impl LockManager {
    /// Create a lock manager for the given marker path
    pub fn new(path: PathBuf, stale_after: Duration) -> Self {
        Self { path, stale_after }
    }

    /// Attempt to become the active worker.
    ///
    /// Returns `Ok(None)` when another live owner holds the marker; that
    /// is standby mode, not an error. A marker whose pid is dead or whose
    /// age exceeds the staleness threshold is deleted and acquisition is
    /// retried.
    pub fn acquire(&self) -> Result<Option<LockGuard>> {
        // Two passes: initial attempt, then one more after a stale reclaim.
        for attempt in 0..2 {
            match self.try_create() {
                Ok(true) => {
                    let pid = std::process::id();
                    info!(pid, path = %self.path.display(), "Acquired singleton lock");
                    return Ok(Some(LockGuard {
                        path: self.path.clone(),
                        pid,
                        released: false,
                    }));
                }
                Ok(false) => {
                    if attempt == 0 && self.reclaim_if_stale()? {
                        continue;
                    }
                    debug!(path = %self.path.display(), "Lock held elsewhere, entering standby");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Read the pid recorded in the marker file, if any
    pub fn owner_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.path).ok()?;
        contents.trim().parse().ok()
    }

    /// Whether the marker is currently held by a live, non-stale owner
    pub fn is_held(&self) -> bool {
        self.path.exists() && !self.stale().unwrap_or(true)
    }

    /// Delete the marker if its owner is dead or it has gone stale.
    ///
    /// Returns true when a reclaim happened.
    pub fn reclaim_if_stale(&self) -> Result<bool> {
        if !self.stale()? {
            return Ok(false);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                warn!(path = %self.path.display(), "Reclaimed stale singleton lock");
                Ok(true)
            }
            // Someone else reclaimed it first; acquisition will re-race.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e).context("Failed to remove stale lock file"),
        }
    }

    /// Atomic create-if-absent of the marker file.
    ///
    /// Returns true if this process created it. Check-then-create would
    /// let two processes both win; `create_new` delegates exclusivity to
    /// the filesystem.
    fn try_create(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }

        match fs::OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id()).context("Failed to write pid to lock file")?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).context("Failed to create lock file"),
        }
    }

    /// Whether the current marker is stale: unreadable, owned by a dead
    /// pid, or older than the staleness threshold.
    fn stale(&self) -> Result<bool> {
        let Some(pid) = self.owner_pid() else {
            // Missing file is handled by the create race; garbage content
            // means a half-written or corrupt marker.
            return Ok(self.path.exists());
        };

        if !is_process_alive(pid) {
            debug!(pid, "Lock owner is not running");
            return Ok(true);
        }

        let age = fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok());

        match age {
            Some(age) if age > self.stale_after => {
                debug!(pid, ?age, "Lock owner is alive but marker exceeded staleness threshold");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Releases the marker on drop, but only while still owned by this pid
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl LockGuard {
    /// The marker path this guard protects
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Explicitly release the lock
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // A reclaimed-and-reacquired marker belongs to someone else now;
        // deleting it would break their exclusivity.
        let owned = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|pid| pid == self.pid)
            .unwrap_or(false);

        if !owned {
            warn!(path = %self.path.display(), "Lock file no longer owned by this process, leaving it");
            return;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Released singleton lock"),
            Err(e) => warn!(error = %e, path = %self.path.display(), "Failed to remove lock file"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Check whether a process with the given pid exists.
///
/// Signal 0 probes for existence without affecting the target.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, stale_after: Duration) -> LockManager {
        LockManager::new(dir.path().join("worker.lock"), stale_after)
    }

    /// Pid of a process that has already exited
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, DEFAULT_STALE_AFTER);

        let guard = mgr.acquire().unwrap().expect("first acquire should win");
        assert_eq!(mgr.owner_pid(), Some(std::process::id()));
        assert!(mgr.is_held());

        guard.release();
        assert_eq!(mgr.owner_pid(), None);
    }

    #[test]
    fn test_second_acquire_enters_standby() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, DEFAULT_STALE_AFTER);

        let _guard = mgr.acquire().unwrap().expect("first acquire should win");
        assert!(mgr.acquire().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_acquires_yield_one_guard() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.lock");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let guard = LockManager::new(path, DEFAULT_STALE_AFTER).acquire().unwrap();
                    let won = guard.is_some();
                    // Hold the guard until every thread has attempted, so a
                    // winner's release cannot hand the lock to a late thread.
                    barrier.wait();
                    won
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, DEFAULT_STALE_AFTER);

        fs::write(dir.path().join("worker.lock"), dead_pid().to_string()).unwrap();

        let guard = mgr.acquire().unwrap();
        assert!(guard.is_some(), "dead owner's marker should be reclaimed");
        assert_eq!(mgr.owner_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_live_but_stale_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, Duration::from_millis(10));

        // Our own pid is alive, so only the age check can reclaim this.
        fs::write(dir.path().join("worker.lock"), std::process::id().to_string()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let guard = mgr.acquire().unwrap();
        assert!(guard.is_some(), "aged marker should be reclaimed even with a live pid");
    }

    #[test]
    fn test_garbage_marker_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, DEFAULT_STALE_AFTER);

        fs::write(dir.path().join("worker.lock"), "not-a-pid").unwrap();

        assert!(mgr.acquire().unwrap().is_some());
    }

    #[test]
    fn test_guard_leaves_foreign_marker_alone() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir, DEFAULT_STALE_AFTER);
        let path = dir.path().join("worker.lock");

        let guard = mgr.acquire().unwrap().unwrap();

        // Simulate a reclaim-and-reacquire by another process.
        fs::write(&path, "424242").unwrap();
        drop(guard);

        assert!(path.exists(), "guard must not delete a marker it no longer owns");
        assert_eq!(mgr.owner_pid(), Some(424242));
    }
}
