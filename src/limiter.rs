//! Bounded-concurrency limiter
//!
//! Admits at most `limit` units of leaf work at a time; excess callers
//! queue FIFO. The bound can be raised or lowered while work is in
//! flight: the new value applies to subsequent admissions without
//! disturbing anything already running.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

/// Sizing policy for a limiter driven by egress pool health.
///
/// Produces `clamp(floor, min(healthy_units × multiplier, cap))`. An
/// explicit per-source override always wins over this policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSizePolicy {
    /// Lower bound, applied last
    pub floor: usize,
    /// Admitted slots per healthy egress unit
    pub multiplier: usize,
    /// Upper bound before the floor is applied
    pub cap: usize,
}

impl Default for AutoSizePolicy {
    fn default() -> Self {
        Self {
            floor: 1,
            multiplier: 2,
            cap: 8,
        }
    }
}

impl AutoSizePolicy {
    /// Compute the limit for the observed number of healthy egress units
    pub fn size_for(&self, healthy_units: usize) -> usize {
        self.floor.max((healthy_units * self.multiplier).min(self.cap))
    }
}

struct LimiterInner {
    limit: usize,
    active: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

/// FIFO admission gate over async work
pub struct Limiter {
    inner: Mutex<LimiterInner>,
    notify: Notify,
}

impl Limiter {
    /// Create a limiter admitting at most `limit` concurrent tasks
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(LimiterInner {
                limit: limit.max(1),
                active: 0,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Run a task under the limiter.
    ///
    /// The slot is returned when the future completes, errors, or the
    /// caller is cancelled; one task's failure resolves only that task's
    /// waiter.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }

    /// Wait for a slot. Admission order is strictly FIFO.
    pub async fn acquire(&self) -> LimiterPermit<'_> {
        let ticket = {
            let mut inner = self.inner.lock().unwrap();
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.waiters.push_back(ticket);
            ticket
        };

        // A caller cancelled while queued must not wedge the FIFO head.
        let mut queue_guard = QueueGuard {
            limiter: self,
            ticket,
            armed: true,
        };

        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if inner.active < inner.limit && inner.waiters.front() == Some(&ticket) {
                    inner.waiters.pop_front();
                    inner.active += 1;
                    let wake_next = inner.active < inner.limit && !inner.waiters.is_empty();
                    drop(inner);

                    queue_guard.armed = false;
                    // A bumped limit can open several slots at once; each
                    // admission passes the wakeup along.
                    if wake_next {
                        self.notify.notify_waiters();
                    }
                    return LimiterPermit { limiter: self };
                }
            }

            notified.await;
        }
    }

    /// Change the bound. Takes effect on subsequent admissions only.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.limit == limit {
                return;
            }
            debug!(old = inner.limit, new = limit, "Limiter bound changed");
            inner.limit = limit;
        }
        // Raising the bound may admit queued waiters immediately.
        self.notify.notify_waiters();
    }

    /// Current admission bound
    pub fn limit(&self) -> usize {
        self.inner.lock().unwrap().limit
    }

    /// Number of tasks currently admitted
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap().active
    }

    /// Number of callers waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    fn release(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.active = inner.active.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }
}

/// RAII admission slot; returns the slot on drop
pub struct LimiterPermit<'a> {
    limiter: &'a Limiter,
}

impl Drop for LimiterPermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Removes a still-queued ticket when its waiter is dropped
struct QueueGuard<'a> {
    limiter: &'a Limiter,
    ticket: u64,
    armed: bool,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.limiter.inner.lock().unwrap();
            if let Some(pos) = inner.waiters.iter().position(|&t| t == self.ticket) {
                inner.waiters.remove(pos);
            }
        }
        // The departed ticket may have been the head.
        self.limiter.notify.notify_waiters();
    }
}
