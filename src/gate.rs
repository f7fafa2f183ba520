use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time;
use tracing::{debug, warn};

use crate::config::clamp_permits;

/// Bounded counting gate that caps how many round trips may be outstanding.
///
/// Every successful [`Gate::wait`] takes one permit that must be handed back with exactly one
/// [`Gate::release`]. Releasing more than was taken is capped at the maximum instead of growing
/// the pool.
#[derive(Debug)]
pub struct Gate {
    semaphore: Semaphore,
    max: usize,
    // Serializes the check-then-add in `release`. Acquisitions only ever lower the count, so the
    // check cannot be invalidated upward while this is held.
    release_lock: Mutex<()>,
}

impl Gate {
    /// Creates a gate with `requested` permits clamped into
    /// `[Config::MIN_PERMITS, Config::MAX_PERMITS]`.
    pub fn new(requested: usize) -> Gate {
        let max = clamp_permits(requested);
        Gate {
            semaphore: Semaphore::new(max),
            max,
            release_lock: Mutex::new(()),
        }
    }

    /// Waits for a permit. `None` waits indefinitely. Returns whether a permit was taken; running
    /// out of time is not an error, the caller decides what it means.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let acquired = match timeout {
            Some(timeout) => match time::timeout(timeout, self.semaphore.acquire()).await {
                Ok(acquired) => acquired,
                Err(_) => {
                    debug!(?timeout, "timed out waiting for a gate permit");
                    return false;
                }
            },
            None => self.semaphore.acquire().await,
        };

        match acquired {
            Ok(permit) => {
                // The count is managed by hand through `release`.
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn try_wait(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn release(&self) {
        let _guard = self
            .release_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if self.semaphore.available_permits() < self.max {
            self.semaphore.add_permits(1);
        } else {
            warn!(max = self.max, "gate released more often than acquired");
        }
    }

    /// Like [`Gate::wait`], but hands back a guard that releases the permit when dropped.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<GatePermit<'_>> {
        if self.wait(timeout).await {
            Some(GatePermit { gate: self })
        } else {
            None
        }
    }

    pub fn available_count(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use_count(&self) -> usize {
        self.max - self.available_count()
    }

    pub fn max_count(&self) -> usize {
        self.max
    }
}

#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a Gate,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
