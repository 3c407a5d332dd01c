//! Local admission control for provider calls.
//!
//! Two independent mechanisms:
//!
//! - a process-wide concurrency limit (FIFO semaphore), so at most
//!   `max_concurrency` provider calls are in flight;
//! - a per-key sliding-window rate limit, so one bucket (author, assignment)
//!   cannot monopolize the provider.
//!
//! State is in-process only; several worker processes each enforce their own
//! limits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Bucket used when a job carries no group key.
pub const DEFAULT_BUCKET: &str = "global";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    pub max_concurrency: usize,
    /// Events allowed per key within `window`.
    pub rate_limit: usize,
    pub window: Duration,
    /// Tracked-key count above which idle keys are swept.
    pub max_tracked_keys: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            rate_limit: 30,
            window: Duration::from_secs(60),
            max_tracked_keys: 5_000,
        }
    }
}

/// Concurrency gate plus per-key rate limiter. Share it behind an `Arc`.
#[derive(Debug)]
pub struct Guard {
    config: GuardConfig,
    permits: Arc<Semaphore>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

/// One admitted slot. Released on [`GuardPermit::release`] or drop,
/// whichever comes first; a second release is a no-op.
#[derive(Debug)]
pub struct GuardPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl GuardPermit {
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

impl Guard {
    pub fn new(config: GuardConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            permits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Wait for a concurrency slot. Waiters are admitted in arrival order.
    pub async fn acquire(&self) -> GuardPermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("guard semaphore is never closed");
        GuardPermit {
            permit: Some(permit),
        }
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrency
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    /// Record one event for `key` if its trailing window has room.
    ///
    /// Returns `false` without recording when the key is at its limit.
    pub fn try_consume(&self, key: Option<&str>) -> bool {
        let key = key.filter(|k| !k.is_empty()).unwrap_or(DEFAULT_BUCKET);
        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window);

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() > self.config.max_tracked_keys {
            let before = windows.len();
            windows.retain(|_, events| {
                prune(events, cutoff);
                !events.is_empty()
            });
            debug!(before, after = windows.len(), "swept idle rate-limit keys");
        }

        let events = windows.entry(key.to_string()).or_default();
        prune(events, cutoff);

        if events.len() < self.config.rate_limit {
            events.push_back(now);
            true
        } else {
            if events.is_empty() {
                windows.remove(key);
            }
            false
        }
    }

    /// Number of keys with rate-limit state.
    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Drop events at or before `cutoff`.
fn prune(events: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else { return };
    while events.front().is_some_and(|t| *t <= cutoff) {
        events.pop_front();
    }
}
