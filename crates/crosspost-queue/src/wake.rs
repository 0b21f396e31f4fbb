//! Cancellable one-shot timer that kicks the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::Clock;

struct Armed {
    deadline: DateTime<Utc>,
    generation: u64,
    handle: JoinHandle<()>,
}

/// At most one pending wake-up, which only ever moves earlier.
///
/// A timer that fires clears its own slot before running its callback, so
/// a later `arm` always takes effect.
pub struct WakeTimer {
    clock: Arc<dyn Clock>,
    slot: Arc<Mutex<Option<Armed>>>,
    generation: AtomicU64,
}

impl WakeTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm for `deadline`, replacing a later pending wake-up.
    ///
    /// Returns false if an earlier or equal wake-up is already pending.
    /// A deadline in the past fires on the next tick.
    pub fn arm<F>(&self, deadline: DateTime<Utc>, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(armed) = slot.as_ref()
            && armed.deadline <= deadline
        {
            return false;
        }
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let delay = (deadline - self.clock.now()).to_std().unwrap_or_default();
        let fire_at = tokio::time::Instant::now() + delay;
        let own_slot = Arc::clone(&self.slot);

        // The spawned task cannot observe the slot until this guard drops.
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            {
                let mut slot = lock(&own_slot);
                match slot.as_ref() {
                    Some(armed) if armed.generation == generation => *slot = None,
                    _ => return,
                }
            }
            on_fire();
        });

        debug!(%deadline, delay_ms = delay.as_millis() as u64, "wake timer armed");
        *slot = Some(Armed {
            deadline,
            generation,
            handle,
        });
        true
    }

    /// Drop the pending wake-up, if any.
    pub fn cancel(&self) {
        if let Some(armed) = lock(&self.slot).take() {
            armed.handle.abort();
            debug!(deadline = %armed.deadline, "wake timer cancelled");
        }
    }

    /// Deadline of the pending wake-up.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        lock(&self.slot).as_ref().map(|armed| armed.deadline)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for WakeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(slot: &Mutex<Option<Armed>>) -> MutexGuard<'_, Option<Armed>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
