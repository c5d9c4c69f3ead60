//! One-shot expiration timers keyed by request id
//!
//! Each armed timer is a tokio task racing its deadline against a
//! [`CancellationToken`]. Before a timer runs its callback it checks-and-clears
//! its own entry under the scheduler lock, so a timer that was cancelled (or
//! replaced by a newer generation for the same id) never fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identifies one arming of a timer; ids can be re-armed after they settle
pub type TimerGeneration = u64;

struct ArmedTimer {
    generation: TimerGeneration,
    token: CancellationToken,
}

/// Arena of cancellable deferred actions
pub struct ExpirationScheduler {
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    next_generation: AtomicU64,
}

impl ExpirationScheduler {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Schedule `on_fire` to run once after `delay`.
    ///
    /// Re-arming an id cancels its previous timer. Must be called from within a
    /// tokio runtime.
    pub fn arm<F>(&self, id: &str, delay: Duration, on_fire: F) -> TimerGeneration
    where
        F: FnOnce(TimerGeneration) + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            let previous = timers.insert(
                id.to_string(),
                ArmedTimer {
                    generation,
                    token: token.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
            }
        }

        debug!(request_id = %id, generation, delay_ms = delay.as_millis() as u64, "Armed expiration timer");

        let timers = Arc::clone(&self.timers);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(request_id = %id, generation, "Expiration timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let still_armed = {
                        let mut timers = timers.lock().unwrap_or_else(|e| e.into_inner());
                        match timers.get(&id) {
                            Some(t) if t.generation == generation && !t.token.is_cancelled() => {
                                timers.remove(&id);
                                true
                            }
                            _ => false,
                        }
                    };
                    if still_armed {
                        trace!(request_id = %id, generation, "Expiration timer fired");
                        on_fire(generation);
                    }
                }
            }
        });

        generation
    }

    /// Cancel the timer for `id`. Returns false if none was pending.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(timer) => {
                timer.token.cancel();
                debug!(request_id = %id, generation = timer.generation, "Cancelled expiration timer");
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding timer, returning how many were pending
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ArmedTimer> = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in &drained {
            timer.token.cancel();
        }
        if !drained.is_empty() {
            debug!("Cancelled {} expiration timer(s)", drained.len());
        }
        drained.len()
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn armed_count(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for ExpirationScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExpirationScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
