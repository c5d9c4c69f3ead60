//! Pending request registry
//!
//! Single source of truth for which dApp request is surfaced to the user.
//! Only the most recently admitted request is active; an earlier request that
//! gets superseded stays tracked (it can still be resolved and still expires)
//! but is not surfaced again.
//!
//! `resolve` cancels the request's timer before touching any state, and timer
//! firings go through `expire`, which re-checks the timer generation under the
//! same lock. Whichever runs first wins, and a resolve always beats a timer
//! that has not yet executed.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::session::invalidator::{CacheKind, SessionCacheInvalidator};
use crate::session::scheduler::{ExpirationScheduler, TimerGeneration};
use crate::session::types::{PendingRequest, RequestOutcome, RequestSettled, Resolution};

struct TrackedRequest {
    request: PendingRequest,
    generation: TimerGeneration,
}

#[derive(Default)]
struct RegistryState {
    pending: HashMap<String, TrackedRequest>,
    active: Option<String>,
}

pub struct RequestRegistry {
    state: Mutex<RegistryState>,
    scheduler: ExpirationScheduler,
    invalidator: SessionCacheInvalidator,
    active_tx: watch::Sender<Option<PendingRequest>>,
    settled_tx: broadcast::Sender<RequestSettled>,
}

impl RequestRegistry {
    pub fn new(invalidator: SessionCacheInvalidator, event_buffer: usize) -> Arc<Self> {
        let (active_tx, _) = watch::channel(None);
        let (settled_tx, _) = broadcast::channel(event_buffer.max(1));

        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            scheduler: ExpirationScheduler::new(),
            invalidator,
            active_tx,
            settled_tx,
        })
    }

    /// Track a request and surface it as the active one.
    ///
    /// Returns false for a redelivered id that is still pending.
    pub fn admit(self: &Arc<Self>, request: PendingRequest) -> bool {
        {
            let mut state = self.lock();
            if state.pending.contains_key(&request.id) {
                debug!(request_id = %request.id, "Ignoring redelivered request");
                return false;
            }

            let delay = request.time_to_expiry(Utc::now());
            let registry: Weak<Self> = Arc::downgrade(self);
            let timer_id = request.id.clone();
            let generation = self.scheduler.arm(&request.id, delay, move |generation| {
                if let Some(registry) = registry.upgrade() {
                    registry.expire(&timer_id, generation);
                }
            });

            if let Some(previous) = state.active.replace(request.id.clone()) {
                debug!(request_id = %request.id, superseded = %previous, "Superseding active request");
            }

            info!(
                request_id = %request.id,
                method = %request.method,
                dapp = %request.dapp_name,
                expires_in_ms = delay.as_millis() as u64,
                "Admitted dApp request"
            );

            self.active_tx.send_replace(Some(request.clone()));
            state.pending.insert(
                request.id.clone(),
                TrackedRequest {
                    request,
                    generation,
                },
            );
        }

        self.invalidator.notify(CacheKind::Requests);
        true
    }

    /// Settle a request with the user's answer.
    ///
    /// Fails with [`Error::RequestNotFound`] when the request already expired or
    /// was never admitted.
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<PendingRequest> {
        let request = {
            let mut state = self.lock();
            if !state.pending.contains_key(id) {
                return Err(Error::RequestNotFound(id.to_string()));
            }

            self.scheduler.cancel(id);
            let tracked = state
                .pending
                .remove(id)
                .ok_or_else(|| Error::RequestNotFound(id.to_string()))?;
            self.clear_active_if(&mut state, id);

            info!(request_id = %id, %resolution, "Resolved dApp request");
            let _ = self.settled_tx.send(RequestSettled {
                request: tracked.request.clone(),
                outcome: RequestOutcome::Resolved(resolution),
            });
            tracked.request
        };

        self.invalidator.notify(CacheKind::Requests);
        Ok(request)
    }

    /// Timer callback. A stale generation means the request was resolved (or
    /// re-admitted) after this timer was armed, so nothing happens.
    fn expire(&self, id: &str, generation: TimerGeneration) -> bool {
        {
            let mut state = self.lock();
            let current = state
                .pending
                .get(id)
                .map_or(false, |tracked| tracked.generation == generation);
            let tracked = if current { state.pending.remove(id) } else { None };
            let Some(tracked) = tracked else {
                debug!(request_id = %id, generation, "Ignoring stale expiration");
                return false;
            };
            self.clear_active_if(&mut state, id);

            info!(request_id = %id, "dApp request expired");
            let _ = self.settled_tx.send(RequestSettled {
                request: tracked.request,
                outcome: RequestOutcome::Expired,
            });
        }

        self.invalidator.notify(CacheKind::Requests);
        true
    }

    /// Drop every tracked request and timer without reporting outcomes
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let cancelled = self.scheduler.cancel_all();
        let dropped = state.pending.len();
        state.pending.clear();
        if state.active.take().is_some() {
            self.active_tx.send_replace(None);
        }
        if dropped > 0 {
            debug!(dropped, cancelled, "Cleared request registry");
        }
        dropped
    }

    pub fn active(&self) -> Option<PendingRequest> {
        let state = self.lock();
        state
            .active
            .as_ref()
            .and_then(|id| state.pending.get(id))
            .map(|tracked| tracked.request.clone())
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn armed_timers(&self) -> usize {
        self.scheduler.armed_count()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<PendingRequest>> {
        self.active_tx.subscribe()
    }

    pub fn subscribe_settled(&self) -> broadcast::Receiver<RequestSettled> {
        self.settled_tx.subscribe()
    }

    fn clear_active_if(&self, state: &mut RegistryState, id: &str) {
        if state.active.as_deref() == Some(id) {
            state.active = None;
            self.active_tx.send_replace(None);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
