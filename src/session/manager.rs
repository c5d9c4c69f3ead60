//! Public façade of the dApp bridge
//!
//! A [`Manager`] is scoped to one [`Identity`] for its whole lifetime. UI
//! collaborators subscribe to the active request and the connection status,
//! and call [`Manager::resolve`] when the user answers.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::invalidator::{CacheKind, SessionCacheInvalidator};
use crate::session::normalizer::{CanonicalEvent, EventNormalizer};
use crate::session::registry::RequestRegistry;
use crate::session::types::{Identity, PendingRequest, RequestSettled, Resolution, SessionRecord};
use crate::stream::relay::RelayTransportFactory;
use crate::stream::supervisor::{ConnectionRecord, ConnectionSupervisor, FrameSink};
use crate::stream::transport::{RawFrame, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Handle for a callback hook; the callback stops when this is dropped
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Everything the frame sink needs, shared with the supervisor task
struct Inner {
    normalizer: EventNormalizer,
    registry: Arc<RequestRegistry>,
    invalidator: SessionCacheInvalidator,
    /// Latest announcement per topic (or dApp URL when the relay sends no topic)
    sessions: DashMap<String, SessionRecord>,
    sessions_tx: broadcast::Sender<SessionRecord>,
}

impl Inner {
    fn handle_frame(&self, frame: RawFrame) {
        match self.normalizer.normalize(&frame, Utc::now()) {
            Some(CanonicalEvent::RequestAdmitted(request)) => {
                self.registry.admit(request);
            }
            Some(CanonicalEvent::ConnectionAnnounced(session)) => self.announce(session),
            None => {}
        }
    }

    fn announce(&self, session: SessionRecord) {
        info!(
            topic = session.topic.as_deref().unwrap_or("-"),
            dapp = session.dapp_name.as_deref().unwrap_or("-"),
            "dApp connected"
        );

        if let Some(key) = session.topic.clone().or_else(|| session.dapp_url.clone()) {
            if self.sessions.insert(key.clone(), session.clone()).is_some() {
                debug!(key = %key, "Superseded session announcement");
            }
        }

        let _ = self.sessions_tx.send(session);
        self.invalidator.notify(CacheKind::Sessions);
    }
}

/// dApp request/session manager for one user
pub struct Manager {
    identity: Identity,
    inner: Arc<Inner>,
    supervisor: ConnectionSupervisor,
    lifecycle: Mutex<Lifecycle>,
}

impl Manager {
    /// Create a manager with an injected transport factory
    pub fn new(identity: Identity, config: Config, factory: Arc<dyn TransportFactory>) -> Self {
        let buffer = config.requests.event_buffer;
        let invalidator = SessionCacheInvalidator::new(buffer);
        let registry = RequestRegistry::new(invalidator.clone(), buffer);
        let (sessions_tx, _) = broadcast::channel(buffer.max(1));

        let inner = Arc::new(Inner {
            normalizer: EventNormalizer::new(
                identity.clone(),
                config.requests.accept_unscoped_connections,
            ),
            registry,
            invalidator,
            sessions: DashMap::new(),
            sessions_tx,
        });

        Self {
            identity,
            inner,
            supervisor: ConnectionSupervisor::new(config.relay, factory),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Create a manager talking to the configured relay
    pub fn with_relay(identity: Identity, config: Config) -> Result<Self> {
        let factory = RelayTransportFactory::new(config.relay.clone())?;
        Ok(Self::new(identity, config, Arc::new(factory)))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Connect to the relay and start surfacing requests.
    ///
    /// Allowed again after [`Manager::stop`]; state from the previous run is gone.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if *lifecycle == Lifecycle::Running {
            return Err(Error::AlreadyRunning);
        }

        let inner = Arc::clone(&self.inner);
        let sink: FrameSink = Arc::new(move |frame| inner.handle_frame(frame));
        self.supervisor.start(self.identity.clone(), sink)?;

        *lifecycle = Lifecycle::Running;
        info!(user_id = %self.identity, "dApp bridge started");
        Ok(())
    }

    /// Disconnect and disarm every timer. Idempotent; once this returns no
    /// further notifications are produced.
    pub async fn stop(&self) {
        let was = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        self.supervisor.stop().await;
        let dropped = self.inner.registry.clear();
        self.inner.sessions.clear();

        if was == Lifecycle::Running {
            info!(user_id = %self.identity, dropped, "dApp bridge stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .map(|l| *l == Lifecycle::Running)
            .unwrap_or(false)
    }

    /// The request currently surfaced to the user, if any
    pub fn active_request(&self) -> Option<PendingRequest> {
        self.inner.registry.active()
    }

    pub fn connection_status(&self) -> ConnectionRecord {
        self.supervisor.status()
    }

    /// Answer a request.
    ///
    /// [`Error::RequestNotFound`] means it already expired (or never existed);
    /// callers should treat that as a benign race.
    pub fn resolve(&self, id: &str, resolution: Resolution) -> Result<PendingRequest> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.inner.registry.resolve(id, resolution)
    }

    /// Latest session announcement per dApp
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.pending_count()
    }

    pub fn armed_timers(&self) -> usize {
        self.inner.registry.armed_timers()
    }

    /// Run `callback` whenever the active request changes. Rapid changes may
    /// coalesce; the callback always sees the latest value.
    pub fn on_active_request_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(Option<&PendingRequest>) + Send + 'static,
    {
        let mut rx = self.inner.registry.subscribe_active();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                callback(current.as_ref());
            }
        });
        Subscription { handle }
    }

    /// Run `callback` whenever the connection record changes
    pub fn on_connection_status_change<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(&ConnectionRecord) + Send + 'static,
    {
        let mut rx = self.supervisor.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                callback(&current);
            }
        });
        Subscription { handle }
    }

    pub fn subscribe_active_request(&self) -> watch::Receiver<Option<PendingRequest>> {
        self.inner.registry.subscribe_active()
    }

    pub fn subscribe_connection_status(&self) -> watch::Receiver<ConnectionRecord> {
        self.supervisor.subscribe()
    }

    /// Every request outcome (resolved or expired)
    pub fn subscribe_settled(&self) -> broadcast::Receiver<RequestSettled> {
        self.inner.registry.subscribe_settled()
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<CacheKind> {
        self.inner.invalidator.subscribe()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionRecord> {
        self.inner.sessions_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::RequestOutcome;
    use crate::stream::testing::ScriptedRelay;
    use crate::stream::{ConnectionStatus, TransportKind};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    const USER: &str = "user-1";

    fn ws_only_config() -> Config {
        let mut config = Config::default();
        config.relay.transports = vec![TransportKind::WebSocket];
        config.relay.reconnect_delay_ms = 50;
        config
    }

    fn manager(relay: &ScriptedRelay) -> Manager {
        Manager::new(Identity::new(USER).unwrap(), ws_only_config(), relay.factory())
    }

    fn request_frame(user_id: &str, id: &str, ttl_ms: i64) -> RawFrame {
        let expires_at = Utc::now() + ChronoDuration::milliseconds(ttl_ms);
        RawFrame::new(
            "newRequest",
            json!({
                "message": "dApp request",
                "userId": user_id,
                "data": {
                    "id": id,
                    "method": "eth_sendTransaction",
                    "params": [{"to": "0x0000000000000000000000000000000000000001"}],
                    "chainId": 8453,
                    "dappName": "Base Swap",
                    "dappUrl": "https://swap.example",
                    "expiresAt": expires_at.to_rfc3339()
                }
            }),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(item) => out.push(item),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_into_active_request() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);

        manager.start().unwrap();
        channel.push(request_frame(USER, "req-1", 60_000));
        settle().await;

        let active = manager.active_request().unwrap();
        assert_eq!(active.id, "req-1");
        assert_eq!(active.chain_id.as_deref(), Some("8453"));
        assert!(manager.connection_status().is_connected());
        assert_eq!(relay.identities(), vec![Identity::new(USER).unwrap()]);

        let resolved = manager.resolve("req-1", Resolution::Approved).unwrap();
        assert_eq!(resolved.method, "eth_sendTransaction");
        assert!(manager.active_request().is_none());

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_filtering() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);
        let mut invalidations = manager.subscribe_invalidations();

        manager.start().unwrap();
        channel.push(request_frame("someone-else", "foreign", 60_000));
        settle().await;

        assert!(manager.active_request().is_none());
        assert_eq!(manager.pending_count(), 0);
        assert!(drain(&mut invalidations).is_empty());

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_redelivery() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);

        manager.start().unwrap();
        let frame = request_frame(USER, "dup", 30_000);
        channel.push_batch(vec![frame.clone(), frame]);
        settle().await;

        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.armed_timers(), 1);

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_and_expiry_through_relay() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);
        let mut settled = manager.subscribe_settled();

        manager.start().unwrap();
        channel.push(request_frame(USER, "first", 10_000));
        channel.push(request_frame(USER, "second", 2_000));
        settle().await;
        assert_eq!(manager.active_request().unwrap().id, "second");

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(manager.active_request().is_none());
        assert_eq!(manager.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(8_000)).await;
        assert_eq!(manager.pending_count(), 0);

        let outcomes: Vec<_> = drain(&mut settled)
            .into_iter()
            .map(|s| (s.request.id, s.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ("second".to_string(), RequestOutcome::Expired),
                ("first".to_string(), RequestOutcome::Expired),
            ]
        );

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_teardown() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);
        let mut settled = manager.subscribe_settled();
        let mut invalidations = manager.subscribe_invalidations();

        manager.start().unwrap();
        channel.push(request_frame(USER, "a", 5_000));
        channel.push(request_frame(USER, "b", 9_000));
        settle().await;
        assert_eq!(manager.armed_timers(), 2);
        drain(&mut invalidations);

        manager.stop().await;
        assert_eq!(manager.armed_timers(), 0);
        assert_eq!(manager.connection_status().status, ConnectionStatus::Disconnected);
        assert!(channel.is_closed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(drain(&mut settled).is_empty());
        assert!(drain(&mut invalidations).is_empty());
        assert!(manager.active_request().is_none());

        // Idempotent
        manager.stop().await;
        assert_eq!(manager.connection_status().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_contract() {
        let relay = ScriptedRelay::new();
        let first = relay.accept(TransportKind::WebSocket);
        let second = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);

        assert!(matches!(manager.resolve("x", Resolution::Approved), Err(Error::NotRunning)));

        manager.start().unwrap();
        first.push(RawFrame::new(
            "newConnection",
            json!({"userId": USER, "data": {"topic": "t1", "dappName": "Aave"}}),
        ));
        first.push(request_frame(USER, "before-stop", 60_000));
        settle().await;
        assert_eq!(manager.sessions().len(), 1);
        assert!(matches!(manager.start(), Err(Error::AlreadyRunning)));
        let err = manager.resolve("x", Resolution::Approved).unwrap_err();
        assert!(err.is_benign_race());

        manager.stop().await;
        let err = manager.resolve("x", Resolution::Approved).unwrap_err();
        assert!(err.is_programmer_error());

        // Restart picks up a fresh channel with no state from the last run
        manager.start().unwrap();
        assert!(manager.sessions().is_empty());
        assert_eq!(manager.pending_count(), 0);
        second.push(request_frame(USER, "after-restart", 60_000));
        settle().await;
        assert_eq!(manager.active_request().unwrap().id, "after-restart");

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_announcements() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);
        let mut invalidations = manager.subscribe_invalidations();
        let mut sessions = manager.subscribe_sessions();

        manager.start().unwrap();
        channel.push(RawFrame::new(
            "new_connection",
            json!({"message": "connected", "data": {"topic": "t1", "dappName": "Aave", "connectedAt": "2026-05-01T10:00:00Z"}}),
        ));
        channel.push(RawFrame::new(
            "NEW_CONNECTION",
            json!({"userId": USER, "data": {"topic": "t1", "dappName": "Aave v3", "connectedAt": "2026-05-01T11:00:00Z"}}),
        ));
        channel.push(RawFrame::new(
            "newConnection",
            json!({"userId": "someone-else", "data": {"topic": "t2"}}),
        ));
        settle().await;

        let known = manager.sessions();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].dapp_name.as_deref(), Some("Aave v3"));
        assert_eq!(drain(&mut sessions).len(), 2);
        assert_eq!(
            drain(&mut invalidations),
            vec![CacheKind::Sessions, CacheKind::Sessions]
        );

        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_hooks() {
        let relay = ScriptedRelay::new();
        let channel = relay.accept(TransportKind::WebSocket);
        let manager = manager(&relay);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = Arc::clone(&seen);
        let _requests = manager.on_active_request_change(move |request| {
            seen_hook
                .lock()
                .unwrap()
                .push(request.map(|r| r.id.clone()));
        });

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_hook = Arc::clone(&statuses);
        let _status = manager.on_connection_status_change(move |record| {
            statuses_hook.lock().unwrap().push(record.status);
        });

        manager.start().unwrap();
        settle().await;
        channel.push(request_frame(USER, "hooked", 60_000));
        settle().await;
        manager.resolve("hooked", Resolution::Rejected).unwrap();
        settle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("hooked".to_string()), None]
        );
        assert_eq!(statuses.lock().unwrap().last(), Some(&ConnectionStatus::Connected));

        manager.stop().await;
        settle().await;
        assert_eq!(
            statuses.lock().unwrap().last(),
            Some(&ConnectionStatus::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_managers() {
        let relay_a = ScriptedRelay::new();
        let relay_b = ScriptedRelay::new();
        let channel_a = relay_a.accept(TransportKind::WebSocket);
        let _channel_b = relay_b.accept(TransportKind::WebSocket);

        let a = manager(&relay_a);
        let b = Manager::new(Identity::new("user-2").unwrap(), ws_only_config(), relay_b.factory());

        a.start().unwrap();
        b.start().unwrap();
        channel_a.push(request_frame(USER, "only-a", 60_000));
        settle().await;

        assert!(a.active_request().is_some());
        assert!(b.active_request().is_none());

        a.stop().await;
        b.stop().await;
    }
}
