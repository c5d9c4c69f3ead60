//! Refetch hints for external list caches
//!
//! Collaborators that keep their own request/session lists subscribe here and
//! refetch when told to. Delivery is at-least-once; a lagging subscriber may
//! miss hints but the next one covers it since refetching is idempotent.

use tokio::sync::broadcast;
use tracing::trace;

/// Which external list went stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Requests,
    Sessions,
}

#[derive(Debug, Clone)]
pub struct SessionCacheInvalidator {
    tx: broadcast::Sender<CacheKind>,
}

impl SessionCacheInvalidator {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, kind: CacheKind) {
        trace!(?kind, "Invalidating external cache");
        // No subscribers is fine
        let _ = self.tx.send(kind);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheKind> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_without_subscribers() {
        let invalidator = SessionCacheInvalidator::new(4);
        invalidator.notify(CacheKind::Requests);
    }

    #[test]
    fn test_broadcast_to_all_subscribers() {
        let invalidator = SessionCacheInvalidator::new(4);
        let mut a = invalidator.subscribe();
        let mut b = invalidator.subscribe();

        invalidator.notify(CacheKind::Sessions);

        assert_eq!(a.try_recv().unwrap(), CacheKind::Sessions);
        assert_eq!(b.try_recv().unwrap(), CacheKind::Sessions);
        assert!(a.try_recv().is_err());
    }
}
