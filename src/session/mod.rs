//! Session module - dApp request/session state
//!
//! Pipeline: relay frame → [`EventNormalizer`] → [`RequestRegistry`] →
//! [`ExpirationScheduler`], with [`SessionCacheInvalidator`] and the
//! [`Manager`] façade fanning changes out to collaborators.

pub mod invalidator;
pub mod manager;
pub mod normalizer;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use invalidator::{CacheKind, SessionCacheInvalidator};
pub use manager::{Manager, Subscription};
pub use normalizer::{CanonicalEvent, EventNormalizer};
pub use registry::RequestRegistry;
pub use scheduler::ExpirationScheduler;
pub use types::{
    Identity, PendingRequest, RequestOutcome, RequestSettled, Resolution, SessionRecord,
};
