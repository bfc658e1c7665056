//! Domain layer: events, filters, subscription identity, the subscriber
//! registry, and event acceptance.
//!
//! Nothing in this module touches the network or the database; it is the
//! shared vocabulary of the store, the change listener, and the sessions.

pub mod event;
pub mod filter;
pub mod registry;
pub mod subscription;
pub mod validation;

pub use event::Event;
pub use filter::{Filter, FilterGroup};
pub use registry::{BroadcastReport, SubscriberRegistry};
pub use subscription::{ConnectionId, SubscriptionId, SubscriptionKey};
pub use validation::{AcceptAll, DigestValidator, EventValidator};
