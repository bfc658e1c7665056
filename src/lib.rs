//! # nostr-relay
//!
//! NOSTR relay with PostgreSQL storage and live subscription fan-out.
//!
//! Clients publish events and open subscriptions over WebSocket (NIP-01).
//! A subscription first replays matching stored events, then streams new
//! ones as the store reports them.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket, HTTP)
//!     │
//!     ├── Relay handler + Sessions (ws/)
//!     ├── System endpoints (api/)
//!     │
//!     ├── SubscriberRegistry (domain/) ◄── ChangeListener (service/)
//!     │                                          ▲
//!     ├── Filter compiler (store/predicate)      │ change feed
//!     │                                          │
//!     └── EventStore: PostgreSQL (LISTEN/NOTIFY) or in-memory
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod server;
pub mod service;
pub mod store;
pub mod ws;
