//! WebSocket layer: protocol frames, sessions, and the upgrade handler.
//!
//! Clients connect to `/` and speak NIP-01: `EVENT` to publish, `REQ` to
//! replay stored events and then stream live ones, `CLOSE` to stop.

pub mod handler;
pub mod messages;
pub mod outbound;
pub mod session;

pub use messages::{ClientMessage, RelayMessage};
pub use outbound::Outbound;
pub use session::{Session, SessionState};
