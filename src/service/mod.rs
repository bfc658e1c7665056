//! Service layer: long-lived background tasks.

pub mod change_listener;

pub use change_listener::{ChangeListener, ListenerExit, LiveStatus};
