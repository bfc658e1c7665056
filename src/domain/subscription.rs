//! Subscription identity.
//!
//! Subscription ids are chosen by clients and are only unique within one
//! connection. The registry is process-wide, so it keys entries by
//! [`SubscriptionKey`], pairing the client id with the owning
//! [`ConnectionId`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest subscription id a client may use.
pub const MAX_SUBSCRIPTION_ID_LEN: usize = 64;

/// Server-assigned identifier of one WebSocket connection.
///
/// Wraps a UUID v4 generated when the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Creates a new random `ConnectionId`.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen subscription id, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Validates and wraps a client subscription id.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the id is empty or longer
    /// than [`MAX_SUBSCRIPTION_ID_LEN`] characters.
    pub fn new(id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() {
            return Err("subscription id must not be empty".to_string());
        }
        if id.chars().count() > MAX_SUBSCRIPTION_ID_LEN {
            return Err(format!(
                "subscription id longer than {MAX_SUBSCRIPTION_ID_LEN} characters"
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as sent by the client.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry key: a subscription id scoped to its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Owning connection.
    pub connection: ConnectionId,
    /// Client-chosen id.
    pub subscription: SubscriptionId,
}

impl SubscriptionKey {
    /// Pairs a subscription id with its connection.
    #[must_use]
    pub const fn new(connection: ConnectionId, subscription: SubscriptionId) -> Self {
        Self {
            connection,
            subscription,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.subscription)
    }
}
