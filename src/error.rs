//! Relay error types.
//!
//! [`RelayError`] is the central error taxonomy. Session-local failures
//! ([`ProtocolError`], [`ValidationError`]) are handled inside the owning
//! session; the HTTP surface maps every variant to a status code and a
//! structured JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::domain::SubscriptionKey;
use crate::store::StoreError;

/// Structured JSON error response body.
///
/// ```json
/// {
///   "error": {
///     "code": 5001,
///     "message": "shutdown in progress"
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Malformed or unrecognized client frame. Terminates the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(String),

    /// Frame is JSON but not a non-empty array led by a string label.
    #[error("frame must be an array starting with a string label")]
    NotAnArray,

    /// Label is not one of the known message kinds.
    #[error("unrecognized message label: {0}")]
    UnknownLabel(String),

    /// Known label with the wrong number or type of elements.
    #[error("malformed {label} message: {reason}")]
    Malformed {
        /// Message label.
        label: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    Binary,
}

/// Event failed acceptance checks. Rejects the submission only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A field does not have the required encoding or length.
    #[error("{field} must be {expected}")]
    Field {
        /// Offending field name.
        field: &'static str,
        /// Required shape.
        expected: &'static str,
    },

    /// `id` is not the digest of the event's contents.
    #[error("event id does not match its contents")]
    IdMismatch,

    /// A tag array is empty.
    #[error("tags must not be empty arrays")]
    EmptyTag,

    /// The validator could not run.
    #[error("could not verify event: {0}")]
    Unverifiable(String),
}

/// Relay-wide error taxonomy.
///
/// # Error Code Ranges
///
/// | Range     | Category          | HTTP Status                 |
/// |-----------|-------------------|-----------------------------|
/// | 1000–1999 | Client input      | 400 Bad Request             |
/// | 3000–3999 | Storage/listener  | 500 / 503                   |
/// | 5000–5999 | Lifecycle         | 503 Service Unavailable     |
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed or unrecognized frame.
    #[error("invalid: {0}")]
    Protocol(#[from] ProtocolError),

    /// Event rejected by the validator.
    #[error("invalid: {0}")]
    Validation(#[from] ValidationError),

    /// Event store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A subscriber's delivery channel was full; the event was dropped.
    #[error("delivery channel full for subscription {0}")]
    DeliveryOverflow(SubscriptionKey),

    /// The change-notification feed was interrupted.
    #[error("change listener error: {0}")]
    Listener(String),

    /// The relay is draining and refuses new work.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Writing to a client transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::Protocol(_) => 1001,
            Self::Validation(_) => 1002,
            Self::Storage(_) => 3001,
            Self::DeliveryOverflow(_) => 3002,
            Self::Listener(_) => 3003,
            Self::Transport(_) => 3004,
            Self::ShutdownInProgress => 5001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Protocol(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::DeliveryOverflow(_) | Self::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Listener(_) | Self::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
