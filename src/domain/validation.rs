//! Event acceptance checks.
//!
//! Cryptographic signature verification belongs to whichever
//! [`EventValidator`] is plugged in. The default [`DigestValidator`] checks
//! field encodings and that `id` is the digest of the event contents, which
//! is enough to keep malformed records out of the store.

use super::Event;
use super::event::MAX_TIMESTAMP;
use crate::error::ValidationError;

/// Decides whether a submitted event may be stored.
pub trait EventValidator: Send + Sync + 'static {
    /// Validates a submitted event.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing why the event is rejected.
    fn validate(&self, event: &Event) -> Result<(), ValidationError>;
}

/// Shape and id-digest validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestValidator;

impl EventValidator for DigestValidator {
    fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        check_hex("id", &event.id, 64, "64 lowercase hex characters")?;
        check_hex("pubkey", &event.pubkey, 64, "64 lowercase hex characters")?;
        check_hex("sig", &event.sig, 128, "128 lowercase hex characters")?;
        if event.created_at > MAX_TIMESTAMP {
            return Err(ValidationError::Field {
                field: "created_at",
                expected: "at most 9223372036854775807",
            });
        }
        if event.tags.iter().any(Vec::is_empty) {
            return Err(ValidationError::EmptyTag);
        }
        let computed = event
            .compute_id()
            .map_err(|e| ValidationError::Unverifiable(e.to_string()))?;
        if computed != event.id {
            return Err(ValidationError::IdMismatch);
        }
        Ok(())
    }
}

/// Accepts every event. Useful when an upstream component has already
/// validated submissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventValidator for AcceptAll {
    fn validate(&self, _event: &Event) -> Result<(), ValidationError> {
        Ok(())
    }
}

fn check_hex(
    field: &'static str,
    value: &str,
    len: usize,
    expected: &'static str,
) -> Result<(), ValidationError> {
    let ok = value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ValidationError::Field { field, expected })
    }
}
