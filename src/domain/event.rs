//! Signed NOSTR event record.
//!
//! An [`Event`] is immutable once accepted: the relay stores it, replays it
//! and fans it out, but never rewrites any field.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Core NOSTR event as submitted by clients and served back to them.
///
/// ```json
/// {
///   "id": "4376c65d2f232afbe9b882a35baa4f6fe8667c4e684749af565f981833ed6a65",
///   "pubkey": "6e468422dfb74a5738702a8823b9b28168abab8655faacb6853cd0ee15deee93",
///   "created_at": 1673347337,
///   "kind": 1,
///   "tags": [["e", "3da979448d9ba263864c4d6f14984c423a3838364ec255f03c7904b1ae77f206"]],
///   "content": "hello",
///   "sig": "908a15e46fb4d8675bab026fc230a0e3542bfade63da02d542fb78b2a8513fcd..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-derived identifier (lowercase hex SHA-256).
    pub id: String,
    /// Author public key (lowercase hex).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Kind number classifying the event semantics.
    pub kind: u16,
    /// Ordered tag arrays; by convention `tag[0]` is a single-letter label.
    pub tags: Vec<Vec<String>>,
    /// Opaque content body.
    pub content: String,
    /// Schnorr signature over `id` (lowercase hex).
    pub sig: String,
}

impl Event {
    /// Returns the values of all tags labelled `label`, in tag order.
    ///
    /// A tag contributes its second element; tags with only a label are
    /// skipped.
    pub fn tag_values<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [name, value, ..] if name == label => Some(value.as_str()),
            _ => None,
        })
    }

    /// Returns `(label, value)` pairs for every tag whose label is a single
    /// character. These are the only tags that filters can address.
    pub fn indexable_tags(&self) -> impl Iterator<Item = (char, &str)> + '_ {
        self.tags.iter().filter_map(|tag| match tag.as_slice() {
            [name, value, ..] => single_letter(name).map(|label| (label, value.as_str())),
            _ => None,
        })
    }

    /// Recomputes the event id from the other fields.
    ///
    /// The digest covers `[0, pubkey, created_at, kind, tags, content]`
    /// serialized as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the commitment cannot be encoded.
    pub fn compute_id(&self) -> Result<String, serde_json::Error> {
        let commitment = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let bytes = serde_json::to_vec(&commitment)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Returns `created_at` as a signed database timestamp, saturating at
    /// `i64::MAX`.
    #[must_use]
    pub fn created_at_i64(&self) -> i64 {
        signed_timestamp(self.created_at)
    }
}

/// Largest `created_at` the store can represent.
pub const MAX_TIMESTAMP: u64 = i64::MAX.unsigned_abs();

/// Converts a protocol timestamp to the signed column type, saturating at
/// [`MAX_TIMESTAMP`]. Stored values and filter bounds both go through here.
#[must_use]
pub fn signed_timestamp(ts: u64) -> i64 {
    i64::try_from(ts).unwrap_or(i64::MAX)
}

/// Returns the label as a `char` when it is exactly one character long.
#[must_use]
pub fn single_letter(label: &str) -> Option<char> {
    let mut chars = label.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}
