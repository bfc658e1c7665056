//! NIP-01 subscription filters and their in-memory matcher.
//!
//! A [`Filter`] is a conjunction over the fields it sets; a [`FilterGroup`]
//! is a disjunction of filters. [`FilterGroup::matches`] is the evaluator
//! used for live fan-out and must select exactly what the compiled store
//! predicate (see [`crate::store::predicate`]) selects for history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Event;
use super::event::{signed_timestamp, single_letter};

/// A conjunctive predicate over event fields.
///
/// Empty lists are treated the same as absent ones: they impose no
/// restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    /// Permitted event ids (exact match).
    pub ids: Vec<String>,
    /// Permitted author pubkeys (exact match).
    pub authors: Vec<String>,
    /// Permitted kinds.
    pub kinds: Vec<u16>,
    /// Tag constraints keyed by single-letter label.
    pub tags: BTreeMap<char, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Row cap for the historical query. Ignored for live matching.
    pub limit: Option<u64>,
}

impl Filter {
    /// Creates an empty filter, which matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to the given event ids.
    #[must_use]
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts to the given authors.
    #[must_use]
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts to the given kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Adds a tag constraint for `label`.
    #[must_use]
    pub fn tag(mut self, label: char, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags
            .insert(label, values.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the inclusive lower time bound.
    #[must_use]
    pub const fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Sets the inclusive upper time bound.
    #[must_use]
    pub const fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Sets the historical row cap.
    #[must_use]
    pub const fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Returns `true` if the event satisfies every constraint present in
    /// this filter. `limit` plays no part in matching.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        // Compared in the signed column domain, saturating the same way the
        // store does.
        let created_at = event.created_at_i64();
        if self.since.is_some_and(|since| created_at < signed_timestamp(since)) {
            return false;
        }
        if self.until.is_some_and(|until| created_at > signed_timestamp(until)) {
            return false;
        }
        self.tags.iter().all(|(label, values)| {
            values.is_empty()
                || event
                    .indexable_tags()
                    .any(|(l, v)| l == *label && values.iter().any(|want| want == v))
        })
    }
}

/// Ordered disjunction of [`Filter`]s, as carried by a `REQ` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterGroup(Vec<Filter>);

impl FilterGroup {
    /// Wraps a list of filters.
    #[must_use]
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// Returns `true` if at least one member filter matches the event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.0.iter().any(|filter| filter.matches(event))
    }

    /// Returns the member filters in order.
    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.0
    }

    /// Returns the number of member filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the group has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Filter> for FilterGroup {
    fn from(filter: Filter) -> Self {
        Self(vec![filter])
    }
}

/// Wire shape of a filter: fixed keys plus arbitrary `#x` tag keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<RawFilter> for Filter {
    type Error = String;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let mut tags = BTreeMap::new();
        for (key, value) in raw.rest {
            // Unknown non-tag keys (e.g. NIP-50 `search`) are ignored.
            let Some(label) = key.strip_prefix('#').and_then(single_letter) else {
                continue;
            };
            let values: Vec<String> = serde_json::from_value(value)
                .map_err(|e| format!("tag filter {key} must be a list of strings: {e}"))?;
            tags.insert(label, values);
        }
        Ok(Self {
            ids: raw.ids.unwrap_or_default(),
            authors: raw.authors.unwrap_or_default(),
            kinds: raw.kinds.unwrap_or_default(),
            tags,
            since: raw.since,
            until: raw.until,
            limit: raw.limit,
        })
    }
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
            (!v.is_empty()).then_some(v)
        }
        Self {
            ids: non_empty(filter.ids),
            authors: non_empty(filter.authors),
            kinds: non_empty(filter.kinds),
            since: filter.since,
            until: filter.until,
            limit: filter.limit,
            rest: filter
                .tags
                .into_iter()
                .map(|(label, values)| (format!("#{label}"), serde_json::json!(values)))
                .collect(),
        }
    }
}
