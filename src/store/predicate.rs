//! Filter compiler: [`FilterGroup`] → [`Predicate`].
//!
//! A predicate is a disjunction of branches, one per filter, each a
//! conjunction of typed [`Term`]s plus an optional row cap. In memory a
//! branch is evaluated by the filter it was compiled from
//! ([`Filter::matches`]), so live fan-out and the memory store share one
//! evaluator. For PostgreSQL each term renders to a column, an operator and
//! a bound value through [`sqlx::QueryBuilder`]; client-supplied values
//! travel exclusively as bound parameters.

use sqlx::{Postgres, QueryBuilder};

use crate::domain::event::signed_timestamp;
use crate::domain::{Event, Filter, FilterGroup};

/// One conjunct of a compiled filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// `id` is one of the values.
    IdIn(Vec<String>),
    /// `pubkey` is one of the values.
    AuthorIn(Vec<String>),
    /// `kind` is one of the values.
    KindIn(Vec<u16>),
    /// The event has a tag labelled `label` whose value is one of `values`.
    Tag {
        /// Single-letter tag label.
        label: char,
        /// Permitted values.
        values: Vec<String>,
    },
    /// `created_at >= since`.
    Since(u64),
    /// `created_at <= until`.
    Until(u64),
}

/// SQL comparison a [`Term`] renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `column = ANY($n)`.
    Any,
    /// `column && $n` (array overlap).
    Overlaps,
    /// `column >= $n`.
    AtLeast,
    /// `column <= $n`.
    AtMost,
}

/// Value bound to a [`Term`]'s placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    /// `text[]`.
    Text(Vec<String>),
    /// `integer[]`.
    Int(Vec<i32>),
    /// `bigint`.
    Time(i64),
}

impl Term {
    /// Column, operator and bound value this term renders to.
    #[must_use]
    pub fn sql(&self) -> (&'static str, Op, Bound) {
        match self {
            Self::IdIn(ids) => ("id", Op::Any, Bound::Text(ids.clone())),
            Self::AuthorIn(authors) => ("pubkey", Op::Any, Bound::Text(authors.clone())),
            Self::KindIn(kinds) => (
                "kind",
                Op::Any,
                Bound::Int(kinds.iter().map(|k| i32::from(*k)).collect()),
            ),
            Self::Tag { label, values } => {
                let (column, bound) = tag_column(*label, values);
                (column, Op::Overlaps, Bound::Text(bound))
            }
            Self::Since(since) => (
                "created_at",
                Op::AtLeast,
                Bound::Time(signed_timestamp(*since)),
            ),
            Self::Until(until) => (
                "created_at",
                Op::AtMost,
                Bound::Time(signed_timestamp(*until)),
            ),
        }
    }

    fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        let (column, op, bound) = self.sql();
        qb.push(column);
        qb.push(match op {
            Op::Any => " = ANY(",
            Op::Overlaps => " && ",
            Op::AtLeast => " >= ",
            Op::AtMost => " <= ",
        });
        match bound {
            Bound::Text(values) => qb.push_bind(values),
            Bound::Int(values) => qb.push_bind(values),
            Bound::Time(ts) => qb.push_bind(ts),
        };
        if op == Op::Any {
            qb.push(")");
        }
    }
}

/// One compiled filter: a conjunction of terms and an optional row cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branch {
    filter: Filter,
    terms: Vec<Term>,
    limit: Option<u64>,
}

impl Branch {
    /// Returns the conjuncts. An empty list selects every event.
    #[must_use]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Returns the row cap, if any.
    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// `true` if the source filter matches the event.
    #[must_use]
    pub fn admits(&self, event: &Event) -> bool {
        self.filter.matches(event)
    }

    fn push_select(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push("(SELECT id, created_at, raw FROM event WHERE ");
        if self.terms.is_empty() {
            qb.push("TRUE");
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                qb.push(" AND ");
            }
            term.push_sql(qb);
        }
        qb.push(" ORDER BY created_at DESC, id");
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        qb.push(")");
    }
}

/// Compiled, safely parameterized form of a [`FilterGroup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    branches: Vec<Branch>,
}

impl Predicate {
    /// Returns the branches, one per source filter.
    #[must_use]
    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// `true` if any branch admits the event, ignoring row caps.
    #[must_use]
    pub fn admits(&self, event: &Event) -> bool {
        self.branches.iter().any(|branch| branch.admits(event))
    }

    /// Builds the full historical query: each branch selected newest-first
    /// under its own cap, then the union ordered newest-first.
    ///
    /// Returns `None` for a predicate without branches, which selects
    /// nothing.
    #[must_use]
    pub fn to_query(&self) -> Option<QueryBuilder<'static, Postgres>> {
        if self.branches.is_empty() {
            return None;
        }
        let mut qb = QueryBuilder::new("SELECT raw FROM (");
        for (i, branch) in self.branches.iter().enumerate() {
            if i > 0 {
                qb.push(" UNION ");
            }
            branch.push_select(&mut qb);
        }
        qb.push(") AS matched ORDER BY created_at DESC, id");
        Some(qb)
    }
}

/// Compiles a filter group into a predicate.
///
/// Client limits are clamped to `max_limit`. Empty set constraints impose
/// no restriction, matching [`Filter::matches`].
#[must_use]
pub fn compile(group: &FilterGroup, max_limit: u64) -> Predicate {
    Predicate {
        branches: group
            .filters()
            .iter()
            .map(|filter| compile_filter(filter, max_limit))
            .collect(),
    }
}

fn compile_filter(filter: &Filter, max_limit: u64) -> Branch {
    let mut terms = Vec::new();
    if !filter.ids.is_empty() {
        terms.push(Term::IdIn(filter.ids.clone()));
    }
    if !filter.authors.is_empty() {
        terms.push(Term::AuthorIn(filter.authors.clone()));
    }
    if !filter.kinds.is_empty() {
        terms.push(Term::KindIn(filter.kinds.clone()));
    }
    for (label, values) in &filter.tags {
        if !values.is_empty() {
            terms.push(Term::Tag {
                label: *label,
                values: values.clone(),
            });
        }
    }
    if let Some(since) = filter.since {
        terms.push(Term::Since(since));
    }
    if let Some(until) = filter.until {
        terms.push(Term::Until(until));
    }
    Branch {
        filter: filter.clone(),
        terms,
        limit: filter.limit.map(|limit| limit.min(max_limit)),
    }
}

/// Tag arrays written alongside a stored event.
///
/// `e` and `p` have dedicated projections; every other single-letter label
/// lives in `tagvalues` as `"<label>:<value>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagProjection {
    /// Values of `e` tags.
    pub etags: Vec<String>,
    /// Values of `p` tags.
    pub ptags: Vec<String>,
    /// Every other single-letter tag, keyed by [`tag_value_key`].
    pub tagvalues: Vec<String>,
}

impl TagProjection {
    /// Projects the event's indexable tags.
    #[must_use]
    pub fn of(event: &Event) -> Self {
        let mut projection = Self::default();
        for (label, value) in event.indexable_tags() {
            match label {
                'e' => projection.etags.push(value.to_string()),
                'p' => projection.ptags.push(value.to_string()),
                other => projection.tagvalues.push(tag_value_key(other, value)),
            }
        }
        projection
    }
}

/// Maps a tag constraint onto its projection column and bound array value.
fn tag_column(label: char, values: &[String]) -> (&'static str, Vec<String>) {
    match label {
        'e' => ("etags", values.to_vec()),
        'p' => ("ptags", values.to_vec()),
        other => (
            "tagvalues",
            values.iter().map(|v| tag_value_key(other, v)).collect(),
        ),
    }
}

/// Encodes a generic tag for the `tagvalues` projection.
#[must_use]
pub fn tag_value_key(label: char, value: &str) -> String {
    format!("{label}:{value}")
}
