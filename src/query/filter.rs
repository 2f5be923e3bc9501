//! Property comparators for query filtering.
//!
//! Filters are applied as post-filters after the primary retrieval
//! (index lookup or type scan): the seed index narrows the candidate
//! set, and every candidate is then checked against the full filter map.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A comparator applied to one property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Comparator {
    /// Exact match. For list-valued properties, any element matching
    /// counts.
    Equals(Value),
    /// Membership in a set of values.
    In(Vec<Value>),
    /// Containment: list properties contain the value, string properties
    /// contain the substring.
    Contains(Value),
    /// Case-insensitive word match against the string content.
    Fulltext(String),
    /// Inclusive range `[from, to]` by value order.
    Range {
        /// Lower bound (inclusive).
        from: Value,
        /// Upper bound (inclusive).
        to: Value,
    },
}

impl Comparator {
    /// Returns true if a property value passes this comparator.
    ///
    /// An absent property (`None`) never matches.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Comparator::Equals(expected) => match value {
                Value::List(items) => items.iter().any(|item| item == expected),
                other => other == expected,
            },
            Comparator::In(set) => match value {
                Value::List(items) => items.iter().any(|item| set.contains(item)),
                other => set.contains(other),
            },
            Comparator::Contains(needle) => match value {
                Value::List(items) => items.iter().any(|item| item == needle),
                Value::String(haystack) => needle
                    .as_str()
                    .is_some_and(|needle| haystack.contains(needle)),
                _ => false,
            },
            Comparator::Fulltext(words) => {
                let Some(haystack) = value.as_str() else {
                    return false;
                };
                let haystack = haystack.to_lowercase();
                words
                    .split_whitespace()
                    .all(|word| haystack.contains(&word.to_lowercase()))
            }
            Comparator::Range { from, to } => {
                value.total_cmp(from) != std::cmp::Ordering::Less
                    && value.total_cmp(to) != std::cmp::Ordering::Greater
            }
        }
    }

    /// True if an ordered secondary index can produce the candidate set
    /// for this comparator directly.
    pub fn index_assisted(&self) -> bool {
        matches!(
            self,
            Comparator::Equals(_) | Comparator::In(_) | Comparator::Range { .. }
        )
    }
}
