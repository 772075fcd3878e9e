//! Tag filters and scored results.

use super::{MemoryRecord, TagCollection};
use std::collections::BTreeMap;

/// Required tag-equality constraints, combined with logical AND.
///
/// An empty filter matches every record. A pair `(key, value)` matches when
/// `value` is one of the values recorded under `key` (set membership), so
/// multi-valued tags such as several chat participants filter correctly.
///
/// # Example
///
/// ```rust
/// use vectormem::MemoryFilter;
///
/// let filter = MemoryFilter::new()
///     .by_tag("chatId", "c1")
///     .by_tag("memory", "DocumentMemory");
/// assert_eq!(filter.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFilter {
    pairs: Vec<(String, String)>,
}

impl MemoryFilter {
    /// Creates an empty filter (matches all).
    #[must_use]
    pub const fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Adds a tag-equality constraint.
    #[must_use]
    pub fn by_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Returns the constraints in insertion order.
    #[must_use]
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Returns true if the filter is empty (matches all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true if `tags` satisfies every constraint.
    #[must_use]
    pub fn matches(&self, tags: &TagCollection) -> bool {
        self.pairs.iter().all(|(k, v)| tags.contains(k, v))
    }

    /// Groups required values by key, deduplicated.
    ///
    /// This is the shape of a JSON containment document:
    /// `{"chatId": ["c1"], "memory": ["m"]}`.
    #[must_use]
    pub fn grouped(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (k, v) in &self.pairs {
            let values = grouped.entry(k.as_str()).or_default();
            if !values.contains(&v.as_str()) {
                values.push(v.as_str());
            }
        }
        grouped
    }
}

/// A record returned by nearest-neighbour search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    /// The matched record.
    pub record: MemoryRecord,
    /// Cosine similarity (`1 - cosine_distance`); 1.0 means identical direction.
    pub score: f64,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagCollection {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert!(MemoryFilter::new().matches(&TagCollection::new()));
        assert!(MemoryFilter::new().matches(&tags(&[("chatId", "c1")])));
    }

    #[test]
    fn test_filter_is_and_of_pairs() {
        let filter = MemoryFilter::new()
            .by_tag("chatId", "c1")
            .by_tag("memory", "m");
        assert!(filter.matches(&tags(&[("chatId", "c1"), ("memory", "m")])));
        assert!(!filter.matches(&tags(&[("chatId", "c1")])));
        assert!(!filter.matches(&tags(&[("chatId", "c2"), ("memory", "m")])));
    }

    #[test]
    fn test_filter_uses_set_membership() {
        let record_tags = tags(&[("user", "alice"), ("user", "bob")]);
        assert!(MemoryFilter::new().by_tag("user", "bob").matches(&record_tags));
        assert!(
            MemoryFilter::new()
                .by_tag("user", "alice")
                .by_tag("user", "bob")
                .matches(&record_tags)
        );
        assert!(!MemoryFilter::new().by_tag("user", "carol").matches(&record_tags));
    }

    #[test]
    fn test_grouped_merges_keys() {
        let filter = MemoryFilter::new()
            .by_tag("user", "alice")
            .by_tag("chatId", "c1")
            .by_tag("user", "bob")
            .by_tag("user", "alice");
        let grouped = filter.grouped();
        assert_eq!(grouped["user"], vec!["alice", "bob"]);
        assert_eq!(grouped["chatId"], vec!["c1"]);
    }
}
