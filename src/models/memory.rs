//! Memory records and their tag collections.

use super::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arbitrary JSON document stored alongside a record.
///
/// `serde_json::Map` is ordered, so the encoding is reproducible byte for byte.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Multi-valued tags: each key maps to a set of string values.
///
/// Serialized as `{"chatId": ["c1"], "memory": ["DocumentMemory"]}`, which is
/// the JSON layout persisted in the Postgres `tags` column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCollection(BTreeMap<String, Vec<String>>);

impl TagCollection {
    /// Creates an empty tag collection.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Adds a value under `key`. Duplicate values are ignored.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let values = self.0.entry(key.into()).or_default();
        let value = value.into();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Returns the values recorded for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Returns true if `value` is one of the values recorded for `key`.
    #[must_use]
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0
            .get(key)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }

    /// Iterates over `(key, values)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Iterates over flattened `(key, value)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Returns true if there are no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagCollection {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut tags = Self::new();
        for (k, v) in iter {
            tags.add(k, v);
        }
        tags
    }
}

/// The stored unit: one chunk with its embedding, tags and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier within an index.
    pub id: String,
    /// Arbitrary document content.
    #[serde(default)]
    pub payload: Payload,
    /// Tags used for equality filtering.
    #[serde(default)]
    pub tags: TagCollection,
    /// Embedding; omitted on reads unless explicitly requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Embedding>,
    /// Last upsert time, stamped by the facade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// Creates an empty record with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Payload::new(),
            tags: TagCollection::new(),
            vector: None,
            timestamp: None,
        }
    }

    /// Adds a payload entry.
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Adds a tag value.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.add(key, value);
        self
    }

    /// Sets the embedding.
    #[must_use]
    pub fn with_vector(mut self, vector: impl Into<Embedding>) -> Self {
        self.vector = Some(vector.into());
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Drops the embedding unless `include_vector` is set.
    #[must_use]
    pub fn project(mut self, include_vector: bool) -> Self {
        if !include_vector {
            self.vector = None;
        }
        self
    }
}
