//! In-memory vector database.
//!
//! A volatile, explicitly owned store. Each instance is independent: there is
//! no process-wide singleton, so two `InMemoryVectorDb` values never share data.
//! Search is brute-force O(n) cosine similarity, which is fine for tests and
//! small single-process deployments.

use crate::models::{Embedding, IndexName, MemoryFilter, MemoryRecord, ScoredRecord};
use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

/// One logical index: fixed dimensionality plus its records.
#[derive(Debug)]
struct MemoryIndex {
    vector_size: usize,
    records: HashMap<String, MemoryRecord>,
}

/// Volatile vector database kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorDb {
    indexes: RwLock<HashMap<String, MemoryIndex>>,
}

fn lock_poisoned(operation: &str) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: "Lock poisoned".to_string(),
    }
}

fn not_found(index: &IndexName) -> Error {
    Error::IndexNotFound {
        index: index.to_string(),
    }
}

/// Newest first; records without a timestamp sort last. Ties fall back to id.
fn newest_first(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id))
}

impl InMemoryVectorDb {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in `index`, or `None` if it does not exist.
    #[must_use]
    pub fn count(&self, index: &IndexName) -> Option<usize> {
        self.indexes
            .read()
            .ok()?
            .get(index.as_str())
            .map(|idx| idx.records.len())
    }
}

#[async_trait]
impl VectorDb for InMemoryVectorDb {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| lock_poisoned("memory_create_index"))?;
        let idx = indexes
            .entry(index.to_string())
            .or_insert_with(|| MemoryIndex {
                vector_size,
                records: HashMap::new(),
            });
        if idx.vector_size != vector_size {
            return Err(Error::DimensionMismatch {
                expected: idx.vector_size,
                actual: vector_size,
            });
        }
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| lock_poisoned("memory_list_indexes"))?;
        let mut names: Vec<String> = indexes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &IndexName) -> Result<()> {
        self.indexes
            .write()
            .map_err(|_| lock_poisoned("memory_delete_index"))?
            .remove(index.as_str());
        Ok(())
    }

    async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| lock_poisoned("memory_upsert"))?;
        let idx = indexes.get_mut(index.as_str()).ok_or_else(|| not_found(index))?;

        if let Some(vector) = &record.vector {
            vector.ensure_dimensions(idx.vector_size)?;
        }

        idx.records.insert(record.id.clone(), record.clone());
        Ok(record.id.clone())
    }

    async fn read(
        &self,
        index: &IndexName,
        id: &str,
        include_vector: bool,
    ) -> Result<Option<MemoryRecord>> {
        let indexes = self
            .indexes
            .read()
            .map_err(|_| lock_poisoned("memory_read"))?;
        let idx = indexes.get(index.as_str()).ok_or_else(|| not_found(index))?;
        Ok(idx
            .records
            .get(id)
            .map(|r| r.clone().project(include_vector)))
    }

    async fn read_batch(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<RecordStream> {
        let found: Vec<MemoryRecord> = {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| lock_poisoned("memory_read_batch"))?;
            let idx = indexes.get(index.as_str()).ok_or_else(|| not_found(index))?;
            ids.iter()
                .filter_map(|id| idx.records.get(id))
                .map(|r| r.clone().project(include_vector))
                .collect()
        };
        Ok(Box::pin(stream::iter(found.into_iter().map(Ok::<_, Error>))))
    }

    async fn delete(&self, index: &IndexName, id: &str) -> Result<bool> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| lock_poisoned("memory_delete"))?;
        let idx = indexes
            .get_mut(index.as_str())
            .ok_or_else(|| not_found(index))?;
        Ok(idx.records.remove(id).is_some())
    }

    async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64> {
        let mut indexes = self
            .indexes
            .write()
            .map_err(|_| lock_poisoned("memory_delete_batch"))?;
        let idx = indexes
            .get_mut(index.as_str())
            .ok_or_else(|| not_found(index))?;
        let removed = ids
            .iter()
            .filter(|id| idx.records.remove(id.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn list(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<RecordStream> {
        let mut matching: Vec<MemoryRecord> = {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| lock_poisoned("memory_list"))?;
            let idx = indexes.get(index.as_str()).ok_or_else(|| not_found(index))?;
            idx.records
                .values()
                .filter(|r| filter.matches(&r.tags))
                .cloned()
                .collect()
        };

        matching.sort_by(newest_first);
        if let Some(limit) = limit {
            matching.truncate(limit);
        }

        Ok(Box::pin(stream::iter(
            matching
                .into_iter()
                .map(move |r| Ok::<_, Error>(r.project(include_vector))),
        )))
    }

    async fn search(
        &self,
        index: &IndexName,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<ScoredRecordStream> {
        let mut scored: Vec<ScoredRecord> = {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| lock_poisoned("memory_search"))?;
            let idx = indexes.get(index.as_str()).ok_or_else(|| not_found(index))?;
            query.ensure_dimensions(idx.vector_size)?;

            let mut scored = Vec::new();
            for record in idx.records.values().filter(|r| filter.matches(&r.tags)) {
                let Some(vector) = &record.vector else {
                    continue;
                };
                let score = query.cosine_similarity(vector)?;
                if score >= min_relevance {
                    scored.push(ScoredRecord {
                        record: record.clone(),
                        score,
                    });
                }
            }
            scored
        };

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        if let Some(limit) = limit {
            scored.truncate(limit);
        }

        Ok(Box::pin(stream::iter(scored.into_iter().map(move |s| {
            Ok::<_, Error>(ScoredRecord {
                record: s.record.project(include_vector),
                score: s.score,
            })
        }))))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;

    fn name(s: &str) -> IndexName {
        IndexName::parse(s).expect("valid index name")
    }

    fn record(id: &str, chat: &str, vector: Vec<f32>) -> MemoryRecord {
        MemoryRecord::new(id)
            .with_tag("chatId", chat)
            .with_payload("text", format!("chunk {id}"))
            .with_vector(Embedding::new(vector))
            .with_timestamp(Utc::now())
    }

    async fn seeded() -> (InMemoryVectorDb, IndexName) {
        let db = InMemoryVectorDb::new();
        let docs = name("docs");
        db.create_index(&docs, 3).await.expect("create");
        db.upsert(&docs, &record("a-0", "c1", vec![1.0, 0.0, 0.0]))
            .await
            .expect("upsert");
        db.upsert(&docs, &record("a-1", "c2", vec![0.0, 1.0, 0.0]))
            .await
            .expect("upsert");
        (db, docs)
    }

    #[tokio::test]
    async fn test_create_index_is_idempotent() {
        let (db, docs) = seeded().await;
        db.create_index(&docs, 3).await.expect("create again");
        assert_eq!(db.count(&docs), Some(2));
        assert_eq!(db.list_indexes().await.expect("list"), vec!["docs"]);
    }

    #[tokio::test]
    async fn test_create_index_with_other_size_fails() {
        let (db, docs) = seeded().await;
        let err = db.create_index(&docs, 4).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_point_operations_on_missing_index() {
        let db = InMemoryVectorDb::new();
        let nope = name("nope");
        assert!(matches!(
            db.read(&nope, "a", false).await,
            Err(Error::IndexNotFound { .. })
        ));
        assert!(matches!(
            db.delete(&nope, "a").await,
            Err(Error::IndexNotFound { .. })
        ));
        assert!(db.delete_batch(&nope, &["a".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_into_missing_index() {
        let db = InMemoryVectorDb::new();
        let err = db
            .upsert(&name("nope"), &record("x", "c1", vec![1.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound { .. }));
    }

    #[tokio::test]
    async fn test_upsert_dimension_mismatch() {
        let (db, docs) = seeded().await;
        let err = db
            .upsert(&docs, &record("bad", "c1", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_read_projects_vector() {
        let (db, docs) = seeded().await;
        let without = db.read(&docs, "a-0", false).await.expect("read");
        assert!(without.expect("present").vector.is_none());
        let with = db.read(&docs, "a-0", true).await.expect("read");
        assert!(with.expect("present").vector.is_some());
        assert!(db.read(&docs, "missing", false).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_search_scenario() {
        let (db, docs) = seeded().await;
        let hits: Vec<ScoredRecord> = db
            .search(
                &docs,
                &Embedding::new(vec![1.0, 0.0, 0.0]),
                &MemoryFilter::new().by_tag("chatId", "c1"),
                0.0,
                Some(10),
                false,
            )
            .await
            .expect("search")
            .try_collect()
            .await
            .expect("collect");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "a-0");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_search_respects_min_relevance() {
        let (db, docs) = seeded().await;
        let hits: Vec<ScoredRecord> = db
            .search(
                &docs,
                &Embedding::new(vec![1.0, 0.0, 0.0]),
                &MemoryFilter::new(),
                0.5,
                None,
                false,
            )
            .await
            .expect("search")
            .try_collect()
            .await
            .expect("collect");
        assert_eq!(hits.len(), 1);
        assert!(hits.iter().all(|h| h.score >= 0.5));
    }

    #[tokio::test]
    async fn test_list_orders_newest_first() {
        let db = InMemoryVectorDb::new();
        let docs = name("docs");
        db.create_index(&docs, 1).await.expect("create");
        let now = Utc::now();
        for (i, age) in [3, 1, 2].into_iter().enumerate() {
            let r = MemoryRecord::new(format!("r-{i}"))
                .with_vector(Embedding::new(vec![1.0]))
                .with_timestamp(now - Duration::seconds(age));
            db.upsert(&docs, &r).await.expect("upsert");
        }
        let ids: Vec<String> = db
            .list(&docs, &MemoryFilter::new(), None, false)
            .await
            .expect("list")
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .expect("collect");
        assert_eq!(ids, vec!["r-1", "r-2", "r-0"]);
    }

    #[tokio::test]
    async fn test_list_missing_index_fails_fast() {
        let db = InMemoryVectorDb::new();
        let result = db
            .list(&name("nope"), &MemoryFilter::new(), None, false)
            .await;
        assert!(matches!(result, Err(Error::IndexNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_batch_counts_existing() {
        let (db, docs) = seeded().await;
        let removed = db
            .delete_batch(&docs, &["a-0".into(), "missing".into()])
            .await
            .expect("delete");
        assert_eq!(removed, 1);
        assert!(!db.delete(&docs, "a-0").await.expect("delete"));
        assert!(db.delete(&docs, "a-1").await.expect("delete"));
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let (_db, docs) = seeded().await;
        let other = InMemoryVectorDb::new();
        assert_eq!(other.count(&docs), None);
    }
}
