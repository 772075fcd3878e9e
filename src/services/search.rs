//! Chat-scoped memory search.
//!
//! Every query is constrained by a `chatId` tag and optionally by a memory
//! name. Results carry a `link` of the form `documentId/chunkIndex` so callers
//! can recover the originating document, which is how chat and document
//! removal find what to delete.

use super::{payload, tags};
use crate::embedding::{self, Embedder};
use crate::models::{Embedding, MemoryFilter, MemoryRecord, ScoredRecord, TagCollection};
use crate::storage::MemoryDb;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// One search hit in caller-facing form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCitation {
    /// `documentId/chunkIndex`, or just `documentId` when the record id carries
    /// no chunk index.
    pub link: String,
    /// Stored record id.
    pub record_id: String,
    /// Originating document id.
    pub document_id: String,
    /// Chunk position within the document.
    pub chunk_index: Option<usize>,
    /// Originating file name, if tagged.
    pub source_name: Option<String>,
    /// Chunk text from the payload.
    pub text: String,
    /// Cosine similarity to the query.
    pub relevance: f64,
    /// Last upsert time.
    pub last_update: Option<DateTime<Utc>>,
    /// All tags of the record.
    pub tags: TagCollection,
}

/// Result of a memory search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// The query text (empty for vector queries).
    pub query: String,
    /// Hits, most relevant first.
    pub results: Vec<MemoryCitation>,
}

impl SearchResult {
    /// Returns true if nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Number of hits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }
}

/// Outcome of removing a chat's memories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    /// Distinct documents removed.
    pub documents: usize,
    /// Records deleted across those documents.
    pub records: u64,
}

/// Returns the document id part of a citation link.
#[must_use]
pub fn document_id_from_link(link: &str) -> &str {
    link.split('/').next().unwrap_or(link)
}

/// Splits a record into its document id and chunk index.
///
/// The `__document_id` tag wins; otherwise the `<documentId>-<chunkIndex>`
/// id convention is parsed, and an id without a numeric suffix is its own
/// document.
fn document_identity(record: &MemoryRecord) -> (String, Option<usize>) {
    let tagged = record
        .tags
        .get(tags::DOCUMENT_ID)
        .and_then(|values| values.first());

    if let Some(document_id) = tagged {
        let chunk = record
            .id
            .strip_prefix(document_id.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|index| index.parse().ok());
        return (document_id.clone(), chunk);
    }

    match record.id.rsplit_once('-') {
        Some((document_id, index)) if !document_id.is_empty() => match index.parse() {
            Ok(chunk) => (document_id.to_string(), Some(chunk)),
            Err(_) => (record.id.clone(), None),
        },
        _ => (record.id.clone(), None),
    }
}

fn citation(hit: ScoredRecord) -> MemoryCitation {
    let (document_id, chunk_index) = document_identity(&hit.record);
    let link = match chunk_index {
        Some(index) => format!("{document_id}/{index}"),
        None => document_id.clone(),
    };
    let record = hit.record;
    let text = record
        .payload
        .get(payload::TEXT)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let source_name = record
        .tags
        .get(tags::FILE_NAME)
        .and_then(|values| values.first())
        .cloned();

    MemoryCitation {
        link,
        record_id: record.id,
        document_id,
        chunk_index,
        source_name,
        text,
        relevance: hit.score,
        last_update: record.timestamp,
        tags: record.tags,
    }
}

fn chat_filter(chat_id: &str, memory_name: Option<&str>) -> Result<MemoryFilter> {
    if chat_id.trim().is_empty() {
        return Err(Error::InvalidInput("chat id is empty".to_string()));
    }
    let filter = MemoryFilter::new().by_tag(tags::CHAT_ID, chat_id);
    Ok(match memory_name.map(str::trim).filter(|m| !m.is_empty()) {
        Some(memory) => filter.by_tag(tags::MEMORY, memory),
        None => filter,
    })
}

/// Chat-scoped search over the facade.
#[derive(Clone)]
pub struct SearchService {
    db: MemoryDb,
    embedder: Arc<dyn Embedder>,
}

impl SearchService {
    /// Creates a search service.
    #[must_use]
    pub fn new(db: MemoryDb, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    /// Searches a chat's memories by text.
    ///
    /// `result_count <= 0` returns every hit at or above
    /// `relevance_threshold`. A blank `memory_name` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty chat id or query, or any
    /// embedder or storage error.
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn search_memories(
        &self,
        index: &str,
        query: &str,
        relevance_threshold: f64,
        result_count: i64,
        chat_id: &str,
        memory_name: Option<&str>,
    ) -> Result<SearchResult> {
        if query.trim().is_empty() {
            return Err(Error::InvalidInput("query is empty".to_string()));
        }
        let filter = chat_filter(chat_id, memory_name)?;
        let embedding =
            embedding::embed_blocking(Arc::clone(&self.embedder), vec![query.to_string()])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::operation("embed_query", "no embedding returned"))?;

        let mut result = self
            .search_filtered(index, &embedding, &filter, relevance_threshold, result_count)
            .await?;
        result.query = query.to_string();
        Ok(result)
    }

    /// [`search_memories`](Self::search_memories) without a result cap.
    ///
    /// # Errors
    ///
    /// Same as [`search_memories`](Self::search_memories).
    pub async fn search_memories_unbounded(
        &self,
        index: &str,
        query: &str,
        relevance_threshold: f64,
        chat_id: &str,
        memory_name: Option<&str>,
    ) -> Result<SearchResult> {
        self.search_memories(index, query, relevance_threshold, -1, chat_id, memory_name)
            .await
    }

    /// Searches a chat's memories with a precomputed query vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty chat id, or any storage
    /// error.
    pub async fn search_by_vector(
        &self,
        index: &str,
        query: &Embedding,
        relevance_threshold: f64,
        result_count: i64,
        chat_id: &str,
        memory_name: Option<&str>,
    ) -> Result<SearchResult> {
        let filter = chat_filter(chat_id, memory_name)?;
        self.search_filtered(index, query, &filter, relevance_threshold, result_count)
            .await
    }

    async fn search_filtered(
        &self,
        index: &str,
        query: &Embedding,
        filter: &MemoryFilter,
        relevance_threshold: f64,
        result_count: i64,
    ) -> Result<SearchResult> {
        let start = Instant::now();
        let hits = self
            .db
            .search_nearest_collect(index, query, filter, relevance_threshold, result_count, false)
            .await?;
        let results: Vec<MemoryCitation> = hits.into_iter().map(citation).collect();

        tracing::debug!(
            index,
            hits = results.len(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Memory search completed"
        );
        Ok(SearchResult {
            query: String::new(),
            results,
        })
    }

    /// Deletes every chunk of a document, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty document id, or any
    /// storage error.
    #[instrument(skip(self))]
    pub async fn delete_document(&self, index: &str, document_id: &str) -> Result<u64> {
        self.delete_document_with(index, document_id, Vec::new())
            .await
    }

    async fn delete_document_with(
        &self,
        index: &str,
        document_id: &str,
        mut ids: Vec<String>,
    ) -> Result<u64> {
        if document_id.trim().is_empty() {
            return Err(Error::InvalidInput("document id is empty".to_string()));
        }
        let filter = MemoryFilter::new().by_tag(tags::DOCUMENT_ID, document_id);
        let tagged = self.db.list_collect(index, &filter, -1, false).await?;
        ids.extend(tagged.into_iter().map(|record| record.id));
        ids.sort_unstable();
        ids.dedup();

        let removed = self.db.delete_batch(index, &ids).await?;
        tracing::debug!(index, document_id, removed, "Document memories deleted");
        Ok(removed)
    }

    /// Removes every document referenced by a chat.
    ///
    /// The chat's records are grouped by document id, and each document is
    /// then deleted in full, including chunks tagged with other chats.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty chat id, or any storage
    /// error.
    #[instrument(skip(self))]
    pub async fn remove_chat_memories(&self, index: &str, chat_id: &str) -> Result<RemovalReport> {
        let filter = chat_filter(chat_id, None)?;
        let records = self.db.list_collect(index, &filter, -1, false).await?;

        let mut documents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            let (document_id, _) = document_identity(&record);
            documents.entry(document_id).or_default().push(record.id);
        }

        let count = documents.len();
        let removed = try_join_all(
            documents
                .into_iter()
                .map(|(document_id, ids)| async move {
                    self.delete_document_with(index, &document_id, ids).await
                }),
        )
        .await?;

        let report = RemovalReport {
            documents: count,
            records: removed.into_iter().sum(),
        };
        tracing::info!(
            index,
            chat_id,
            documents = report.documents,
            records = report.records,
            "Chat memories removed"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::storage::vector::InMemoryVectorDb;

    fn service() -> SearchService {
        SearchService::new(
            MemoryDb::new(InMemoryVectorDb::new(), "default"),
            Arc::new(HashEmbedder::new(3)),
        )
    }

    async fn put(
        service: &SearchService,
        id: &str,
        chat: &str,
        document: Option<&str>,
        vector: Vec<f32>,
    ) {
        let mut record = MemoryRecord::new(id)
            .with_tag(tags::CHAT_ID, chat)
            .with_tag(tags::MEMORY, "DocumentMemory")
            .with_payload(payload::TEXT, format!("text of {id}"))
            .with_vector(Embedding::new(vector));
        if let Some(document) = document {
            record = record.with_tag(tags::DOCUMENT_ID, document);
        }
        service.db.upsert("docs", record).await.expect("upsert");
    }

    #[test]
    fn test_document_identity_from_id() {
        let record = MemoryRecord::new("a-b-12");
        assert_eq!(document_identity(&record), ("a-b".to_string(), Some(12)));

        let record = MemoryRecord::new("plain");
        assert_eq!(document_identity(&record), ("plain".to_string(), None));

        let record = MemoryRecord::new("doc-x");
        assert_eq!(document_identity(&record), ("doc-x".to_string(), None));
    }

    #[test]
    fn test_document_identity_prefers_tag() {
        let record = MemoryRecord::new("d1-3").with_tag(tags::DOCUMENT_ID, "d1");
        assert_eq!(document_identity(&record), ("d1".to_string(), Some(3)));

        let record = MemoryRecord::new("other").with_tag(tags::DOCUMENT_ID, "d1");
        assert_eq!(document_identity(&record), ("d1".to_string(), None));
    }

    #[test]
    fn test_document_id_from_link() {
        assert_eq!(document_id_from_link("d1/0"), "d1");
        assert_eq!(document_id_from_link("d1"), "d1");
    }

    #[test]
    fn test_chat_filter() {
        assert!(matches!(chat_filter(" ", None), Err(Error::InvalidInput(_))));
        assert_eq!(chat_filter("c1", Some("  ")).expect("filter").len(), 1);
        assert_eq!(chat_filter("c1", Some("m")).expect("filter").len(), 2);
    }

    #[tokio::test]
    async fn test_search_is_chat_scoped_and_linked() {
        let service = service();
        service.db.create_index("docs", 3).await.expect("create");
        put(&service, "a-0", "c1", Some("a"), vec![1.0, 0.0, 0.0]).await;
        put(&service, "a-1", "c2", Some("a"), vec![0.0, 1.0, 0.0]).await;

        let result = service
            .search_by_vector("docs", &Embedding::new(vec![1.0, 0.0, 0.0]), 0.0, 10, "c1", None)
            .await
            .expect("search");
        assert_eq!(result.len(), 1);
        let hit = &result.results[0];
        assert_eq!(hit.link, "a/0");
        assert_eq!(hit.document_id, "a");
        assert_eq!(hit.text, "text of a-0");
        assert!((hit.relevance - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_memories_rejects_empty_query() {
        let service = service();
        let result = service
            .search_memories("docs", "   ", 0.0, -1, "c1", None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_remove_chat_memories_deletes_whole_documents() {
        let service = service();
        service.db.create_index("docs", 3).await.expect("create");
        put(&service, "a-0", "c1", Some("a"), vec![1.0, 0.0, 0.0]).await;
        put(&service, "a-1", "c2", Some("a"), vec![0.0, 1.0, 0.0]).await;
        put(&service, "b-0", "c1", None, vec![0.0, 0.0, 1.0]).await;
        put(&service, "c-0", "c2", Some("c"), vec![0.0, 0.0, 1.0]).await;

        let report = service
            .remove_chat_memories("docs", "c1")
            .await
            .expect("remove");
        assert_eq!(report, RemovalReport { documents: 2, records: 3 });

        let remaining = service
            .db
            .list_collect("docs", &MemoryFilter::new(), -1, false)
            .await
            .expect("list");
        let ids: Vec<_> = remaining.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c-0"]);
    }

    #[tokio::test]
    async fn test_delete_document_on_missing_index() {
        let service = service();
        let result = service.delete_document("nope", "a").await;
        assert!(matches!(result, Err(Error::IndexNotFound { .. })));
    }
}
