//! Memory ingestion.
//!
//! Text is split into chunks, embedded, and upserted one record per chunk
//! with ids `<documentId>-<chunkIndex>`. Re-ingesting a document replaces its
//! previous chunks once every new chunk is stored, so a failed re-ingest
//! leaves the earlier version readable.

use super::{payload, tags};
use crate::embedding::{self, Embedder};
use crate::models::{MemoryFilter, MemoryRecord};
use crate::storage::MemoryDb;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use tracing::instrument;

/// File name recorded for memories stored without a source file.
const MEMORY_FILE_NAME: &str = "memory.txt";

/// Outcome of storing a document or memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Document id the chunks were stored under.
    pub document_id: String,
    /// Ids of the upserted records, in chunk order.
    pub record_ids: Vec<String>,
    /// Chunks of a previous version that were replaced.
    pub replaced: u64,
}

/// Stores chat memories and documents through the facade.
#[derive(Clone)]
pub struct IngestService {
    db: MemoryDb,
    embedder: Arc<dyn Embedder>,
    chunk_size: usize,
}

impl IngestService {
    /// Creates an ingest service. `chunk_size` is the maximum characters per
    /// chunk; zero is treated as one.
    #[must_use]
    pub fn new(db: MemoryDb, embedder: Arc<dyn Embedder>, chunk_size: usize) -> Self {
        Self {
            db,
            embedder,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Splits text into trimmed, non-empty chunks of at most `chunk_size`
    /// characters.
    #[must_use]
    pub fn chunk(&self, text: &str) -> Vec<String> {
        let config = ChunkConfig::new(self.chunk_size)
            .with_sizer(Characters)
            .with_trim(true);
        TextSplitter::new(config)
            .chunks(text)
            .filter(|chunk| !chunk.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Stores a free-text memory under a fresh document id.
    ///
    /// # Errors
    ///
    /// See [`store_document`](Self::store_document).
    pub async fn store_memory(
        &self,
        index: &str,
        chat_id: &str,
        memory_name: &str,
        memory: &str,
    ) -> Result<IngestReport> {
        let document_id = uuid::Uuid::new_v4().to_string();
        self.store_memory_with_id(index, chat_id, memory_name, &document_id, memory)
            .await
    }

    /// Stores a free-text memory under a caller-chosen document id.
    ///
    /// # Errors
    ///
    /// See [`store_document`](Self::store_document).
    pub async fn store_memory_with_id(
        &self,
        index: &str,
        chat_id: &str,
        memory_name: &str,
        memory_id: &str,
        memory: &str,
    ) -> Result<IngestReport> {
        self.store_document(index, memory_id, chat_id, memory_name, MEMORY_FILE_NAME, memory)
            .await
    }

    /// Chunks, embeds and stores a document.
    ///
    /// The index is created with the embedder's dimensions if missing. Chunks
    /// from an earlier ingestion of the same document that the new version
    /// does not overwrite are removed after all new chunks are upserted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for empty ids, a document id containing
    /// `/`, or content with no text; [`Error::DimensionMismatch`] if the index
    /// exists with another size; or any embedder or storage error.
    #[instrument(skip(self, content), fields(content_len = content.len()))]
    pub async fn store_document(
        &self,
        index: &str,
        document_id: &str,
        chat_id: &str,
        memory_name: &str,
        file_name: &str,
        content: &str,
    ) -> Result<IngestReport> {
        validate_document_id(document_id)?;
        if chat_id.trim().is_empty() {
            return Err(Error::InvalidInput("chat id is empty".to_string()));
        }
        if memory_name.trim().is_empty() {
            return Err(Error::InvalidInput("memory name is empty".to_string()));
        }

        let chunks = self.chunk(content);
        if chunks.is_empty() {
            return Err(Error::InvalidInput(format!(
                "document '{document_id}' has no text"
            )));
        }

        let start = Instant::now();
        let dimensions = i64::try_from(self.embedder.dimensions())
            .map_err(|e| Error::Configuration(format!("embedder dimensions: {e}")))?;
        self.db.create_index(index, dimensions).await?;

        let embeddings =
            embedding::embed_blocking(Arc::clone(&self.embedder), chunks.clone()).await?;
        let previous = self.previous_chunk_ids(index, document_id).await?;

        let total = chunks.len();
        let last_update = Utc::now().to_rfc3339();
        let mut record_ids = Vec::with_capacity(total);
        for (position, (text, vector)) in chunks.into_iter().zip(embeddings).enumerate() {
            let record = MemoryRecord::new(format!("{document_id}-{position}"))
                .with_tag(tags::CHAT_ID, chat_id)
                .with_tag(tags::MEMORY, memory_name)
                .with_tag(tags::DOCUMENT_ID, document_id)
                .with_tag(tags::FILE_NAME, file_name)
                .with_payload(payload::TEXT, text)
                .with_payload(
                    payload::DESCRIPTION,
                    format!("{file_name} ({} of {total})", position + 1),
                )
                .with_payload(payload::FILE, file_name)
                .with_payload(payload::LAST_UPDATE, last_update.clone())
                .with_vector(vector);
            record_ids.push(self.db.upsert(index, record).await?);
        }

        // The new version is complete; only now drop chunks it did not overwrite.
        let stale: Vec<String> = previous
            .iter()
            .filter(|id| !record_ids.contains(id))
            .cloned()
            .collect();
        self.db.delete_batch(index, &stale).await?;
        let replaced = u64::try_from(previous.len()).unwrap_or(u64::MAX);

        tracing::info!(
            index,
            document_id,
            chunks = total,
            replaced,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Document stored"
        );
        Ok(IngestReport {
            document_id: document_id.to_string(),
            record_ids,
            replaced,
        })
    }

    async fn previous_chunk_ids(&self, index: &str, document_id: &str) -> Result<Vec<String>> {
        let filter = MemoryFilter::new().by_tag(tags::DOCUMENT_ID, document_id);
        Ok(self
            .db
            .list_collect(index, &filter, -1, false)
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }
}

fn validate_document_id(document_id: &str) -> Result<()> {
    if document_id.trim().is_empty() {
        return Err(Error::InvalidInput("document id is empty".to_string()));
    }
    if document_id.contains('/') {
        return Err(Error::InvalidInput(format!(
            "document id '{document_id}' must not contain '/'"
        )));
    }
    Ok(())
}
