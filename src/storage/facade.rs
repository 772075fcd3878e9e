//! Storage-agnostic vector database facade.
//!
//! [`MemoryDb`] is the contract consumed by the ingestion and search services.
//! It wraps any [`VectorDb`] driver and enforces the rules every backend must
//! share:
//!
//! - index names are validated and normalized ([`IndexName`])
//! - `vector_size <= 0` is a configuration error
//! - the configured default index cannot be deleted (compared case-insensitively)
//! - `limit <= 0` means unbounded
//! - record ids must be non-empty and upserted records must carry a vector
//! - upsert stamps `timestamp = now`, replacing any caller-supplied value
//! - deleting an absent record is a logged no-op
//!
//! Errors from the driver propagate unchanged. The facade never retries; wrap
//! the driver in [`ResilientVectorDb`](crate::storage::ResilientVectorDb) for
//! that.

use crate::models::{Embedding, IndexName, MemoryFilter, MemoryRecord, ScoredRecord};
use crate::observability::record_operation;
use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
use crate::{Error, Result};
use chrono::Utc;
use futures::{TryStreamExt, stream};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// Storage-agnostic vector memory database.
#[derive(Clone)]
pub struct MemoryDb {
    db: Arc<dyn VectorDb>,
    default_index: String,
}

impl std::fmt::Debug for MemoryDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDb")
            .field("backend", &self.db.backend_name())
            .field("default_index", &self.default_index)
            .finish()
    }
}

/// Converts a signed limit to the driver form: `<= 0` is unbounded.
#[must_use]
pub fn normalize_limit(limit: i64) -> Option<usize> {
    if limit <= 0 {
        None
    } else {
        Some(usize::try_from(limit).unwrap_or(usize::MAX))
    }
}

fn validate_record_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("record id is empty".to_string()));
    }
    Ok(())
}

impl MemoryDb {
    /// Wraps a driver, protecting `default_index` from deletion.
    #[must_use]
    pub fn new(db: impl VectorDb + 'static, default_index: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(db), default_index)
    }

    /// Wraps a shared driver.
    #[must_use]
    pub fn from_arc(db: Arc<dyn VectorDb>, default_index: impl Into<String>) -> Self {
        Self {
            db,
            default_index: default_index.into(),
        }
    }

    /// Returns the backend identifier.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.db.backend_name()
    }

    /// Returns the protected default index name.
    #[must_use]
    pub fn default_index(&self) -> &str {
        &self.default_index
    }

    /// Returns true if `name` is the protected default index.
    #[must_use]
    pub fn is_default_index(&self, name: &str) -> bool {
        name.trim().eq_ignore_ascii_case(self.default_index.trim())
    }

    async fn observe<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = future.await;
        let status = match &result {
            Ok(_) => "success",
            Err(Error::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        record_operation(self.db.backend_name(), operation, status, start.elapsed());
        if let Err(e) = &result {
            tracing::debug!(
                backend = self.db.backend_name(),
                operation,
                error = %e,
                "Vector database operation failed"
            );
        }
        result
    }

    /// Creates an index if it does not already exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `vector_size <= 0`,
    /// [`Error::InvalidInput`] for a malformed name, or any driver error.
    #[instrument(skip(self), fields(backend = self.db.backend_name()))]
    pub async fn create_index(&self, name: &str, vector_size: i64) -> Result<()> {
        if vector_size <= 0 {
            return Err(Error::Configuration(format!(
                "vector size must be positive, got {vector_size}"
            )));
        }
        let index = IndexName::parse(name)?;
        let size = usize::try_from(vector_size)
            .map_err(|e| Error::Configuration(format!("vector size {vector_size}: {e}")))?;

        self.observe("create_index", self.db.create_index(&index, size))
            .await?;
        tracing::info!(index = %index, vector_size = size, "Index ready");
        Ok(())
    }

    /// Lists all index names.
    ///
    /// # Errors
    ///
    /// Returns any driver error.
    pub async fn list_indexes(&self) -> Result<Vec<String>> {
        self.observe("list_indexes", self.db.list_indexes()).await
    }

    /// Drops an index and all its records.
    ///
    /// Deleting the default index is a no-op that logs a warning. Deleting
    /// an absent index is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed name, or any driver error.
    #[instrument(skip(self), fields(backend = self.db.backend_name()))]
    pub async fn delete_index(&self, name: &str) -> Result<()> {
        if self.is_default_index(name) {
            tracing::warn!(index = name, "The default index cannot be deleted");
            return Ok(());
        }
        let index = IndexName::parse(name)?;
        self.observe("delete_index", self.db.delete_index(&index))
            .await?;
        tracing::info!(index = %index, "Index deleted");
        Ok(())
    }

    /// Inserts or replaces a record by id and returns the id.
    ///
    /// The record's timestamp is set to the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty id or a record without a
    /// vector, [`Error::IndexNotFound`], [`Error::DimensionMismatch`], or any
    /// driver error.
    #[instrument(skip(self, record), fields(backend = self.db.backend_name(), record_id = %record.id))]
    pub async fn upsert(&self, name: &str, mut record: MemoryRecord) -> Result<String> {
        let index = IndexName::parse(name)?;
        validate_record_id(&record.id)?;
        match &record.vector {
            None => {
                return Err(Error::InvalidInput(format!(
                    "record '{}' has no vector",
                    record.id
                )));
            },
            Some(v) if v.is_empty() => {
                return Err(Error::InvalidInput(format!(
                    "record '{}' has an empty vector",
                    record.id
                )));
            },
            Some(_) => {},
        }
        record.timestamp = Some(Utc::now());

        self.observe("upsert", self.db.upsert(&index, &record)).await
    }

    /// Point lookup by id. An absent record is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed name or empty id, or any
    /// driver error.
    pub async fn read(
        &self,
        name: &str,
        id: &str,
        include_vector: bool,
    ) -> Result<Option<MemoryRecord>> {
        let index = IndexName::parse(name)?;
        validate_record_id(id)?;
        self.observe("read", self.db.read(&index, id, include_vector))
            .await
    }

    /// Looks up several records by id; absent ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed name, or any driver error.
    pub async fn read_batch(
        &self,
        name: &str,
        ids: &[String],
        include_vector: bool,
    ) -> Result<RecordStream> {
        let index = IndexName::parse(name)?;
        if ids.is_empty() {
            return Ok(Box::pin(stream::empty::<Result<MemoryRecord>>()));
        }
        self.observe(
            "read_batch",
            self.db.read_batch(&index, ids, include_vector),
        )
        .await
    }

    /// Deletes a record. Deleting an absent record is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed name or empty id, or any
    /// driver error.
    #[instrument(skip(self), fields(backend = self.db.backend_name()))]
    pub async fn delete(&self, name: &str, id: &str) -> Result<()> {
        let index = IndexName::parse(name)?;
        validate_record_id(id)?;
        let existed = self.observe("delete", self.db.delete(&index, id)).await?;
        if !existed {
            tracing::trace!(index = %index, record_id = id, "Record not found, nothing to delete");
        }
        Ok(())
    }

    /// Deletes several records, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a malformed name, or any driver error.
    pub async fn delete_batch(&self, name: &str, ids: &[String]) -> Result<u64> {
        let index = IndexName::parse(name)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self
            .observe("delete_batch", self.db.delete_batch(&index, ids))
            .await?;
        tracing::debug!(index = %index, requested = ids.len(), removed, "Batch delete");
        Ok(removed)
    }

    /// Lists records matching `filter`, newest first.
    ///
    /// `limit <= 0` returns every matching record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexNotFound`] if the index does not exist, or any
    /// driver error.
    pub async fn list(
        &self,
        name: &str,
        filter: &MemoryFilter,
        limit: i64,
        include_vector: bool,
    ) -> Result<RecordStream> {
        let index = IndexName::parse(name)?;
        let limit = normalize_limit(limit);
        self.observe(
            "list",
            self.db.list(&index, filter, limit, include_vector),
        )
        .await
    }

    /// Nearest-neighbour search ranked by cosine similarity, descending.
    ///
    /// Only records with `score >= min_relevance` are yielded; `limit <= 0`
    /// means unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty query vector or a
    /// non-finite threshold, [`Error::IndexNotFound`],
    /// [`Error::DimensionMismatch`], or any driver error.
    pub async fn search_nearest(
        &self,
        name: &str,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: i64,
        include_vector: bool,
    ) -> Result<ScoredRecordStream> {
        let index = IndexName::parse(name)?;
        if query.is_empty() {
            return Err(Error::InvalidInput("query vector is empty".to_string()));
        }
        if !min_relevance.is_finite() {
            return Err(Error::InvalidInput(format!(
                "min relevance must be finite, got {min_relevance}"
            )));
        }
        let limit = normalize_limit(limit);
        tracing::debug!(index = %index, filters = filter.len(), ?limit, min_relevance, "Searching");
        self.observe(
            "search",
            self.db
                .search(&index, query, filter, min_relevance, limit, include_vector),
        )
        .await
    }

    /// [`list`](Self::list), collected into a `Vec`.
    ///
    /// # Errors
    ///
    /// Same as [`list`](Self::list), plus any error raised mid-stream.
    pub async fn list_collect(
        &self,
        name: &str,
        filter: &MemoryFilter,
        limit: i64,
        include_vector: bool,
    ) -> Result<Vec<MemoryRecord>> {
        self.list(name, filter, limit, include_vector)
            .await?
            .try_collect()
            .await
    }

    /// [`search_nearest`](Self::search_nearest), collected into a `Vec`.
    ///
    /// # Errors
    ///
    /// Same as [`search_nearest`](Self::search_nearest), plus any error raised
    /// mid-stream.
    pub async fn search_nearest_collect(
        &self,
        name: &str,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: i64,
        include_vector: bool,
    ) -> Result<Vec<ScoredRecord>> {
        self.search_nearest(name, query, filter, min_relevance, limit, include_vector)
            .await?
            .try_collect()
            .await
    }
}
