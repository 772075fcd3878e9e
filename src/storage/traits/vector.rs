//! Vector database driver trait.
//!
//! Provides the abstraction layer every backend implements. A driver
//! translates record operations into native calls (SQL, REST) for one engine.
//!
//! # Available Implementations
//!
//! | Backend | Use Case | Configuration |
//! |---------|----------|---------------|
//! | `InMemoryVectorDb` | Tests, single-process tools | Default, no external deps |
//! | `PostgresVectorDb` | PostgreSQL with pgvector | Requires PostgreSQL + pgvector extension |
//! | `QdrantVectorDb` | Qdrant REST API | Requires a Qdrant endpoint |
//! | `AzureSearchVectorDb` | Azure AI Search REST API | Requires endpoint + API key |
//!
//! Drivers receive already-validated input: index names are [`IndexName`]s,
//! limits are `Option<usize>` (`None` = unbounded) and upserted records carry
//! a vector and a timestamp. Uniform validation lives in
//! [`MemoryDb`](crate::storage::MemoryDb).
//!
//! # Streams
//!
//! `list`, `search` and `read_batch` return lazy, forward-only streams.
//! Dropping a stream before it is exhausted aborts the underlying query and
//! releases any pooled connection it holds.

use crate::Result;
use crate::models::{Embedding, IndexName, MemoryFilter, MemoryRecord, ScoredRecord};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Lazy stream of records.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<MemoryRecord>> + Send>>;

/// Lazy stream of scored records, ordered by descending score.
pub type ScoredRecordStream = Pin<Box<dyn Stream<Item = Result<ScoredRecord>> + Send>>;

/// Trait for vector database drivers.
///
/// # Implementor Notes
///
/// - Methods use `&self` to enable sharing via `Arc<dyn VectorDb>`
/// - Connection-level failures map to
///   [`Error::ConnectionFailure`](crate::Error::ConnectionFailure) and are
///   never retried here
/// - `list` and `search` on a missing index fail with
///   [`Error::IndexNotFound`](crate::Error::IndexNotFound)
/// - Tag filters use set membership: `(k, v)` matches when `v` is one of the
///   values recorded under `k`
#[async_trait]
pub trait VectorDb: Send + Sync {
    /// Short backend identifier used in logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Creates the index if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the schema or is unreachable.
    async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()>;

    /// Lists the names of all indexes managed by this driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    async fn list_indexes(&self) -> Result<Vec<String>>;

    /// Drops an index and all its records. Absent indexes are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the drop fails.
    async fn delete_index(&self, index: &IndexName) -> Result<()>;

    /// Inserts or replaces a record by id, returning the id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexNotFound`](crate::Error::IndexNotFound) or
    /// [`Error::DimensionMismatch`](crate::Error::DimensionMismatch) on
    /// constraint violations.
    async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String>;

    /// Point lookup by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails. An absent record is `Ok(None)`.
    async fn read(
        &self,
        index: &IndexName,
        id: &str,
        include_vector: bool,
    ) -> Result<Option<MemoryRecord>>;

    /// Looks up several records by id. Absent ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be started.
    async fn read_batch(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<RecordStream>;

    /// Deletes a record, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    async fn delete(&self, index: &IndexName, id: &str) -> Result<bool>;

    /// Deletes several records in one operation, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64>;

    /// Lists records matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the index does not exist or the query fails.
    async fn list(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<RecordStream>;

    /// Nearest-neighbour search by cosine similarity.
    ///
    /// Only records with `score >= min_relevance` are yielded, in
    /// non-increasing score order.
    ///
    /// # Errors
    ///
    /// Returns an error if the index does not exist, the query vector has the
    /// wrong dimensionality, or the query fails.
    async fn search(
        &self,
        index: &IndexName,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<ScoredRecordStream>;
}
