//! # vectormem
//!
//! Storage-agnostic vector memory for chat applications.
//!
//! Document chunks are stored as [`MemoryRecord`]s (id, JSON payload, multi-valued
//! tags, embedding, timestamp) in a pluggable vector database and served back
//! through tag-filtered nearest-neighbour search.
//!
//! ## Features
//!
//! - One facade ([`MemoryDb`]) with identical semantics on every backend
//! - PostgreSQL + pgvector reference backend with pooled connections
//! - Qdrant and Azure AI Search REST backends, plus an in-memory backend
//! - Lazy, cancellable record streams for list and search
//! - Chat-scoped search and ingestion services on top of the facade
//!
//! ## Example
//!
//! ```rust,ignore
//! use vectormem::storage::vector::InMemoryVectorDb;
//! use vectormem::{Embedding, MemoryDb, MemoryFilter, MemoryRecord};
//!
//! let db = MemoryDb::new(InMemoryVectorDb::new(), "default");
//! db.create_index("docs", 3).await?;
//!
//! let record = MemoryRecord::new("a-0")
//!     .with_tag("chatId", "c1")
//!     .with_vector(Embedding::new(vec![1.0, 0.0, 0.0]));
//! db.upsert("docs", record).await?;
//!
//! let filter = MemoryFilter::new().by_tag("chatId", "c1");
//! let hits = db
//!     .search_nearest_collect("docs", &Embedding::new(vec![1.0, 0.0, 0.0]), &filter, 0.0, 10, false)
//!     .await?;
//! assert_eq!(hits[0].record.id, "a-0");
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// multiple_crate_versions is inherently crate-level (detects duplicate transitive dependencies).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod embedding;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{BackendKind, VectorMemConfig};
pub use embedding::Embedder;
pub use models::{
    Embedding, IndexName, MemoryFilter, MemoryRecord, Payload, ScoredRecord, TagCollection,
};
pub use services::{BackendFactory, IngestService, SearchService};
pub use storage::{MemoryDb, VectorDb};

/// Error type for vectormem operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty record id, malformed index name, upsert without a vector |
/// | `Configuration` | Vector size `<= 0`, missing connection settings, unknown backend |
/// | `IndexNotFound` | List/search/upsert against an index that does not exist |
/// | `DimensionMismatch` | Vector length differs from the index dimensionality |
/// | `ConnectionFailure` | Pool checkout, network, TLS or authentication failure |
/// | `OperationFailed` | Any other backend failure (SQL, HTTP status, decoding) |
/// | `Cancelled` | A cancellation token fired before the operation completed |
/// | `FeatureNotEnabled` | Backend compiled out via Cargo features |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid setup; fatal at startup and never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The referenced index does not exist.
    #[error("index '{index}' not found")]
    IndexNotFound {
        /// Name of the missing index.
        index: String,
    },

    /// Embedding size disagrees with the index dimensionality.
    #[error("dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality configured for the index.
        expected: usize,
        /// Dimensionality of the offending vector.
        actual: usize,
    },

    /// Transient connection-level failure (network, auth, pool exhaustion).
    ///
    /// Propagated unchanged; the facade never retries.
    #[error("connection failure during '{operation}': {cause}")]
    ConnectionFailure {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),
}

/// Coarse error classification matching the storage error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Invalid caller input.
    InvalidInput,
    /// Invalid setup.
    Configuration,
    /// Missing index.
    IndexNotFound,
    /// Vector size disagreement.
    DimensionMismatch,
    /// Transient connection failure.
    ConnectionFailure,
    /// Cooperative cancellation.
    Cancelled,
    /// Anything else.
    Other,
}

impl Error {
    /// Returns the storage error kind of this error.
    #[must_use]
    pub const fn kind(&self) -> StorageErrorKind {
        match self {
            Self::InvalidInput(_) => StorageErrorKind::InvalidInput,
            Self::Configuration(_) | Self::FeatureNotEnabled(_) => StorageErrorKind::Configuration,
            Self::IndexNotFound { .. } => StorageErrorKind::IndexNotFound,
            Self::DimensionMismatch { .. } => StorageErrorKind::DimensionMismatch,
            Self::ConnectionFailure { .. } => StorageErrorKind::ConnectionFailure,
            Self::Cancelled => StorageErrorKind::Cancelled,
            Self::OperationFailed { .. } => StorageErrorKind::Other,
        }
    }

    /// Returns true if a surrounding resilience layer may retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailure { .. })
    }

    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }

    /// Shorthand for [`Error::ConnectionFailure`].
    pub fn connection(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::ConnectionFailure {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for vectormem operations.
pub type Result<T> = std::result::Result<T, Error>;
