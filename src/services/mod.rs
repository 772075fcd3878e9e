//! Business logic services.
//!
//! Services sit on top of the [`MemoryDb`](crate::storage::MemoryDb) facade and
//! never talk to a driver directly, so they behave the same on every backend.

mod backend_factory;
mod ingest;
mod search;

pub use backend_factory::{BackendFactory, ServiceSet};
pub use ingest::{IngestReport, IngestService};
pub use search::{MemoryCitation, RemovalReport, SearchResult, SearchService, document_id_from_link};

/// Tag keys written by ingestion and used to scope search and removal.
pub mod tags {
    /// Chat the record belongs to.
    pub const CHAT_ID: &str = "chatId";
    /// Memory category (memory name).
    pub const MEMORY: &str = "memory";
    /// Originating document id.
    pub const DOCUMENT_ID: &str = "__document_id";
    /// Originating file name.
    pub const FILE_NAME: &str = "__file_name";
}

/// Payload keys written by ingestion.
pub mod payload {
    /// Chunk text.
    pub const TEXT: &str = "text";
    /// Human-readable description of the chunk.
    pub const DESCRIPTION: &str = "description";
    /// Originating file name.
    pub const FILE: &str = "file";
    /// RFC 3339 time the chunk was ingested.
    pub const LAST_UPDATE: &str = "last_update";
}
