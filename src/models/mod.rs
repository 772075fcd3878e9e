//! Data models for vectormem.
//!
//! This module contains the storage-agnostic data structures shared by every
//! backend: embeddings, records, tag filters and index names.

mod embedding;
mod index;
mod memory;
mod search;

pub use embedding::Embedding;
pub use index::{IndexName, MAX_INDEX_NAME_LEN};
pub use memory::{MemoryRecord, Payload, TagCollection};
pub use search::{MemoryFilter, ScoredRecord};
