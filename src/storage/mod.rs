//! Storage layer.
//!
//! Two layers:
//! - **Drivers** ([`vector`]): one [`VectorDb`] implementation per backend
//!   (PostgreSQL + pgvector, Qdrant, Azure AI Search, in-memory)
//! - **Facade** ([`MemoryDb`]): the storage-agnostic contract callers use,
//!   identical on every backend
//!
//! [`ResilientVectorDb`] can be layered between the two; it is never applied
//! implicitly.

// Allow cast precision loss for score and count conversions.
#![allow(clippy::cast_precision_loss)]
// Allow significant_drop_tightening - dropping pooled connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

pub mod cancel;
pub mod facade;
pub mod migrations;
pub mod resilience;
pub mod traits;
pub mod vector;

pub use cancel::{cancellable, cancellable_stream};
pub use facade::{MemoryDb, normalize_limit};
pub use resilience::{BreakerState, CircuitBreaker, ResilienceConfig, ResilientVectorDb};
pub use traits::{RecordStream, ScoredRecordStream, VectorDb};
