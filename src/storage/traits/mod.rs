//! Storage backend traits.

mod vector;

pub use vector::{RecordStream, ScoredRecordStream, VectorDb};
