//! Embedding vectors.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-length embedding vector.
///
/// Immutable once constructed. All embeddings stored in one index share the
/// dimensionality chosen when the index was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Creates an embedding from raw data.
    #[must_use]
    pub const fn new(data: Vec<f32>) -> Self {
        Self(data)
    }

    /// Returns the dimensionality.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the vector has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the components.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Consumes the embedding and returns its components.
    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Fails with [`Error::DimensionMismatch`] unless the length equals `expected`.
    pub fn ensure_dimensions(&self, expected: usize) -> Result<()> {
        if self.0.len() == expected {
            Ok(())
        } else {
            Err(Error::DimensionMismatch {
                expected,
                actual: self.0.len(),
            })
        }
    }

    /// Cosine similarity (`1 - cosine_distance`) in `[-1.0, 1.0]`.
    ///
    /// A zero-norm vector has similarity 0.0 with everything.
    pub fn cosine_similarity(&self, other: &Self) -> Result<f64> {
        other.ensure_dimensions(self.len())?;

        let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
        for (a, b) in self.0.iter().zip(&other.0) {
            let (a, b) = (f64::from(*a), f64::from(*b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return Ok(0.0);
        }
        Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
    }

    /// Formats the vector in pgvector text form: `[1,0.5,-2]`.
    #[must_use]
    pub fn to_pgvector_text(&self) -> String {
        let values: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        format!("[{}]", values.join(","))
    }

    /// Parses the pgvector text form produced by `embedding::text`.
    pub fn from_pgvector_text(text: &str) -> Result<Self> {
        let inner = text
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| Error::operation("parse_pgvector", format!("malformed vector: {text}")))?;

        if inner.trim().is_empty() {
            return Ok(Self(Vec::new()));
        }

        inner
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f32>()
                    .map_err(|e| Error::operation("parse_pgvector", e))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(data: Vec<f32>) -> Self {
        Self(data)
    }
}

impl From<&[f32]> for Embedding {
    fn from(data: &[f32]) -> Self {
        Self(data.to_vec())
    }
}

impl fmt::Display for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Embedding({} dims)", self.0.len())
    }
}
