//! Deterministic hash-based embedder.
//!
//! Each word is hashed and spread over a few dimensions, then the vector is
//! L2-normalized. Texts sharing words land close together, which is enough
//! for tests, demos and offline use. It captures no semantics:
//! "database storage" and "PostgreSQL database" only overlap on "database".

use super::Embedder;
use crate::models::Embedding;
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Words considered per text.
const MAX_WORDS: usize = 1000;

/// Hash-based pseudo-embedder of any dimensionality.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Creates an embedder producing vectors of `dimensions` components.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn pseudo_embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];
        for (i, word) in text.split_whitespace().take(MAX_WORDS).enumerate() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            distribute_hash(&mut embedding, hasher.finish(), i);
        }
        normalize(&mut embedding);
        embedding
    }
}

/// Adds eight hash-derived components; position shifts the target slots.
fn distribute_hash(embedding: &mut [f32], hash: u64, word_idx: usize) {
    let dimensions = embedding.len();
    for j in 0..8 {
        let idx = ((hash >> (j * 8)) as usize).wrapping_add(word_idx) % dimensions;
        let value = ((hash >> (j * 4)) & 0xFF) as f32 / 255.0 - 0.5;
        embedding[idx] += value;
    }
}

fn normalize(embedding: &mut [f32]) {
    let norm_sq: f32 = embedding.iter().map(|x| x * x).sum();
    if norm_sq <= 0.0 {
        return;
    }
    let inv_norm = norm_sq.sqrt().recip();
    for v in embedding.iter_mut() {
        *v *= inv_norm;
    }
}

impl Embedder for HashEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "hash"
    }

    fn embed(&self, text: &str) -> Result<Embedding> {
        if self.dimensions == 0 {
            return Err(Error::Configuration(
                "embedder dimensions must be positive".to_string(),
            ));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("Cannot embed empty text".to_string()));
        }
        Ok(Embedding::new(self.pseudo_embed(text)))
    }
}
