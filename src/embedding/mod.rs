//! Embedding generation.
//!
//! The storage layer never computes embeddings itself; ingestion and text
//! search go through an [`Embedder`]. Two are provided:
//!
//! - [`HashEmbedder`]: deterministic hash-based pseudo-embeddings, any size
//! - [`FastEmbedEmbedder`]: ONNX semantic embeddings (feature `fastembed-embeddings`)

// Allow cast precision loss for hash-based embedding calculations.
#![allow(clippy::cast_precision_loss)]
// Allow cast possible truncation for hash index calculations on 32-bit platforms.
#![allow(clippy::cast_possible_truncation)]

mod fastembed;
mod hash;

pub use fastembed::FastEmbedEmbedder;
pub use hash::HashEmbedder;

use crate::models::Embedding;
use crate::{Error, Result};
use std::sync::Arc;

/// Trait for embedding generators.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimensions.
    fn dimensions(&self) -> usize;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Generates an embedding for the given text.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generates embeddings for multiple texts.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding generation fails.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Builds the embedder named in configuration.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for an unknown name, or
/// [`Error::FeatureNotEnabled`] for `fastembed` without its feature.
pub fn from_name(name: &str, dimensions: usize) -> Result<Arc<dyn Embedder>> {
    match name.trim().to_lowercase().as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(dimensions))),
        "fastembed" => Ok(Arc::new(FastEmbedEmbedder::new()?)),
        other => Err(Error::Configuration(format!(
            "unknown embedder '{other}' (expected hash or fastembed)"
        ))),
    }
}

/// Runs a batch embedding on the blocking pool.
///
/// # Errors
///
/// Returns an error if embedding fails or the blocking task panics.
pub async fn embed_blocking(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
) -> Result<Vec<Embedding>> {
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        embedder.embed_batch(&refs)
    })
    .await
    .map_err(|e| Error::operation("embed_batch", e))?
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        let embedder = from_name("HASH", 8).expect("hash");
        assert_eq!(embedder.dimensions(), 8);
        assert!(matches!(
            from_name("word2vec", 8),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_embed_blocking_preserves_order() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = embed_blocking(Arc::clone(&embedder), texts)
            .await
            .expect("batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("alpha").expect("alpha"));
        assert_eq!(batch[1], embedder.embed("beta").expect("beta"));
    }
}
