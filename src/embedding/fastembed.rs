//! FastEmbed-based embedder.
//!
//! Semantic embeddings from all-MiniLM-L6-v2 (384 dimensions) via fastembed-rs.
//! Indexes fed by this embedder must be created with vector size 384.

#[cfg(feature = "fastembed-embeddings")]
mod native {
    use super::super::Embedder;
    use crate::models::Embedding;
    use crate::{Error, Result};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::{Mutex, OnceLock};
    use std::time::Instant;

    /// `FastEmbed` embedder using all-MiniLM-L6-v2.
    ///
    /// The model is loaded on the first embed call and kept for the life of
    /// the embedder.
    pub struct FastEmbedEmbedder {
        model: OnceLock<Mutex<fastembed::TextEmbedding>>,
    }

    impl FastEmbedEmbedder {
        /// Output dimensions of all-MiniLM-L6-v2.
        pub const DIMENSIONS: usize = 384;

        /// Model name for logs.
        pub const MODEL_NAME: &'static str = "all-MiniLM-L6-v2";

        /// Creates the embedder; the model is loaded lazily.
        ///
        /// # Errors
        ///
        /// Infallible with the feature enabled.
        #[allow(clippy::unnecessary_wraps)]
        pub const fn new() -> Result<Self> {
            Ok(Self {
                model: OnceLock::new(),
            })
        }

        fn model(&self) -> Result<&Mutex<fastembed::TextEmbedding>> {
            if let Some(model) = self.model.get() {
                return Ok(model);
            }

            tracing::info!(model = Self::MODEL_NAME, "Loading embedding model (first use)");
            let start = Instant::now();
            let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(false);
            let model = fastembed::TextEmbedding::try_new(options)
                .map_err(|e| Error::operation("load_embedding_model", e))?;
            tracing::info!(
                elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                model = Self::MODEL_NAME,
                "Embedding model loaded"
            );

            // Another thread may have won the race; either instance is fine.
            let _ = self.model.set(Mutex::new(model));
            self.model
                .get()
                .ok_or_else(|| Error::operation("load_embedding_model", "model not initialized"))
        }

        fn run(&self, operation: &str, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            let model = self.model()?;
            let mut guard = model
                .lock()
                .map_err(|_| Error::operation(operation, "Lock poisoned"))?;

            // ONNX runtime can panic on malformed input.
            catch_unwind(AssertUnwindSafe(|| guard.embed(texts, None)))
                .map_err(|panic_info| {
                    let message = panic_info
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic_info.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(panic_message = %message, "ONNX runtime panicked during embedding");
                    Error::operation(operation, format!("ONNX runtime panic: {message}"))
                })?
                .map_err(|e| Error::operation(operation, e))
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn dimensions(&self) -> usize {
            Self::DIMENSIONS
        }

        fn name(&self) -> &'static str {
            "fastembed"
        }

        fn embed(&self, text: &str) -> Result<Embedding> {
            if text.trim().is_empty() {
                return Err(Error::InvalidInput("Cannot embed empty text".to_string()));
            }
            self.run("embed", vec![text.to_string()])?
                .into_iter()
                .next()
                .map(Embedding::new)
                .ok_or_else(|| Error::operation("embed", "No embedding returned from model"))
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            if texts.iter().any(|t| t.trim().is_empty()) {
                return Err(Error::InvalidInput("Cannot embed empty text".to_string()));
            }
            let owned = texts.iter().map(|t| (*t).to_string()).collect();
            Ok(self
                .run("embed_batch", owned)?
                .into_iter()
                .map(Embedding::new)
                .collect())
        }
    }
}

#[cfg(feature = "fastembed-embeddings")]
pub use native::FastEmbedEmbedder;

#[cfg(not(feature = "fastembed-embeddings"))]
mod stub {
    use super::super::Embedder;
    use crate::models::Embedding;
    use crate::{Error, Result};

    /// `FastEmbed` embedder (stub when the feature is disabled).
    pub struct FastEmbedEmbedder;

    impl FastEmbedEmbedder {
        /// Output dimensions of all-MiniLM-L6-v2.
        pub const DIMENSIONS: usize = 384;

        /// Always fails: the `fastembed-embeddings` feature is not compiled in.
        ///
        /// # Errors
        ///
        /// Always returns [`Error::FeatureNotEnabled`].
        pub fn new() -> Result<Self> {
            Err(Error::FeatureNotEnabled("fastembed-embeddings".to_string()))
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn dimensions(&self) -> usize {
            Self::DIMENSIONS
        }

        fn name(&self) -> &'static str {
            "fastembed"
        }

        fn embed(&self, _text: &str) -> Result<Embedding> {
            Err(Error::FeatureNotEnabled("fastembed-embeddings".to_string()))
        }
    }

    #[cfg(test)]
    #[allow(clippy::expect_used, clippy::unwrap_used)]
    mod tests {
        use super::*;

        #[test]
        fn test_new_reports_missing_feature() {
            assert!(matches!(
                FastEmbedEmbedder::new(),
                Err(Error::FeatureNotEnabled(_))
            ));
        }
    }
}

#[cfg(not(feature = "fastembed-embeddings"))]
pub use stub::FastEmbedEmbedder;
