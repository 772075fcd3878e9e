//! Backend factory for storage layer initialization.
//!
//! Backend selection is a configuration-time decision: the factory reads
//! [`VectorMemConfig`] once and hands back a ready [`MemoryDb`] plus the
//! services built on it. Nothing below the facade ever inspects which
//! backend is in use.
//!
//! # Architecture
//!
//! ```text
//! BackendFactory
//!   ├── create_embedder()   → Arc<dyn Embedder>
//!   ├── create_vector_db()  → Arc<dyn VectorDb>   (optionally ResilientVectorDb-wrapped)
//!   ├── create_memory_db()  → MemoryDb
//!   └── create_services()   → ServiceSet { db, search, ingest }
//! ```

use super::{IngestService, SearchService};
use crate::config::{BackendKind, VectorMemConfig};
use crate::embedding::{self, Embedder};
use crate::storage::vector::{
    AzureSearchVectorDb, InMemoryVectorDb, PostgresVectorDb, QdrantVectorDb,
};
use crate::storage::{MemoryDb, ResilienceConfig, ResilientVectorDb, VectorDb};
use crate::Result;
use std::sync::Arc;

/// Facade plus the services built on it, sharing one backend and embedder.
#[derive(Clone)]
pub struct ServiceSet {
    /// The storage facade.
    pub db: MemoryDb,
    /// Embedder shared by search and ingestion.
    pub embedder: Arc<dyn Embedder>,
    /// Chat-scoped search.
    pub search: SearchService,
    /// Ingestion.
    pub ingest: IngestService,
}

/// Factory for creating storage backends.
pub struct BackendFactory;

impl BackendFactory {
    /// Connects to the configured backend.
    ///
    /// With `resilience` set, the driver is wrapped in a [`ResilientVectorDb`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::Error::Configuration) for
    /// missing settings, [`Error::FeatureNotEnabled`](crate::Error::FeatureNotEnabled)
    /// for a compiled-out backend, or a connection error.
    pub async fn create_vector_db(
        config: &VectorMemConfig,
        resilience: Option<ResilienceConfig>,
    ) -> Result<Arc<dyn VectorDb>> {
        tracing::debug!(backend = %config.backend, "Creating vector backend");
        match config.backend {
            BackendKind::Memory => Ok(wrap(InMemoryVectorDb::new(), resilience)),
            BackendKind::Postgres => Ok(wrap(
                PostgresVectorDb::connect(&config.postgres).await?,
                resilience,
            )),
            BackendKind::Qdrant => Ok(wrap(QdrantVectorDb::new(&config.qdrant)?, resilience)),
            BackendKind::AzureSearch => Ok(wrap(
                AzureSearchVectorDb::new(&config.azure_search)?,
                resilience,
            )),
        }
    }

    /// Creates the storage facade for the configured backend.
    ///
    /// # Errors
    ///
    /// See [`BackendFactory::create_vector_db`].
    pub async fn create_memory_db(
        config: &VectorMemConfig,
        resilience: Option<ResilienceConfig>,
    ) -> Result<MemoryDb> {
        let db = Self::create_vector_db(config, resilience).await?;
        Ok(MemoryDb::from_arc(db, config.default_index.clone()))
    }

    /// Creates the configured embedder.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown or compiled-out embedder.
    pub fn create_embedder(config: &VectorMemConfig) -> Result<Arc<dyn Embedder>> {
        embedding::from_name(&config.ingest.embedder, config.vector_size)
    }

    /// Creates the facade, embedder and services.
    ///
    /// # Errors
    ///
    /// See [`BackendFactory::create_vector_db`] and [`BackendFactory::create_embedder`].
    pub async fn create_services(
        config: &VectorMemConfig,
        resilience: Option<ResilienceConfig>,
    ) -> Result<ServiceSet> {
        let embedder = Self::create_embedder(config)?;
        let db = Self::create_memory_db(config, resilience).await?;
        Ok(ServiceSet::new(db, embedder, config.ingest.chunk_size))
    }
}

impl ServiceSet {
    /// Builds the services over an existing facade and embedder.
    #[must_use]
    pub fn new(db: MemoryDb, embedder: Arc<dyn Embedder>, chunk_size: usize) -> Self {
        Self {
            search: SearchService::new(db.clone(), Arc::clone(&embedder)),
            ingest: IngestService::new(db.clone(), Arc::clone(&embedder), chunk_size),
            db,
            embedder,
        }
    }
}

fn wrap<V: VectorDb + 'static>(db: V, resilience: Option<ResilienceConfig>) -> Arc<dyn VectorDb> {
    match resilience {
        Some(config) => Arc::new(ResilientVectorDb::new(db, config)),
        None => Arc::new(db),
    }
}
