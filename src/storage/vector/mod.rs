//! Vector database drivers.
//!
//! | Driver | Backend | Feature |
//! |--------|---------|---------|
//! | [`PostgresVectorDb`] | PostgreSQL + pgvector | `postgres` |
//! | [`QdrantVectorDb`] | Qdrant REST API | always |
//! | [`AzureSearchVectorDb`] | Azure AI Search REST API | always |
//! | [`InMemoryVectorDb`] | process memory | always |

mod azure_search;
mod memory;
mod postgres;
mod qdrant;
mod rest;

pub use azure_search::AzureSearchVectorDb;
pub use memory::InMemoryVectorDb;
pub use postgres::PostgresVectorDb;
pub use qdrant::QdrantVectorDb;
