//! Binary entry point for vectormem.
//!
//! Exposes the storage facade, chat search and ingestion from the command line.
//! Results are printed to stdout as JSON; logs go to stderr.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use vectormem::services::ServiceSet;
use vectormem::storage::ResilienceConfig;
use vectormem::{
    BackendFactory, BackendKind, Embedding, MemoryFilter, MemoryRecord, VectorMemConfig,
    observability,
};

/// vectormem - storage-agnostic vector memory for chat applications.
#[derive(Parser)]
#[command(name = "vectormem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "VECTORMEM_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Backend override: postgres, qdrant, azure_search or memory.
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Disable retries and the circuit breaker around the backend.
    #[arg(long, global = true)]
    no_resilience: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Create an index if it does not exist.
    CreateIndex {
        /// Index name.
        name: String,

        /// Vector dimensionality (default: configured `vector_size`).
        #[arg(short, long)]
        size: Option<i64>,
    },

    /// List index names.
    ListIndexes,

    /// Drop an index and all its records.
    DeleteIndex {
        /// Index name.
        name: String,
    },

    /// Insert or replace a record.
    Upsert {
        /// Index name.
        index: String,

        /// Record id.
        #[arg(long)]
        id: String,

        /// Comma-separated vector, e.g. `1,0,0`.
        #[arg(long)]
        vector: String,

        /// Tag as `key=value`; repeatable.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// JSON object payload.
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Read a record by id.
    Get {
        /// Index name.
        index: String,

        /// Record id.
        id: String,

        /// Include the embedding.
        #[arg(long)]
        include_vector: bool,
    },

    /// Delete records by id.
    Delete {
        /// Index name.
        index: String,

        /// Record ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List records, newest first.
    List {
        /// Index name.
        index: String,

        /// Tag filter as `key=value`; repeatable.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Maximum records; zero or negative means all.
        #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
        limit: i64,

        /// Include embeddings.
        #[arg(long)]
        include_vector: bool,
    },

    /// Nearest-neighbour search by vector or text.
    Search {
        /// Index name.
        index: String,

        /// Text query, embedded with the configured embedder.
        #[arg(short, long, conflicts_with = "vector", required_unless_present = "vector")]
        query: Option<String>,

        /// Comma-separated query vector.
        #[arg(long)]
        vector: Option<String>,

        /// Tag filter as `key=value`; repeatable.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Minimum cosine similarity.
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        min_relevance: f64,

        /// Maximum results; zero or negative means all.
        #[arg(short, long, default_value = "10", allow_negative_numbers = true)]
        limit: i64,

        /// Include embeddings.
        #[arg(long)]
        include_vector: bool,
    },

    /// Search a chat's memories.
    Recall {
        /// Index name.
        index: String,

        /// Text query.
        query: String,

        /// Chat id.
        #[arg(long)]
        chat_id: String,

        /// Memory name.
        #[arg(long)]
        memory: Option<String>,

        /// Minimum relevance.
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        min_relevance: f64,

        /// Result count; -1 means all.
        #[arg(short = 'n', long, default_value = "-1", allow_negative_numbers = true)]
        count: i64,
    },

    /// Store a short memory for a chat.
    Remember {
        /// Index name.
        index: String,

        /// Memory text.
        text: String,

        /// Chat id.
        #[arg(long)]
        chat_id: String,

        /// Memory name.
        #[arg(long, default_value = "WorkingMemory")]
        memory: String,

        /// Document id (default: random UUID).
        #[arg(long)]
        id: Option<String>,
    },

    /// Chunk, embed and store a text file.
    Ingest {
        /// Index name.
        index: String,

        /// File to ingest.
        file: PathBuf,

        /// Chat id.
        #[arg(long)]
        chat_id: String,

        /// Memory name.
        #[arg(long, default_value = "DocumentMemory")]
        memory: String,

        /// Document id (default: file name).
        #[arg(long)]
        document_id: Option<String>,
    },

    /// Delete every chunk of a document.
    DeleteDocument {
        /// Index name.
        index: String,

        /// Document id.
        document_id: String,
    },

    /// Delete every document referenced by a chat.
    RemoveChat {
        /// Index name.
        index: String,

        /// Chat id.
        chat_id: String,
    },
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = observability::init_from_settings(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    log_dotenv(&dotenv);

    match run_command(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Reports the outcome of loading `.env`, once logging is up.
fn log_dotenv(result: &dotenvy::Result<std::path::PathBuf>) {
    match result {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => tracing::debug!("No .env file found"),
        Err(e) => tracing::debug!(error = %e, "Failed to load .env file"),
    }
}

/// Loads configuration and applies the command-line backend override.
fn load_config(cli: &Cli) -> anyhow::Result<VectorMemConfig> {
    let mut config = VectorMemConfig::load(cli.config.as_deref())?;
    if let Some(backend) = &cli.backend {
        config.backend = backend.parse::<BackendKind>()?;
        config.validate()?;
    }
    Ok(config)
}

/// Runs the selected command.
async fn run_command(cli: Cli, config: VectorMemConfig) -> anyhow::Result<()> {
    let resilience = (!cli.no_resilience).then(ResilienceConfig::from_env);
    let services = BackendFactory::create_services(&config, resilience)
        .await
        .context("connecting to backend")?;

    match cli.command {
        Commands::CreateIndex { name, size } => {
            let size = match size {
                Some(size) => size,
                None => i64::try_from(config.vector_size)?,
            };
            services.db.create_index(&name, size).await?;
            print_json(&json!({ "index": name, "vector_size": size }))
        },

        Commands::ListIndexes => print_json(&services.db.list_indexes().await?),

        Commands::DeleteIndex { name } => {
            services.db.delete_index(&name).await?;
            print_json(&json!({ "index": name }))
        },

        Commands::Upsert {
            index,
            id,
            vector,
            tags,
            payload,
        } => {
            let record = build_record(id, &vector, &tags, payload.as_deref())?;
            let id = services.db.upsert(&index, record).await?;
            print_json(&json!({ "id": id }))
        },

        Commands::Get {
            index,
            id,
            include_vector,
        } => match services.db.read(&index, &id, include_vector).await? {
            Some(record) => print_json(&record),
            None => bail!("record '{id}' not found in index '{index}'"),
        },

        Commands::Delete { index, ids } => {
            let removed = services.db.delete_batch(&index, &ids).await?;
            print_json(&json!({ "requested": ids.len(), "removed": removed }))
        },

        Commands::List {
            index,
            tags,
            limit,
            include_vector,
        } => {
            let filter = parse_filter(&tags)?;
            let records = services
                .db
                .list_collect(&index, &filter, limit, include_vector)
                .await?;
            print_json(&records)
        },

        Commands::Search {
            index,
            query,
            vector,
            tags,
            min_relevance,
            limit,
            include_vector,
        } => {
            let filter = parse_filter(&tags)?;
            let embedding = match (query, vector) {
                (_, Some(vector)) => parse_vector(&vector)?,
                (Some(query), None) => embed_query(&services, query).await?,
                (None, None) => bail!("either --query or --vector is required"),
            };
            let hits = services
                .db
                .search_nearest_collect(&index, &embedding, &filter, min_relevance, limit, include_vector)
                .await?;
            let hits: Vec<_> = hits
                .into_iter()
                .map(|hit| json!({ "score": hit.score, "record": hit.record }))
                .collect();
            print_json(&hits)
        },

        Commands::Recall {
            index,
            query,
            chat_id,
            memory,
            min_relevance,
            count,
        } => {
            let result = services
                .search
                .search_memories(&index, &query, min_relevance, count, &chat_id, memory.as_deref())
                .await?;
            print_json(&result)
        },

        Commands::Remember {
            index,
            text,
            chat_id,
            memory,
            id,
        } => {
            let report = match id {
                Some(id) => {
                    services
                        .ingest
                        .store_memory_with_id(&index, &chat_id, &memory, &id, &text)
                        .await?
                },
                None => {
                    services
                        .ingest
                        .store_memory(&index, &chat_id, &memory, &text)
                        .await?
                },
            };
            print_json(&report)
        },

        Commands::Ingest {
            index,
            file,
            chat_id,
            memory,
            document_id,
        } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            let document_id = document_id.unwrap_or_else(|| file_name.replace('/', "_"));
            let report = services
                .ingest
                .store_document(&index, &document_id, &chat_id, &memory, &file_name, &content)
                .await?;
            print_json(&report)
        },

        Commands::DeleteDocument { index, document_id } => {
            let removed = services.search.delete_document(&index, &document_id).await?;
            print_json(&json!({ "document_id": document_id, "removed": removed }))
        },

        Commands::RemoveChat { index, chat_id } => {
            let report = services.search.remove_chat_memories(&index, &chat_id).await?;
            print_json(&report)
        },
    }
}

async fn embed_query(services: &ServiceSet, query: String) -> anyhow::Result<Embedding> {
    let embedded = vectormem::embedding::embed_blocking(services.embedder.clone(), vec![query]).await?;
    embedded
        .into_iter()
        .next()
        .context("embedder returned no vector")
}

/// Builds a record from command-line arguments.
fn build_record(
    id: String,
    vector: &str,
    tags: &[String],
    payload: Option<&str>,
) -> anyhow::Result<MemoryRecord> {
    let mut record = MemoryRecord::new(id).with_vector(parse_vector(vector)?);
    for tag in tags {
        let (key, value) = parse_tag(tag)?;
        record = record.with_tag(key, value);
    }
    if let Some(payload) = payload {
        let value: serde_json::Value = serde_json::from_str(payload).context("parsing --payload")?;
        let serde_json::Value::Object(map) = value else {
            bail!("--payload must be a JSON object");
        };
        record.payload = map;
    }
    Ok(record)
}

/// Parses `1,0,0` (brackets optional).
fn parse_vector(text: &str) -> anyhow::Result<Embedding> {
    let values = text
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|v| {
            v.trim()
                .parse::<f32>()
                .with_context(|| format!("invalid vector component '{v}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Embedding::new(values))
}

fn parse_tag(tag: &str) -> anyhow::Result<(&str, &str)> {
    tag.split_once('=')
        .filter(|(key, _)| !key.trim().is_empty())
        .with_context(|| format!("tag '{tag}' must be key=value"))
}

fn parse_filter(tags: &[String]) -> anyhow::Result<MemoryFilter> {
    tags.iter().try_fold(MemoryFilter::new(), |filter, tag| {
        let (key, value) = parse_tag(tag)?;
        Ok(filter.by_tag(key, value))
    })
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dotenv_accepts_every_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dotenvy::from_path(dir.path().join("missing.env")).map(|()| dir.path().into());
        assert!(matches!(&missing, Err(e) if e.not_found()));
        log_dotenv(&missing);

        let path = dir.path().join("broken.env");
        std::fs::write(&path, "NOT VALID LINE\n").expect("write");
        let broken = dotenvy::from_path(&path).map(|()| path.clone());
        assert!(matches!(&broken, Err(e) if !e.not_found()));
        log_dotenv(&broken);

        log_dotenv(&Ok(path));
    }
}
