//! Azure AI Search (formerly Cognitive Search) vector database (REST API).
//!
//! One search index per memory index with the fields
//!
//! | Field | EDM type | Notes |
//! |-------|----------|-------|
//! | `key` | `Edm.String` | document key: UUID v5 of the record id |
//! | `id` | `Edm.String` | record id, filterable and sortable |
//! | `payload` | `Edm.String` | JSON-encoded payload |
//! | `tags` | `Collection(Edm.String)` | flat `key:value` strings, filterable |
//! | `embedding` | `Collection(Edm.Single)` | exhaustive KNN, cosine |
//! | `timestamp` | `Edm.DateTimeOffset` | filterable and sortable |
//!
//! Document keys only allow letters, digits, `_`, `-` and `=`, which is why
//! record ids are not used as keys directly.
//!
//! The service reports cosine relevance as `1 / (1 + cosine_distance)`;
//! scores are converted back to cosine similarity before thresholding.
//!
//! Index dimensionality is read from the index definition on every call that
//! needs it. An unbounded search asks for as many neighbours as the index
//! holds when the query starts and follows `@search.nextPageParameters`
//! until the service has no further page or scores fall below the threshold.

use super::rest::{self, decode_tag, encode_tag, ensure_flat_tags};
use crate::config::AzureSearchSettings;
use crate::models::{
    Embedding, IndexName, MemoryFilter, MemoryRecord, Payload, ScoredRecord, TagCollection,
};
use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::LazyLock;

/// REST API version.
pub const API_VERSION: &str = "2023-11-01";

/// Largest `top` accepted by the service per request.
const PAGE_SIZE: usize = 1000;

/// Keys looked up per `search.in` filter.
const LOOKUP_CHUNK: usize = 64;

const KEY_NAMESPACE: uuid::Uuid = uuid::Uuid::NAMESPACE_URL;

/// Matches the service's vector dimensionality error text.
static DIMENSION_ERROR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)dimension.*?expected[^0-9]*(\d+)[^0-9]+actual[^0-9]*(\d+)").ok()
});

/// Azure AI Search vector database.
pub struct AzureSearchVectorDb {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
}

#[derive(Debug, Deserialize)]
struct IndexList {
    value: Vec<IndexDefinition>,
}

#[derive(Debug, Deserialize)]
struct IndexDefinition {
    name: String,
    #[serde(default)]
    fields: Vec<FieldDefinition>,
}

#[derive(Debug, Deserialize)]
struct FieldDefinition {
    name: String,
    #[serde(default)]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    value: Vec<Document>,
    /// Request body for the next page, present while more results remain.
    #[serde(rename = "@search.nextPageParameters", default)]
    next_page: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Document {
    id: String,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "@search.score", default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IndexingResponse {
    value: Vec<IndexingResult>,
}

#[derive(Debug, Deserialize)]
struct IndexingResult {
    key: String,
    status: bool,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Maps a record id onto its document key.
pub fn document_key(record_id: &str) -> String {
    uuid::Uuid::new_v5(&KEY_NAMESPACE, record_id.as_bytes()).to_string()
}

/// Converts a service relevance score back to cosine similarity.
pub fn cosine_from_score(score: f64) -> f64 {
    if score <= 0.0 {
        return -1.0;
    }
    (2.0 - 1.0 / score).clamp(-1.0, 1.0)
}

/// Quotes a string literal for an OData filter.
fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// OData filter for a tag filter, or `None` when it is empty.
fn filter_expression(filter: &MemoryFilter) -> Option<String> {
    if filter.is_empty() {
        return None;
    }
    Some(
        filter
            .pairs()
            .iter()
            .map(|(k, v)| format!("tags/any(t: t eq {})", odata_literal(&encode_tag(k, v))))
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

fn select_fields(include_vector: bool) -> &'static str {
    if include_vector {
        "id,payload,tags,embedding,timestamp"
    } else {
        "id,payload,tags,timestamp"
    }
}

fn index_definition(index: &IndexName, vector_size: usize) -> Value {
    json!({
        "name": index.as_str(),
        "fields": [
            { "name": "key", "type": "Edm.String", "key": true, "filterable": true },
            { "name": "id", "type": "Edm.String", "filterable": true, "sortable": true },
            { "name": "payload", "type": "Edm.String", "searchable": false },
            { "name": "tags", "type": "Collection(Edm.String)", "filterable": true, "searchable": false },
            {
                "name": "embedding",
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "retrievable": true,
                "dimensions": vector_size,
                "vectorSearchProfile": "vectormem-profile"
            },
            { "name": "timestamp", "type": "Edm.DateTimeOffset", "filterable": true, "sortable": true }
        ],
        "vectorSearch": {
            "algorithms": [{
                "name": "vectormem-exhaustive",
                "kind": "exhaustiveKnn",
                "exhaustiveKnnParameters": { "metric": "cosine" }
            }],
            "profiles": [{ "name": "vectormem-profile", "algorithm": "vectormem-exhaustive" }]
        }
    })
}

fn document_body(record: &MemoryRecord, action: &str) -> Result<Value> {
    let payload = serde_json::to_string(&record.payload)
        .map_err(|e| Error::operation("azure_search_encode_payload", e))?;
    let tags: Vec<String> = record.tags.pairs().map(|(k, v)| encode_tag(k, v)).collect();
    Ok(json!({
        "@search.action": action,
        "key": document_key(&record.id),
        "id": record.id,
        "payload": payload,
        "tags": tags,
        "embedding": record.vector.as_ref().map(Embedding::as_slice),
        "timestamp": record.timestamp.map(|t| t.to_rfc3339()),
    }))
}

fn decode_document(document: Document, include_vector: bool) -> Result<MemoryRecord> {
    let payload = match document.payload.as_deref() {
        Some(text) if !text.is_empty() => serde_json::from_str::<Payload>(text)
            .map_err(|e| Error::operation("azure_search_decode_payload", e))?,
        _ => Payload::new(),
    };
    let tags: TagCollection = document
        .tags
        .unwrap_or_default()
        .iter()
        .filter_map(|t| decode_tag(t))
        .collect();
    let vector = if include_vector {
        document.embedding.map(Embedding::new)
    } else {
        None
    };
    Ok(MemoryRecord {
        id: document.id,
        payload,
        tags,
        vector,
        timestamp: document.timestamp,
    })
}

fn parse_dimension_error(body: &str) -> Option<Error> {
    let caps = DIMENSION_ERROR.as_ref()?.captures(body)?;
    let expected = caps.get(1)?.as_str().parse().ok()?;
    let actual = caps.get(2)?.as_str().parse().ok()?;
    Some(Error::DimensionMismatch { expected, actual })
}

fn classify(index: &IndexName) -> impl FnOnce(StatusCode, &str) -> Option<Error> + Send + '_ {
    move |status, body| {
        if status == StatusCode::NOT_FOUND {
            return Some(Error::IndexNotFound {
                index: index.to_string(),
            });
        }
        parse_dimension_error(body)
    }
}

fn embedding_dimensions(definition: &IndexDefinition) -> Option<usize> {
    definition
        .fields
        .iter()
        .find(|f| f.name == "embedding")
        .and_then(|f| f.dimensions)
}

/// Moves the page's hits at or above `min_relevance` into `hits`.
///
/// Pages arrive best first, so a hit below the threshold means no later page
/// can contribute; returns false in that case.
fn take_relevant(
    page: Vec<Document>,
    min_relevance: f64,
    include_vector: bool,
    hits: &mut Vec<ScoredRecord>,
) -> Result<bool> {
    for document in page {
        let score = cosine_from_score(document.score.unwrap_or(0.0));
        if score < min_relevance {
            return Ok(false);
        }
        hits.push(ScoredRecord {
            record: decode_document(document, include_vector)?,
            score,
        });
    }
    Ok(true)
}

fn stream_of<T: Send + 'static>(
    items: Vec<T>,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = Result<T>> + Send>> {
    Box::pin(futures::stream::iter(items.into_iter().map(Ok::<_, Error>)))
}

impl AzureSearchVectorDb {
    /// Creates a client for the configured service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the endpoint or API key is missing.
    pub fn new(settings: &AzureSearchSettings) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::Configuration("azure_search.endpoint is not set".to_string()))?;
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| Error::Configuration("azure_search.api_key is not set".to_string()))?;

        Ok(Self {
            client: rest::build_client("azure_search_client")?,
            endpoint,
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let separator = if path.contains('?') { '&' } else { '?' };
        self.client
            .request(
                method,
                format!(
                    "{}{path}{separator}api-version={API_VERSION}",
                    self.endpoint
                ),
            )
            .header("api-key", self.api_key.expose_secret())
    }

    /// Fetches the index definition's vector size, `None` if the index is absent.
    async fn fetch_dimensions(&self, index: &IndexName) -> Result<Option<usize>> {
        let Some(response) = rest::send_optional(
            "azure_search_get_index",
            self.request(Method::GET, &format!("/indexes/{index}")),
            &[StatusCode::NOT_FOUND],
        )
        .await?
        else {
            return Ok(None);
        };
        let definition: IndexDefinition = rest::json("azure_search_get_index", response).await?;
        embedding_dimensions(&definition)
            .map(Some)
            .ok_or_else(|| {
                Error::operation(
                    "azure_search_get_index",
                    format!("index '{index}' has no embedding field"),
                )
            })
    }

    /// Vector size of an existing index.
    async fn require_dimensions(&self, index: &IndexName) -> Result<usize> {
        self.fetch_dimensions(index)
            .await?
            .ok_or_else(|| Error::IndexNotFound {
                index: index.to_string(),
            })
    }

    async fn search_page(&self, index: &IndexName, body: &Value) -> Result<SearchResponse> {
        let response = rest::send(
            "azure_search_query",
            self.request(Method::POST, &format!("/indexes/{index}/docs/search"))
                .json(body),
            classify(index),
        )
        .await?;
        rest::json("azure_search_query", response).await
    }

    async fn search_documents(&self, index: &IndexName, body: &Value) -> Result<Vec<Document>> {
        Ok(self.search_page(index, body).await?.value)
    }

    async fn document_count(&self, index: &IndexName) -> Result<usize> {
        let response = rest::send(
            "azure_search_count",
            self.request(Method::GET, &format!("/indexes/{index}/docs/$count")),
            classify(index),
        )
        .await?;
        let text = response
            .text()
            .await
            .map_err(|e| rest::transport_error("azure_search_count", &e))?;
        let text = text.trim().trim_start_matches('\u{feff}');
        text.parse()
            .map_err(|e| Error::operation("azure_search_count", format!("{e}: {text}")))
    }

    async fn lookup(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(LOOKUP_CHUNK) {
            let keys: Vec<String> = chunk.iter().map(|id| document_key(id)).collect();
            let body = json!({
                "search": "*",
                "filter": format!("search.in(key, '{}', ',')", keys.join(",")),
                "select": select_fields(include_vector),
                "top": chunk.len(),
            });
            for document in self.search_documents(index, &body).await? {
                records.push(decode_document(document, include_vector)?);
            }
        }
        Ok(records)
    }

    async fn index_documents(&self, index: &IndexName, documents: Vec<Value>) -> Result<()> {
        let response = rest::send(
            "azure_search_index_documents",
            self.request(Method::POST, &format!("/indexes/{index}/docs/index"))
                .json(&json!({ "value": documents })),
            classify(index),
        )
        .await?;
        let result: IndexingResponse =
            rest::json("azure_search_index_documents", response).await?;
        if let Some(failed) = result.value.iter().find(|r| !r.status) {
            let message = failed.error_message.clone().unwrap_or_default();
            return Err(parse_dimension_error(&message).unwrap_or_else(|| {
                Error::operation(
                    "azure_search_index_documents",
                    format!("document '{}': {message}", failed.key),
                )
            }));
        }
        Ok(())
    }

    async fn delete_keys(&self, index: &IndexName, ids: &[String]) -> Result<()> {
        let documents = ids
            .iter()
            .map(|id| json!({ "@search.action": "delete", "key": document_key(id) }))
            .collect();
        self.index_documents(index, documents).await
    }
}

#[async_trait]
impl VectorDb for AzureSearchVectorDb {
    fn backend_name(&self) -> &'static str {
        "azure_search"
    }

    async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()> {
        if let Some(existing) = self.fetch_dimensions(index).await? {
            if existing != vector_size {
                return Err(Error::DimensionMismatch {
                    expected: existing,
                    actual: vector_size,
                });
            }
            return Ok(());
        }

        rest::send(
            "azure_search_create_index",
            self.request(Method::PUT, &format!("/indexes/{index}"))
                .json(&index_definition(index, vector_size)),
            |_, _| None,
        )
        .await?;
        tracing::debug!(index = %index, vector_size, "Created Azure AI Search index");
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        let response = rest::send(
            "azure_search_list_indexes",
            self.request(Method::GET, "/indexes?$select=name"),
            |_, _| None,
        )
        .await?;
        let list: IndexList = rest::json("azure_search_list_indexes", response).await?;
        let mut names: Vec<String> = list.value.into_iter().map(|i| i.name).collect();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &IndexName) -> Result<()> {
        rest::send_optional(
            "azure_search_delete_index",
            self.request(Method::DELETE, &format!("/indexes/{index}")),
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String> {
        ensure_flat_tags(&record.tags)?;
        let expected = self.require_dimensions(index).await?;
        if let Some(vector) = &record.vector {
            vector.ensure_dimensions(expected)?;
        }
        self.index_documents(index, vec![document_body(record, "mergeOrUpload")?])
            .await?;
        Ok(record.id.clone())
    }

    async fn read(
        &self,
        index: &IndexName,
        id: &str,
        include_vector: bool,
    ) -> Result<Option<MemoryRecord>> {
        Ok(self
            .lookup(index, &[id.to_string()], include_vector)
            .await?
            .into_iter()
            .next())
    }

    async fn read_batch(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<RecordStream> {
        Ok(stream_of(self.lookup(index, ids, include_vector).await?))
    }

    async fn delete(&self, index: &IndexName, id: &str) -> Result<bool> {
        let ids = [id.to_string()];
        if self.lookup(index, &ids, false).await?.is_empty() {
            return Ok(false);
        }
        self.delete_keys(index, &ids).await?;
        Ok(true)
    }

    async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64> {
        let existing: Vec<String> = self
            .lookup(index, ids, false)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if existing.is_empty() {
            return Ok(0);
        }
        self.delete_keys(index, &existing).await?;
        Ok(existing.len() as u64)
    }

    async fn list(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<RecordStream> {
        let mut records = Vec::new();
        loop {
            let remaining = limit.map_or(PAGE_SIZE, |l| (l - records.len()).min(PAGE_SIZE));
            if remaining == 0 {
                break;
            }
            let mut body = json!({
                "search": "*",
                "select": select_fields(include_vector),
                "orderby": "timestamp desc, id asc",
                "top": remaining,
                "skip": records.len(),
            });
            if let Some(expression) = filter_expression(filter) {
                body["filter"] = Value::String(expression);
            }

            let page = self.search_documents(index, &body).await?;
            let fetched = page.len();
            for document in page {
                records.push(decode_document(document, include_vector)?);
            }
            if fetched < remaining {
                break;
            }
        }
        Ok(stream_of(records))
    }

    async fn search(
        &self,
        index: &IndexName,
        query: &Embedding,
        filter: &MemoryFilter,
        min_relevance: f64,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<ScoredRecordStream> {
        query.ensure_dimensions(self.require_dimensions(index).await?)?;

        let k = match limit {
            Some(limit) => limit,
            None => self.document_count(index).await?.max(1),
        };
        let mut body = json!({
            "select": select_fields(include_vector),
            "top": k.min(PAGE_SIZE),
            "vectorQueries": [{
                "kind": "vector",
                "vector": query.as_slice(),
                "fields": "embedding",
                "k": k,
                "exhaustive": true
            }],
            "vectorFilterMode": "preFilter",
        });
        if let Some(expression) = filter_expression(filter) {
            body["filter"] = Value::String(expression);
        }

        let mut hits = Vec::new();
        let mut next = Some(body);
        while let Some(request) = next.take() {
            let page = self.search_page(index, &request).await?;
            let fetched = page.value.len();
            let more = take_relevant(page.value, min_relevance, include_vector, &mut hits)?;
            if more && fetched > 0 && hits.len() < k {
                next = page.next_page;
            }
        }
        hits.truncate(k);
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(stream_of(hits))
    }
}
