//! Qdrant vector database (REST API).
//!
//! One collection per index, cosine distance. Qdrant point ids must be
//! unsigned integers or UUIDs, so each record id is mapped to a UUID v5 and
//! the original id is kept in the point payload:
//!
//! ```json
//! {
//!   "id": "doc-1-0",
//!   "payload": { "text": "..." },
//!   "tags": ["chatId:c1", "memory:DocumentMemory"],
//!   "timestamp": "2024-01-01T00:00:00Z"
//! }
//! ```
//!
//! A tag filter becomes one `must` keyword match per pair against the `tags`
//! array, which matches when any element equals the pair.
//!
//! Listing scrolls in `timestamp` order through the datetime payload index,
//! so a limited list reads only the points it returns. Search pages with
//! `offset` instead of sizing one request from the collection's point count.

use super::rest::{self, decode_tag, encode_tag, ensure_flat_tags};
use crate::config::QdrantSettings;
use crate::models::{
    Embedding, IndexName, MemoryFilter, MemoryRecord, Payload, ScoredRecord, TagCollection,
};
use crate::storage::traits::{RecordStream, ScoredRecordStream, VectorDb};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Points requested per scroll or search page.
const PAGE_SIZE: usize = 256;

/// Namespace for record id → point id mapping.
const POINT_ID_NAMESPACE: uuid::Uuid = uuid::Uuid::NAMESPACE_URL;

/// `Vector dimension error: expected dim: 3, got 2`.
static DIMENSION_ERROR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"expected dim: (\d+), got (\d+)").ok());

/// Qdrant vector database.
pub struct QdrantVectorDb {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionList {
    collections: Vec<CollectionName>,
}

#[derive(Debug, Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct Point {
    #[serde(default)]
    payload: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f64,
    #[serde(flatten)]
    point: Point,
}

#[derive(Debug, Deserialize)]
struct ScrollPage {
    points: Vec<Point>,
}

/// Maps a record id onto its Qdrant point id.
pub fn point_id(record_id: &str) -> String {
    uuid::Uuid::new_v5(&POINT_ID_NAMESPACE, record_id.as_bytes()).to_string()
}

fn parse_dimension_error(body: &str) -> Option<Error> {
    let caps = DIMENSION_ERROR.as_ref()?.captures(body)?;
    let expected = caps.get(1)?.as_str().parse().ok()?;
    let actual = caps.get(2)?.as_str().parse().ok()?;
    Some(Error::DimensionMismatch { expected, actual })
}

/// Error classification for requests addressed to one collection.
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

/// Qdrant filter for a tag filter, or `None` when it is empty.
fn filter_body(filter: &MemoryFilter) -> Option<Value> {
    if filter.is_empty() {
        return None;
    }
    let must: Vec<Value> = filter
        .pairs()
        .iter()
        .map(|(k, v)| json!({ "key": "tags", "match": { "value": encode_tag(k, v) } }))
        .collect();
    Some(json!({ "must": must }))
}

fn point_body(record: &MemoryRecord) -> Value {
    let tags: Vec<String> = record.tags.pairs().map(|(k, v)| encode_tag(k, v)).collect();
    let vector = record
        .vector
        .as_ref()
        .map(|v| v.as_slice().to_vec())
        .unwrap_or_default();
    json!({
        "id": point_id(&record.id),
        "vector": vector,
        "payload": {
            "id": record.id,
            "payload": Value::Object(record.payload.clone()),
            "tags": tags,
            "timestamp": record.timestamp.map(|t| t.to_rfc3339()),
        }
    })
}

fn decode_point(point: Point, include_vector: bool) -> Result<MemoryRecord> {
    let mut body = point.payload.unwrap_or_default();
    let id = match body.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(Error::operation("qdrant_decode", "point payload has no record id")),
    };
    let payload = match body.remove("payload") {
        Some(Value::Object(map)) => map,
        _ => Payload::new(),
    };
    let tags: TagCollection = match body.remove("tags") {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .filter_map(decode_tag)
            .collect(),
        _ => TagCollection::new(),
    };
    let timestamp = match body.remove("timestamp") {
        Some(Value::String(t)) => Some(
            DateTime::parse_from_rfc3339(&t)
                .map_err(|e| Error::operation("qdrant_decode_timestamp", e))?
                .with_timezone(&Utc),
        ),
        _ => None,
    };
    let vector = if include_vector {
        point.vector.map(Embedding::new)
    } else {
        None
    };

    Ok(MemoryRecord {
        id,
        payload,
        tags,
        vector,
        timestamp,
    })
}

/// Scroll request ordered by the `timestamp` payload index, newest first,
/// starting at `cursor` (inclusive) when given.
fn scroll_body(
    filter: &MemoryFilter,
    include_vector: bool,
    limit: usize,
    cursor: Option<DateTime<Utc>>,
) -> Value {
    let mut order_by = json!({ "key": "timestamp", "direction": "desc" });
    if let Some(cursor) = cursor {
        order_by["start_from"] = Value::String(cursor.to_rfc3339());
    }
    let mut body = json!({
        "limit": limit,
        "order_by": order_by,
        "with_payload": true,
        "with_vector": include_vector,
    });
    if let Some(filter) = filter_body(filter) {
        body["filter"] = filter;
    }
    body
}

fn search_body(
    query: &Embedding,
    filter: &MemoryFilter,
    min_relevance: f64,
    limit: usize,
    offset: usize,
    include_vector: bool,
) -> Value {
    let mut body = json!({
        "vector": query.as_slice(),
        "limit": limit,
        "offset": offset,
        "score_threshold": min_relevance,
        "with_payload": true,
        "with_vector": include_vector,
    });
    if let Some(filter) = filter_body(filter) {
        body["filter"] = filter;
    }
    body
}

fn newest_first(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
}

impl QdrantVectorDb {
    /// Creates a client for the configured endpoint.
    ///
    /// No request is made until the first operation.
    pub fn new(settings: &QdrantSettings) -> Result<Self> {
        let endpoint = settings.endpoint.trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::Configuration(
                "qdrant.endpoint is not set".to_string(),
            ));
        }
        Ok(Self {
            client: rest::build_client("qdrant_client")?,
            endpoint,
            api_key: settings.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.endpoint));
        match &self.api_key {
            Some(key) => builder.header("api-key", key.expose_secret()),
            None => builder,
        }
    }

    async fn collection_info(&self, index: &IndexName) -> Result<Option<CollectionInfo>> {
        let Some(response) = rest::send_optional(
            "qdrant_collection_info",
            self.request(reqwest::Method::GET, &format!("/collections/{index}")),
            &[StatusCode::NOT_FOUND],
        )
        .await?
        else {
            return Ok(None);
        };
        let info: Envelope<CollectionInfo> =
            rest::json("qdrant_collection_info", response).await?;
        Ok(Some(info.result))
    }

    async fn require_collection(&self, index: &IndexName) -> Result<CollectionInfo> {
        self.collection_info(index)
            .await?
            .ok_or_else(|| Error::IndexNotFound {
                index: index.to_string(),
            })
    }

    async fn create_payload_index(&self, index: &IndexName, field: &str, schema: &str) -> Result<()> {
        rest::send(
            "qdrant_create_payload_index",
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{index}/index?wait=true"),
            )
            .json(&json!({ "field_name": field, "field_schema": schema })),
            classify(index),
        )
        .await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        index: &IndexName,
        ids: &[String],
        include_vector: bool,
    ) -> Result<Vec<MemoryRecord>> {
        let point_ids: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        let response = rest::send(
            "qdrant_retrieve",
            self.request(reqwest::Method::POST, &format!("/collections/{index}/points"))
                .json(&json!({
                    "ids": point_ids,
                    "with_payload": true,
                    "with_vector": include_vector,
                })),
            classify(index),
        )
        .await?;
        let points: Envelope<Vec<Point>> = rest::json("qdrant_retrieve", response).await?;
        points
            .result
            .into_iter()
            .map(|p| decode_point(p, include_vector))
            .collect()
    }

    async fn delete_points(&self, index: &IndexName, ids: &[String]) -> Result<()> {
        let point_ids: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        rest::send(
            "qdrant_delete",
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{index}/points/delete?wait=true"),
            )
            .json(&json!({ "points": point_ids })),
            classify(index),
        )
        .await?;
        Ok(())
    }

    async fn scroll_page(&self, index: &IndexName, body: &Value) -> Result<Vec<Point>> {
        let response = rest::send(
            "qdrant_scroll",
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{index}/points/scroll"),
            )
            .json(body),
            classify(index),
        )
        .await?;
        let page: Envelope<ScrollPage> = rest::json("qdrant_scroll", response).await?;
        Ok(page.result.points)
    }

    /// Scrolls matching points newest first, stopping at `limit`.
    ///
    /// Ordered scrolls have no offset, so each page restarts at the last
    /// timestamp seen and skips the ids already taken at that timestamp.
    /// Points without a timestamp are not returned by an ordered scroll;
    /// every upsert stamps one.
    async fn scroll_newest_first(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<Vec<MemoryRecord>> {
        let mut records: Vec<MemoryRecord> = Vec::new();
        let mut cursor: Option<DateTime<Utc>> = None;
        let mut taken_at_cursor: HashSet<String> = HashSet::new();
        let mut page_size = PAGE_SIZE;
        loop {
            let wanted = limit.map_or(page_size, |l| (l - records.len()).min(page_size));
            let request = wanted + taken_at_cursor.len();
            let points = self
                .scroll_page(index, &scroll_body(filter, include_vector, request, cursor))
                .await?;
            let fetched = points.len();

            let mut progressed = false;
            for point in points {
                let record = decode_point(point, include_vector)?;
                if record.timestamp == cursor && taken_at_cursor.contains(&record.id) {
                    continue;
                }
                if record.timestamp != cursor {
                    taken_at_cursor.clear();
                    cursor = record.timestamp;
                }
                taken_at_cursor.insert(record.id.clone());
                records.push(record);
                progressed = true;
                if limit.is_some_and(|l| records.len() >= l) {
                    return Ok(records);
                }
            }

            if fetched < request {
                return Ok(records);
            }
            if !progressed {
                // One timestamp fills the whole page.
                page_size = page_size.saturating_mul(2);
            }
        }
    }
}

#[async_trait]
impl VectorDb for QdrantVectorDb {
    fn backend_name(&self) -> &'static str {
        "qdrant"
    }

    async fn create_index(&self, index: &IndexName, vector_size: usize) -> Result<()> {
        if let Some(info) = self.collection_info(index).await? {
            let existing = info.config.params.vectors.size;
            if existing != vector_size {
                return Err(Error::DimensionMismatch {
                    expected: existing,
                    actual: vector_size,
                });
            }
            return Ok(());
        }

        // 409: created concurrently by another caller.
        rest::send_optional(
            "qdrant_create_collection",
            self.request(reqwest::Method::PUT, &format!("/collections/{index}"))
                .json(&json!({ "vectors": { "size": vector_size, "distance": "Cosine" } })),
            &[StatusCode::CONFLICT],
        )
        .await?;

        self.create_payload_index(index, "tags", "keyword").await?;
        self.create_payload_index(index, "timestamp", "datetime")
            .await?;
        tracing::debug!(index = %index, vector_size, "Created Qdrant collection");
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<String>> {
        let response = rest::send(
            "qdrant_list_collections",
            self.request(reqwest::Method::GET, "/collections"),
            |_, _| None,
        )
        .await?;
        let list: Envelope<CollectionList> =
            rest::json("qdrant_list_collections", response).await?;
        let mut names: Vec<String> = list.result.collections.into_iter().map(|c| c.name).collect();
        names.sort();
        Ok(names)
    }

    async fn delete_index(&self, index: &IndexName) -> Result<()> {
        rest::send_optional(
            "qdrant_delete_collection",
            self.request(reqwest::Method::DELETE, &format!("/collections/{index}")),
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, index: &IndexName, record: &MemoryRecord) -> Result<String> {
        ensure_flat_tags(&record.tags)?;
        rest::send(
            "qdrant_upsert",
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{index}/points?wait=true"),
            )
            .json(&json!({ "points": [point_body(record)] })),
            classify(index),
        )
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
            .retrieve(index, &[id.to_string()], include_vector)
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
        let records = self.retrieve(index, ids, include_vector).await?;
        Ok(Box::pin(futures::stream::iter(
            records.into_iter().map(Ok::<_, Error>),
        )))
    }

    async fn delete(&self, index: &IndexName, id: &str) -> Result<bool> {
        let ids = [id.to_string()];
        if self.retrieve(index, &ids, false).await?.is_empty() {
            return Ok(false);
        }
        self.delete_points(index, &ids).await?;
        Ok(true)
    }

    async fn delete_batch(&self, index: &IndexName, ids: &[String]) -> Result<u64> {
        let existing: Vec<String> = self
            .retrieve(index, ids, false)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        if existing.is_empty() {
            return Ok(0);
        }
        self.delete_points(index, &existing).await?;
        Ok(existing.len() as u64)
    }

    async fn list(
        &self,
        index: &IndexName,
        filter: &MemoryFilter,
        limit: Option<usize>,
        include_vector: bool,
    ) -> Result<RecordStream> {
        let mut records = self
            .scroll_newest_first(index, filter, limit, include_vector)
            .await?;
        newest_first(&mut records);
        Ok(Box::pin(futures::stream::iter(
            records.into_iter().map(Ok::<_, Error>),
        )))
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
        let info = self.require_collection(index).await?;
        query.ensure_dimensions(info.config.params.vectors.size)?;

        // Pages until the service returns a short page; the score threshold
        // ends an unbounded search.
        let mut hits = Vec::new();
        let mut offset = 0;
        loop {
            let request = limit.map_or(PAGE_SIZE, |l| (l - hits.len()).min(PAGE_SIZE));
            if request == 0 {
                break;
            }
            let body = search_body(query, filter, min_relevance, request, offset, include_vector);
            let response = rest::send(
                "qdrant_search",
                self.request(
                    reqwest::Method::POST,
                    &format!("/collections/{index}/points/search"),
                )
                .json(&body),
                classify(index),
            )
            .await?;
            let points: Envelope<Vec<ScoredPoint>> =
                rest::json("qdrant_search", response).await?;
            let fetched = points.result.len();
            offset += fetched;
            for point in points.result.into_iter().filter(|p| p.score >= min_relevance) {
                hits.push(ScoredRecord {
                    record: decode_point(point.point, include_vector)?,
                    score: point.score,
                });
            }
            if fetched < request {
                break;
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        Ok(Box::pin(futures::stream::iter(
            hits.into_iter().map(Ok::<_, Error>),
        )))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_is_stable_uuid() {
        let a = point_id("doc-1-0");
        assert_eq!(a, point_id("doc-1-0"));
        assert_ne!(a, point_id("doc-1-1"));
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_filter_body() {
        assert!(filter_body(&MemoryFilter::new()).is_none());
        let filter = MemoryFilter::new().by_tag("chatId", "c1");
        assert_eq!(
            filter_body(&filter),
            Some(json!({ "must": [{ "key": "tags", "match": { "value": "chatId:c1" } }] }))
        );
    }

    #[test]
    fn test_scroll_body_orders_by_timestamp() {
        let filter = MemoryFilter::new().by_tag("chatId", "c1");
        let first = scroll_body(&filter, false, 10, None);
        assert_eq!(first["limit"], 10);
        assert_eq!(first["order_by"], json!({ "key": "timestamp", "direction": "desc" }));
        assert!(first["filter"]["must"].is_array());

        let cursor = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let next = scroll_body(&MemoryFilter::new(), true, 5, Some(cursor));
        assert_eq!(next["order_by"]["start_from"], cursor.to_rfc3339());
        assert_eq!(next["with_vector"], true);
        assert!(next.get("filter").is_none());
    }

    #[test]
    fn test_search_body_pages_with_offset() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let body = search_body(&query, &MemoryFilter::new(), 0.25, 256, 512, false);
        assert_eq!(body["limit"], 256);
        assert_eq!(body["offset"], 512);
        assert_eq!(body["score_threshold"], 0.25);
        assert!(body.get("filter").is_none());
    }

    #[test]
    fn test_point_body_and_decode() {
        let ts = Utc::now();
        let record = MemoryRecord::new("doc-1-0")
            .with_payload("text", "hello")
            .with_tag("chatId", "c1")
            .with_vector(vec![1.0f32, 0.0])
            .with_timestamp(ts);
        let body = point_body(&record);
        assert_eq!(body["payload"]["tags"], json!(["chatId:c1"]));

        let point: Point = serde_json::from_value(json!({
            "payload": body["payload"],
            "vector": body["vector"],
        }))
        .expect("point");
        let decoded = decode_point(point, true).expect("decode");
        assert_eq!(decoded.id, "doc-1-0");
        assert!(decoded.tags.contains("chatId", "c1"));
        assert_eq!(decoded.payload["text"], "hello");
        assert_eq!(decoded.vector, Some(Embedding::new(vec![1.0, 0.0])));
        assert_eq!(
            decoded.timestamp.map(|t| t.timestamp_millis()),
            Some(ts.timestamp_millis())
        );
    }

    #[test]
    fn test_decode_without_vector() {
        let point: Point = serde_json::from_value(json!({
            "payload": { "id": "a", "tags": [] },
            "vector": [1.0, 2.0],
        }))
        .expect("point");
        let decoded = decode_point(point, false).expect("decode");
        assert!(decoded.vector.is_none());
        assert!(decoded.timestamp.is_none());
    }

    #[test]
    fn test_parse_dimension_error() {
        let body = r#"{"status":{"error":"Wrong input: Vector dimension error: expected dim: 3, got 2"}}"#;
        assert!(matches!(
            parse_dimension_error(body),
            Some(Error::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(parse_dimension_error("not found").is_none());
    }

    #[test]
    fn test_new_rejects_empty_endpoint() {
        let settings = QdrantSettings {
            endpoint: String::new(),
            api_key: None,
        };
        assert!(matches!(
            QdrantVectorDb::new(&settings),
            Err(Error::Configuration(_))
        ));
    }
}
