//! Facade contract tests against the in-memory backend.
//!
//! Every backend must satisfy these; the in-memory driver runs them without
//! external services. `postgresql_integration.rs` repeats the core of the
//! contract against a live database.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::float_cmp)]

use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vectormem::embedding::HashEmbedder;
use vectormem::services::{ServiceSet, tags};
use vectormem::storage::cancellable_stream;
use vectormem::storage::vector::InMemoryVectorDb;
use vectormem::{Embedding, Error, MemoryDb, MemoryFilter, MemoryRecord, StorageErrorKind};

fn db() -> MemoryDb {
    MemoryDb::new(InMemoryVectorDb::new(), "default")
}

fn record(id: &str, chat: &str, vector: [f32; 3]) -> MemoryRecord {
    MemoryRecord::new(id)
        .with_tag("chatId", chat)
        .with_payload("text", format!("chunk {id}"))
        .with_vector(Embedding::new(vector.to_vec()))
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_chat_scoped_search_scenario() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    db.upsert("docs", record("a-0", "c1", [1.0, 0.0, 0.0]))
        .await
        .expect("upsert a-0");
    db.upsert("docs", record("a-1", "c2", [0.0, 1.0, 0.0]))
        .await
        .expect("upsert a-1");

    let filter = MemoryFilter::new().by_tag("chatId", "c1");
    let hits = db
        .search_nearest_collect("docs", &Embedding::new(vec![1.0, 0.0, 0.0]), &filter, 0.0, 10, false)
        .await
        .expect("search");

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.id, "a-0");
    assert!((hits[0].score - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_round_trip_preserves_payload_and_tags() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    let original = record("r-0", "c1", [0.5, 0.5, 0.0])
        .with_tag("chatId", "c9")
        .with_payload("nested", serde_json::json!({ "a": [1, 2, 3] }));
    db.upsert("docs", original.clone()).await.expect("upsert");

    let without = db
        .read("docs", "r-0", false)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(without.id, original.id);
    assert_eq!(without.payload, original.payload);
    assert_eq!(without.tags, original.tags);
    assert!(without.vector.is_none());
    assert!(without.timestamp.is_some());

    let with = db
        .read("docs", "r-0", true)
        .await
        .expect("read")
        .expect("present");
    assert_eq!(with.vector, original.vector);
}

#[tokio::test]
async fn test_upsert_replaces_by_id() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    db.upsert("docs", record("x", "c1", [1.0, 0.0, 0.0]).with_payload("v", 1))
        .await
        .expect("first");
    db.upsert("docs", record("x", "c1", [1.0, 0.0, 0.0]).with_payload("v", 2))
        .await
        .expect("second");

    let all = db
        .list_collect("docs", &MemoryFilter::new(), -1, false)
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].payload.get("v"), Some(&serde_json::json!(2)));
}

#[tokio::test]
async fn test_upsert_overwrites_caller_timestamp() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    let stale = chrono::Utc::now() - chrono::Duration::days(30);
    db.upsert("docs", record("t", "c1", [1.0, 0.0, 0.0]).with_timestamp(stale))
        .await
        .expect("upsert");
    let stored = db
        .read("docs", "t", false)
        .await
        .expect("read")
        .expect("present");
    assert!(stored.timestamp.expect("timestamp") > stale);
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_list_is_newest_first_and_limited() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    for id in ["first", "second", "third"] {
        db.upsert("docs", record(id, "c1", [1.0, 0.0, 0.0]))
            .await
            .expect("upsert");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let all = db
        .list_collect("docs", &MemoryFilter::new(), 0, false)
        .await
        .expect("list");
    let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["third", "second", "first"]);

    let limited = db
        .list_collect("docs", &MemoryFilter::new(), 2, false)
        .await
        .expect("list");
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, "third");
}

#[tokio::test]
async fn test_filter_uses_set_membership_and_and() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    db.upsert(
        "docs",
        record("shared", "c1", [1.0, 0.0, 0.0])
            .with_tag("chatId", "c2")
            .with_tag("memory", "DocumentMemory"),
    )
    .await
    .expect("upsert shared");
    db.upsert("docs", record("only-c1", "c1", [0.0, 1.0, 0.0]))
        .await
        .expect("upsert only-c1");

    let c2 = MemoryFilter::new().by_tag("chatId", "c2");
    let hits = db.list_collect("docs", &c2, -1, false).await.expect("list");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "shared");

    let both = MemoryFilter::new()
        .by_tag("chatId", "c1")
        .by_tag("memory", "DocumentMemory");
    let hits = db.list_collect("docs", &both, -1, false).await.expect("list");
    assert_eq!(hits.len(), 1);

    let none = MemoryFilter::new().by_tag("memory", "Other");
    assert!(db.list_collect("docs", &none, -1, false).await.expect("list").is_empty());
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_orders_by_similarity_and_applies_threshold() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    db.upsert("docs", record("same", "c1", [1.0, 0.0, 0.0])).await.expect("same");
    db.upsert("docs", record("close", "c1", [1.0, 1.0, 0.0])).await.expect("close");
    db.upsert("docs", record("orthogonal", "c1", [0.0, 0.0, 1.0])).await.expect("orthogonal");
    db.upsert("docs", record("opposite", "c1", [-1.0, 0.0, 0.0])).await.expect("opposite");

    let query = Embedding::new(vec![1.0, 0.0, 0.0]);
    let all = db
        .search_nearest_collect("docs", &query, &MemoryFilter::new(), -1.0, -1, false)
        .await
        .expect("search");
    let ids: Vec<_> = all.iter().map(|h| h.record.id.as_str()).collect();
    assert_eq!(ids, vec!["same", "close", "orthogonal", "opposite"]);
    assert!(all.windows(2).all(|w| w[0].score >= w[1].score));

    let relevant = db
        .search_nearest_collect("docs", &query, &MemoryFilter::new(), 0.5, -1, false)
        .await
        .expect("search");
    assert_eq!(relevant.len(), 2);
    assert!(relevant.iter().all(|h| h.score >= 0.5));

    let top = db
        .search_nearest_collect("docs", &query, &MemoryFilter::new(), -1.0, 1, true)
        .await
        .expect("search");
    assert_eq!(top.len(), 1);
    assert!(top[0].record.vector.is_some());
}

#[tokio::test]
async fn test_search_dimension_mismatch() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    let result = db
        .search_nearest("docs", &Embedding::new(vec![1.0, 0.0]), &MemoryFilter::new(), 0.0, 10, false)
        .await;
    assert!(matches!(
        result.map(|_| ()),
        Err(Error::DimensionMismatch { expected: 3, actual: 2 })
    ));

    let upsert = db
        .upsert("docs", MemoryRecord::new("bad").with_vector(Embedding::new(vec![1.0])))
        .await;
    assert!(matches!(upsert, Err(Error::DimensionMismatch { .. })));
}

// ============================================================================
// Index lifecycle and error taxonomy
// ============================================================================

#[tokio::test]
async fn test_index_lifecycle() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    db.create_index("DOCS", 3).await.expect("idempotent create");
    db.create_index("notes", 3).await.expect("create notes");

    let mut names = db.list_indexes().await.expect("list");
    names.sort();
    assert_eq!(names, vec!["docs".to_string(), "notes".to_string()]);

    db.delete_index("notes").await.expect("delete");
    db.delete_index("notes").await.expect("delete absent is a no-op");
    assert_eq!(db.list_indexes().await.expect("list"), vec!["docs".to_string()]);
}

#[tokio::test]
async fn test_default_index_is_protected() {
    let db = db();
    db.create_index("default", 3).await.expect("create");
    db.delete_index("Default").await.expect("no-op");
    assert!(db.list_indexes().await.expect("list").contains(&"default".to_string()));
}

#[tokio::test]
async fn test_invalid_vector_size_is_configuration_error() {
    let db = db();
    let err = db.create_index("docs", 0).await.expect_err("zero size");
    assert_eq!(err.kind(), StorageErrorKind::Configuration);
    let err = db.create_index("docs", -5).await.expect_err("negative size");
    assert_eq!(err.kind(), StorageErrorKind::Configuration);
}

#[tokio::test]
async fn test_missing_index_fails_fast() {
    let db = db();
    let list = db.list("ghost", &MemoryFilter::new(), -1, false).await;
    assert!(matches!(list.map(|_| ()), Err(Error::IndexNotFound { .. })));

    let search = db
        .search_nearest("ghost", &Embedding::new(vec![1.0]), &MemoryFilter::new(), 0.0, 1, false)
        .await;
    assert!(matches!(search.map(|_| ()), Err(Error::IndexNotFound { .. })));

    let upsert = db.upsert("ghost", record("a", "c1", [1.0, 0.0, 0.0])).await;
    assert!(matches!(upsert, Err(Error::IndexNotFound { .. })));
}

#[tokio::test]
async fn test_absent_record_reads_and_deletes_are_quiet() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    assert!(db.read("docs", "nope", false).await.expect("read").is_none());
    db.delete("docs", "nope").await.expect("delete absent");
}

#[tokio::test]
async fn test_invalid_inputs() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    assert!(matches!(
        db.upsert("docs", MemoryRecord::new("no-vector")).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        db.upsert("docs", record(" ", "c1", [1.0, 0.0, 0.0])).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        db.create_index("bad name!", 3).await,
        Err(Error::InvalidInput(_))
    ));
}

// ============================================================================
// Batch operations and streams
// ============================================================================

#[tokio::test]
async fn test_batch_read_and_delete() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    for id in ["d-0", "d-1", "d-2"] {
        db.upsert("docs", record(id, "c1", [1.0, 0.0, 0.0])).await.expect("upsert");
    }

    let ids = vec!["d-0".to_string(), "d-2".to_string(), "missing".to_string()];
    let mut found: Vec<String> = db
        .read_batch("docs", &ids, false)
        .await
        .expect("read batch")
        .map_ok(|r| r.id)
        .try_collect()
        .await
        .expect("collect");
    found.sort();
    assert_eq!(found, vec!["d-0".to_string(), "d-2".to_string()]);

    assert_eq!(db.delete_batch("docs", &ids).await.expect("delete"), 2);
    assert_eq!(db.delete_batch("docs", &[]).await.expect("empty"), 0);
    let left = db
        .list_collect("docs", &MemoryFilter::new(), -1, false)
        .await
        .expect("list");
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn test_cancelled_list_stream_stops_with_cancelled() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    for i in 0..5 {
        db.upsert("docs", record(&format!("s-{i}"), "c1", [1.0, 0.0, 0.0]))
            .await
            .expect("upsert");
    }

    let token = CancellationToken::new();
    let stream = db
        .list("docs", &MemoryFilter::new(), -1, false)
        .await
        .expect("list");
    let mut stream = cancellable_stream(token.clone(), stream);

    assert!(stream.next().await.expect("first item").is_ok());
    token.cancel();
    assert!(matches!(stream.next().await, Some(Err(Error::Cancelled))));
    assert!(stream.next().await.is_none());

    // The index stays usable after an abandoned stream.
    assert_eq!(
        db.list_collect("docs", &MemoryFilter::new(), -1, false)
            .await
            .expect("list")
            .len(),
        5
    );
}

#[tokio::test]
async fn test_concurrent_upserts_last_writer_wins() {
    let db = db();
    db.create_index("docs", 3).await.expect("create");
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let db = db.clone();
            tokio::spawn(async move {
                db.upsert("docs", record("hot", "c1", [1.0, 0.0, 0.0]).with_payload("n", i))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("upsert");
    }
    let all = db
        .list_collect("docs", &MemoryFilter::new(), -1, false)
        .await
        .expect("list");
    assert_eq!(all.len(), 1);
}

// ============================================================================
// Services end to end
// ============================================================================

#[tokio::test]
async fn test_ingest_search_and_remove_chat() {
    let services = ServiceSet::new(db(), Arc::new(HashEmbedder::new(64)), 40);

    let report = services
        .ingest
        .store_document(
            "kb",
            "handbook",
            "c1",
            "DocumentMemory",
            "handbook.txt",
            "Vacation requests go to your manager. Expenses are filed monthly. Laptops are replaced every three years.",
        )
        .await
        .expect("ingest");
    assert!(report.record_ids.len() >= 2);

    services
        .ingest
        .store_memory("kb", "c2", "WorkingMemory", "Unrelated chat memory")
        .await
        .expect("memory");

    let result = services
        .search
        .search_memories("kb", "Expenses are filed monthly.", -1.0, -1, "c1", Some("DocumentMemory"))
        .await
        .expect("search");
    assert_eq!(result.len(), report.record_ids.len());
    assert!(result.results.iter().all(|hit| hit.document_id == "handbook"));
    assert!(result.results.iter().all(|hit| hit.link.starts_with("handbook/")));
    assert_eq!(result.results[0].source_name.as_deref(), Some("handbook.txt"));

    let removal = services
        .search
        .remove_chat_memories("kb", "c1")
        .await
        .expect("remove");
    assert_eq!(removal.documents, 1);
    assert_eq!(removal.records, report.record_ids.len() as u64);

    let remaining = services
        .db
        .list_collect("kb", &MemoryFilter::new(), -1, false)
        .await
        .expect("list");
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].tags.contains(tags::CHAT_ID, "c2"));
}
