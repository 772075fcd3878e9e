//! Benchmarks for nearest-neighbour search.
//!
//! Measures exact cosine search through the facade over the in-memory
//! backend at several index sizes, with and without a tag filter.

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::cast_precision_loss)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::Duration;
use vectormem::embedding::{Embedder, HashEmbedder};
use vectormem::storage::vector::InMemoryVectorDb;
use vectormem::{MemoryDb, MemoryFilter, MemoryRecord};

const DIMS: usize = 384;

/// Builds a populated index; every tenth record belongs to chat `c0`.
fn populate(rt: &tokio::runtime::Runtime, count: usize) -> MemoryDb {
    let embedder = HashEmbedder::new(DIMS);
    let db = MemoryDb::new(InMemoryVectorDb::new(), "default");
    rt.block_on(async {
        db.create_index("bench", DIMS as i64).await.expect("create");
        for i in 0..count {
            let text = format!("memory {i} about topic {} and detail {}", i % 17, i % 5);
            let record = MemoryRecord::new(format!("doc{}-{}", i / 10, i % 10))
                .with_tag("chatId", format!("c{}", i % 10))
                .with_payload("text", text.clone())
                .with_vector(embedder.embed(&text).expect("embed"));
            db.upsert("bench", record).await.expect("upsert");
        }
    });
    db
}

fn bench_search(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let query = HashEmbedder::new(DIMS)
        .embed("memory about topic 3 and detail 2")
        .expect("embed");

    let mut group = c.benchmark_group("search_nearest");
    group.measurement_time(Duration::from_secs(5));

    for size in [100usize, 1_000, 10_000] {
        let db = populate(&rt, size);
        let unfiltered = MemoryFilter::new();
        let chat = MemoryFilter::new().by_tag("chatId", "c0");

        group.bench_with_input(BenchmarkId::new("unfiltered", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let hits = db
                    .search_nearest_collect("bench", &query, &unfiltered, 0.0, 10, false)
                    .await
                    .expect("search");
                black_box(hits)
            });
        });

        group.bench_with_input(BenchmarkId::new("chat_filtered", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let hits = db
                    .search_nearest_collect("bench", &query, &chat, 0.0, 10, false)
                    .await
                    .expect("search");
                black_box(hits)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_search);
criterion_main!(benches);
