//! ctxmem benchmark suite.
//!
//! Targets:
//!   record_creation_single ............ < 10μs
//!   engine_scan_top5_from_1000 ........ < 1ms
//!   store_retrieve_top5_from_200 ...... < 5ms (the latency monitor budget)
//!   consolidation_500_with_duplicates . < 2ms

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use ctxmem_core::consolidation::ConsolidationEngine;
use ctxmem_core::retrieval::RetrievalEngine;
use ctxmem_core::session::SessionContext;
use ctxmem_core::{
    CtxMemConfig, MemoryQuery, MemoryRecord, MemoryStore, MemoryType, QueryOptions, StoreOptions,
};

const TOPICS: [&str; 5] = ["deploy", "billing", "onboarding", "incident", "roadmap"];

fn make_record(i: usize, context: &SessionContext) -> MemoryRecord {
    let topic = TOPICS[i % TOPICS.len()];
    #[allow(clippy::cast_precision_loss)]
    let importance = (i % 10) as f32 / 10.0;
    MemoryRecord::new(
        format!("Note {i} about the {topic} process"),
        MemoryType::Semantic,
        context,
    )
    .with_importance(importance)
    .with_tags([topic])
}

/// Benchmark: single record creation.
fn bench_record_creation(c: &mut Criterion) {
    let context = SessionContext::new(Some("bench".into()), None);
    c.bench_function("record_creation_single", |b| {
        b.iter(|| black_box(make_record(black_box(42), &context)));
    });
}

/// Benchmark: engine scan over 1000 in-memory records.
fn bench_engine_scan(c: &mut Criterion) {
    let context = SessionContext::new(None, None);
    let records: Vec<MemoryRecord> = (0..1000).map(|i| make_record(i, &context)).collect();
    let engine = RetrievalEngine::default();
    let query = MemoryQuery::new("deploy").with_limit(5);

    c.bench_function("engine_scan_top5_from_1000", |b| {
        b.iter(|| black_box(engine.scan(black_box(&records), black_box(&query))));
    });
}

/// Benchmark: full store retrieval over two backends.
fn bench_store_retrieval(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (store, session) = rt.block_on(async {
        let store = MemoryStore::from_config(CtxMemConfig::default())
            .await
            .expect("store");
        let session = store.create_session(None, None);
        for i in 0..200 {
            let topic = TOPICS[i % TOPICS.len()];
            store
                .store(
                    format!("Note {i} about the {topic} process"),
                    MemoryType::Semantic,
                    session,
                    StoreOptions {
                        tags: [topic.to_string()].into(),
                        ..StoreOptions::default()
                    },
                )
                .await
                .expect("store");
        }
        (store, session)
    });

    c.bench_function("store_retrieve_top5_from_200", |b| {
        b.to_async(&rt).iter(|| async {
            let options = QueryOptions {
                limit: Some(5),
                ..QueryOptions::default()
            };
            black_box(
                store
                    .retrieve(black_box("incident"), session, options)
                    .await
                    .expect("retrieve"),
            )
        });
    });
}

/// Benchmark: consolidation pass with every text duplicated five times.
fn bench_consolidation(c: &mut Criterion) {
    let context = SessionContext::new(None, None);
    let records: Vec<MemoryRecord> = (0..500)
        .map(|i| make_record(i % 100, &context))
        .collect();
    let engine = ConsolidationEngine::default();
    let now = chrono::Utc::now();

    c.bench_function("consolidation_500_with_duplicates", |b| {
        b.iter(|| black_box(engine.consolidate(black_box(records.clone()), now)));
    });
}

criterion_group!(
    benches,
    bench_record_creation,
    bench_engine_scan,
    bench_store_retrieval,
    bench_consolidation,
);
criterion_main!(benches);
