//! Benchmarks `recall_memories` at a few corpus sizes, across strategies.
//!
//! Grounded on the teacher's `benches/search.rs` (same `criterion` group /
//! `BenchmarkId` / `black_box` shape); memories are stored with
//! `EmbeddingMode::Sync` so the vector index is populated up front and the
//! benchmark measures recall itself, not backfill.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use engram::embedding::{EmbeddingWorker, TfIdfEmbedder, VectorIndex};
use engram::memory_core::MemoryCore;
use engram::storage::Storage;
use engram::types::{CreateMemoryInput, EmbeddingMode, MemoryType, RecallOptions, RecallStrategy};

const USER_ID: &str = "bench-user";

const SAMPLE_CONTENTS: &[&str] = &[
    "Authentication using JWT tokens and refresh mechanism",
    "Database migration strategy for PostgreSQL",
    "React component lifecycle and hooks optimization",
    "API rate limiting implementation with Redis",
    "Docker container orchestration with Kubernetes",
    "GraphQL schema design best practices",
    "Microservices communication patterns",
    "CI/CD pipeline configuration with GitHub Actions",
    "Memory leak detection in Node.js applications",
    "Rust ownership and borrowing concepts",
];

fn seeded_core(count: usize) -> MemoryCore {
    let storage = Storage::open_in_memory().unwrap();
    let embedder = Arc::new(TfIdfEmbedder::new(64));
    let index = VectorIndex::new(64);
    let worker = EmbeddingWorker::new(storage.clone(), index.clone(), embedder.clone()).spawn();
    let core = MemoryCore::new(storage, index, embedder, worker);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    for i in 0..count {
        let content = format!(
            "{} - variation {} with additional context about software development",
            SAMPLE_CONTENTS[i % SAMPLE_CONTENTS.len()],
            i
        );
        let input = CreateMemoryInput {
            title: String::new(),
            content,
            memory_type: MemoryType::Note,
            importance: (i % 10) as f32 / 10.0,
            tags: vec![format!("topic{}", i % 5)],
            entity_ids: Vec::new(),
            metadata: serde_json::json!({}),
        };
        runtime
            .block_on(core.add_memory(USER_ID, input, EmbeddingMode::Sync))
            .unwrap();
    }
    core
}

fn bench_recall(c: &mut Criterion) {
    let mut group = c.benchmark_group("recall_memories");

    for &corpus_size in &[100usize, 1_000, 5_000] {
        let core = seeded_core(corpus_size);

        for strategy in [RecallStrategy::Composite, RecallStrategy::Similarity, RecallStrategy::Recency] {
            let label = format!("{corpus_size}/{strategy:?}");
            group.bench_with_input(BenchmarkId::new("strategy", label), &strategy, |b, strategy| {
                let opts = RecallOptions { strategy: strategy.clone(), limit: 10, threshold: None, archived: None };
                b.iter(|| core.recall_memories(USER_ID, black_box("database migration Redis"), opts.clone()).unwrap())
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_recall);
criterion_main!(benches);
