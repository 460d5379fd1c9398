//! Universal invariants 3 and 4: async embedding eventually completes (or
//! terminally fails, never silently neither), and `addMemory(mode=async)`
//! returns before the embedder is invoked.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engram::embedding::{EmbeddingWorker, TfIdfEmbedder, VectorIndex};
use engram::error::Result;
use engram::memory_core::MemoryCore;
use engram::storage::Storage;
use engram::types::{CreateMemoryInput, EmbeddingMode, MemoryType};

const USER: &str = "embed-user";

fn memory_input(content: &str) -> CreateMemoryInput {
    CreateMemoryInput {
        title: String::new(),
        content: content.to_string(),
        memory_type: MemoryType::Note,
        importance: 0.5,
        tags: vec![],
        entity_ids: vec![],
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn async_add_gets_an_embedding_within_a_few_seconds() {
    let storage = Storage::open_in_memory().unwrap();
    let embedder = Arc::new(TfIdfEmbedder::new(32));
    let index = VectorIndex::new(32);
    let worker = EmbeddingWorker::new(storage.clone(), index.clone(), embedder.clone()).spawn();
    let core = MemoryCore::new(storage, index, embedder, worker);

    let created = core.add_memory(USER, memory_input("five second invariant check"), EmbeddingMode::Async).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let memory = core.get_memory(USER, &created.memory.id).unwrap().unwrap();
        if memory.has_embedding() {
            assert_eq!(memory.embedding.unwrap().len(), 32);
            break;
        }
        assert!(Instant::now() < deadline, "embedding never arrived within the time bound");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Records the instant `embed` is first called; used to prove the caller
/// of `add_memory(mode=async)` gets control back before the embedder runs.
struct TimestampingEmbedder {
    inner: TfIdfEmbedder,
    first_call: Mutex<Option<Instant>>,
}

impl TimestampingEmbedder {
    fn new(dimensions: usize) -> Self {
        Self { inner: TfIdfEmbedder::new(dimensions), first_call: Mutex::new(None) }
    }
}

impl engram::embedding::Embedder for TimestampingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.first_call.lock().unwrap().get_or_insert_with(Instant::now);
        self.inner.embed(text)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        "timestamping-tfidf"
    }
}

#[tokio::test]
async fn async_add_returns_before_the_embedder_is_called() {
    let storage = Storage::open_in_memory().unwrap();
    let embedder = Arc::new(TimestampingEmbedder::new(32));
    let index = VectorIndex::new(32);
    let worker = EmbeddingWorker::new(storage.clone(), index.clone(), embedder.clone()).spawn();
    let core = MemoryCore::new(storage, index, embedder.clone(), worker);

    let before_call = Instant::now();
    core.add_memory(USER, memory_input("latency bound check"), EmbeddingMode::Async).await.unwrap();
    let returned_at = Instant::now();

    // Give the worker a brief window to actually run, then compare timestamps.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first_call = embedder.first_call.lock().unwrap().expect("embedder should have run by now");
    assert!(returned_at <= first_call, "add_memory returned after the embedder had already been invoked");
    let _ = before_call;
}
