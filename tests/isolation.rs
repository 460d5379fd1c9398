//! Universal invariant 1 (isolation): no user-scoped read API ever returns
//! another user's data, across every surface that exposes one.

use engram::memory_core::MemoryCore;
use engram::storage::Storage;
use engram::types::{
    CreateEntityInput, CreateMemoryInput, EmbeddingMode, MemoryType, RecallOptions, RecallStrategy, UpdateEntityInput,
};
use engram::embedding::{EmbeddingWorker, TfIdfEmbedder, VectorIndex};
use std::sync::Arc;

fn core() -> MemoryCore {
    let storage = Storage::open_in_memory().unwrap();
    let embedder = Arc::new(TfIdfEmbedder::new(32));
    let index = VectorIndex::new(32);
    let worker = EmbeddingWorker::new(storage.clone(), index.clone(), embedder.clone()).spawn();
    MemoryCore::new(storage, index, embedder, worker)
}

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
async fn get_memory_by_id_is_isolated() {
    let core = core();
    let created = core
        .add_memory("alice", memory_input("alice's secret plan"), EmbeddingMode::Disabled)
        .await
        .unwrap();

    assert!(core.get_memory("bob", &created.memory.id).unwrap().is_none());
    assert!(core.get_memory("alice", &created.memory.id).unwrap().is_some());
}

#[tokio::test]
async fn get_entity_by_id_is_isolated() {
    let core = core();
    let entity = core
        .store_entity("alice", CreateEntityInput { name: "Alice's Contact".into(), ..Default::default() })
        .unwrap();

    assert!(core.get_entity("bob", &entity.id).unwrap().is_none());
    assert!(core.get_entity("alice", &entity.id).unwrap().is_some());
}

#[tokio::test]
async fn update_entity_is_isolated() {
    let core = core();
    let entity = core
        .store_entity("alice", CreateEntityInput { name: "Alice's Contact".into(), ..Default::default() })
        .unwrap();

    let patch = UpdateEntityInput { name: Some("Hijacked".into()), ..Default::default() };
    let result = core.update_entity("bob", &entity.id, patch).unwrap();
    assert!(result.is_none());

    let still_alices = core.get_entity("alice", &entity.id).unwrap().unwrap();
    assert_eq!(still_alices.name, "Alice's Contact");
}

#[tokio::test]
async fn recall_memories_is_isolated_for_every_strategy() {
    let core = core();
    core.add_memory("alice", memory_input("secret plan"), EmbeddingMode::Sync).await.unwrap();
    core.add_memory("bob", memory_input("secret plan"), EmbeddingMode::Sync).await.unwrap();

    for strategy in [
        RecallStrategy::Similarity,
        RecallStrategy::Composite,
        RecallStrategy::Recency,
        RecallStrategy::Frequency,
        RecallStrategy::Importance,
    ] {
        let opts = RecallOptions { strategy, limit: 10, threshold: None, archived: None };
        let (results, _warnings) = core.recall_memories("alice", "secret", opts).unwrap();
        assert!(
            results.iter().all(|r| r.memory.user_id == "alice"),
            "strategy {strategy:?} leaked a cross-user result"
        );
    }
}

#[tokio::test]
async fn get_statistics_is_isolated() {
    let core = core();
    core.add_memory("alice", memory_input("one"), EmbeddingMode::Disabled).await.unwrap();
    core.add_memory("alice", memory_input("two"), EmbeddingMode::Disabled).await.unwrap();
    core.add_memory("bob", memory_input("three"), EmbeddingMode::Disabled).await.unwrap();

    let alice_stats = core.get_statistics("alice").unwrap();
    let bob_stats = core.get_statistics("bob").unwrap();
    assert_eq!(alice_stats.total_memories, 2);
    assert_eq!(bob_stats.total_memories, 1);
}

#[tokio::test]
async fn update_missing_embeddings_only_touches_the_calling_user() {
    let core = core();
    let alice_mem = core.add_memory("alice", memory_input("needs embedding"), EmbeddingMode::Disabled).await.unwrap();
    let bob_mem = core.add_memory("bob", memory_input("needs embedding too"), EmbeddingMode::Disabled).await.unwrap();

    core.update_missing_embeddings("alice").await;
    // give the worker's channel a tick to drain
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let alice_after = core.get_memory("alice", &alice_mem.memory.id).unwrap().unwrap();
    let bob_after = core.get_memory("bob", &bob_mem.memory.id).unwrap().unwrap();
    assert!(alice_after.embedding.is_some());
    assert!(bob_after.embedding.is_none());
}
