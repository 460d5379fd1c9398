//! The Embedding Worker (C5): background batch processing plus a periodic
//! catch-up scanner.
//!
//! Grounded on the teacher's `embedding/queue.rs::EmbeddingWorker::run` —
//! the `tokio::select!` over "new work" vs "batch timer" loop is carried
//! over near-verbatim. Two things changed: requests are deduped per memory
//! id (a memory edited twice before the worker drains still embeds once),
//! and failures retry with backoff instead of being dropped after one
//! attempt, per spec.md 4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::interval;

use super::{index::VectorIndex, Embedder};
use crate::error::Result;
use crate::storage::queries::{count_missing_embedding, find_memories_missing_embedding, get_memories_by_ids, update_embedding};
use crate::storage::Storage;

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

enum Command {
    Enqueue { user_id: String, memory_id: String },
    Scan { user_id: String },
    Shutdown,
}

/// Cheap, cloneable front for a running worker. Held by the Memory Core to
/// enqueue re-embeds and to start per-user catch-up scans.
#[derive(Clone)]
pub struct EmbeddingWorkerHandle {
    tx: mpsc::Sender<Command>,
}

impl EmbeddingWorkerHandle {
    pub async fn enqueue(&self, user_id: &str, memory_id: &str) {
        let _ = self
            .tx
            .send(Command::Enqueue {
                user_id: user_id.to_string(),
                memory_id: memory_id.to_string(),
            })
            .await;
    }

    pub fn enqueue_blocking(&self, user_id: &str, memory_id: &str) {
        let _ = self.tx.try_send(Command::Enqueue {
            user_id: user_id.to_string(),
            memory_id: memory_id.to_string(),
        });
    }

    pub async fn scan_now(&self, user_id: &str) {
        let _ = self.tx.send(Command::Scan { user_id: user_id.to_string() }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

pub struct EmbeddingWorker {
    storage: Storage,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
    flush_interval: Duration,
    /// id -> user_id, deduped: queuing the same memory twice before it
    /// drains embeds it once.
    pending: HashMap<String, String>,
    /// Per-user last-seen missing count, so the periodic scanner logs only
    /// on change (spec.md 4.5's log-spam suppression requirement).
    last_missing_count: Mutex<HashMap<String, i64>>,
}

impl EmbeddingWorker {
    pub fn new(storage: Storage, index: VectorIndex, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            index,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            pending: HashMap::new(),
            last_missing_count: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the worker's main loop and returns a handle to drive it.
    pub fn spawn(mut self) -> EmbeddingWorkerHandle {
        let (tx, mut rx) = mpsc::channel(1024);
        let handle = EmbeddingWorkerHandle { tx };

        tokio::spawn(async move {
            let mut flush_timer = interval(self.flush_interval);
            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(Command::Enqueue { user_id, memory_id }) => {
                                self.pending.insert(memory_id, user_id);
                                if self.pending.len() >= self.batch_size {
                                    self.drain_and_process().await;
                                }
                            }
                            Some(Command::Scan { user_id }) => {
                                self.scan_user(&user_id).await;
                            }
                            Some(Command::Shutdown) | None => {
                                self.drain_and_process().await;
                                break;
                            }
                        }
                    }
                    _ = flush_timer.tick() => {
                        if !self.pending.is_empty() {
                            self.drain_and_process().await;
                        }
                    }
                }
            }
        });

        handle
    }

    /// Starts a periodic catch-up scan for `user_id` on its own interval,
    /// independent of the worker's batch/flush cadence.
    pub fn start_monitoring(handle: EmbeddingWorkerHandle, user_id: String, interval_ms: u64) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                handle.scan_now(&user_id).await;
            }
        });
    }

    async fn scan_user(&mut self, user_id: &str) {
        let missing = match self.storage.with_connection(|c| count_missing_embedding(c, user_id)) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to count missing embeddings");
                return;
            }
        };

        let changed = {
            let mut last = self.last_missing_count.lock();
            let prev = last.insert(user_id.to_string(), missing);
            prev != Some(missing)
        };
        if changed && missing > 0 {
            tracing::info!(user_id, missing, "found memories missing embeddings");
        }
        if missing == 0 {
            return;
        }

        let ids = match self
            .storage
            .with_connection(|c| find_memories_missing_embedding(c, user_id, missing.min(500)))
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "failed to list memories missing embeddings");
                return;
            }
        };
        for id in ids {
            self.pending.insert(id, user_id.to_string());
        }
        if self.pending.len() >= self.batch_size {
            self.drain_and_process().await;
        }
    }

    async fn drain_and_process(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch: Vec<(String, String)> = self.pending.drain().collect();
        let mut by_user: HashMap<String, Vec<String>> = HashMap::new();
        for (id, user_id) in batch {
            by_user.entry(user_id).or_default().push(id);
        }

        for (user_id, ids) in by_user {
            if let Err(e) = self.process_user_batch(&user_id, &ids).await {
                tracing::warn!(user_id, error = %e, "embedding batch failed");
            }
        }
    }

    async fn process_user_batch(&self, user_id: &str, ids: &[String]) -> Result<()> {
        let memories = self
            .storage
            .with_connection(|c| get_memories_by_ids(c, ids, user_id))?;

        for memory in memories {
            let text = memory.embedding_text();
            match self.embed_with_retry(&text).await {
                Ok(vector) => {
                    self.storage
                        .with_connection(|c| update_embedding(c, &memory.id, user_id, &vector))?;
                    let _ = self.index.update_vector(&memory.id, vector);
                }
                Err(e) => {
                    tracing::warn!(user_id, memory_id = %memory.id, error = %e, "embedding failed after retries");
                }
            }
        }

        tracing::info!(user_id, count = ids.len(), "updated embeddings");
        Ok(())
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.embedder.embed(text) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TfIdfEmbedder;
    use crate::storage::queries::create_memory;
    use crate::types::{CreateMemoryInput, MemoryType};

    fn make_worker() -> (Storage, EmbeddingWorker) {
        let storage = Storage::open_in_memory().unwrap();
        let index = VectorIndex::new(384);
        let embedder: Arc<dyn Embedder> = Arc::new(TfIdfEmbedder::new(384));
        (storage.clone(), EmbeddingWorker::new(storage, index, embedder))
    }

    #[tokio::test]
    async fn drains_pending_and_updates_storage() {
        let (storage, mut worker) = make_worker();
        let memory = storage
            .with_connection(|c| {
                create_memory(
                    c,
                    "alice",
                    CreateMemoryInput {
                        title: String::new(),
                        content: "remember to buy milk".into(),
                        memory_type: MemoryType::Memory,
                        importance: 0.5,
                        tags: vec![],
                        entity_ids: vec![],
                        metadata: serde_json::json!({}),
                    },
                )
            })
            .unwrap();

        worker.pending.insert(memory.id.clone(), "alice".to_string());
        worker.drain_and_process().await;

        let missing = storage.with_connection(|c| count_missing_embedding(c, "alice")).unwrap();
        assert_eq!(missing, 0);
    }

    #[tokio::test]
    async fn scan_logs_only_on_count_change() {
        let (storage, mut worker) = make_worker();
        storage
            .with_connection(|c| {
                create_memory(
                    c,
                    "alice",
                    CreateMemoryInput {
                        title: String::new(),
                        content: "a memory".into(),
                        memory_type: MemoryType::Memory,
                        importance: 0.5,
                        tags: vec![],
                        entity_ids: vec![],
                        metadata: serde_json::json!({}),
                    },
                )
            })
            .unwrap();

        worker.scan_user("alice").await;
        let first = *worker.last_missing_count.lock().get("alice").unwrap();
        assert_eq!(first, 1);

        worker.drain_and_process().await;
        worker.scan_user("alice").await;
        let second = *worker.last_missing_count.lock().get("alice").unwrap();
        assert_eq!(second, 0);
    }
}
