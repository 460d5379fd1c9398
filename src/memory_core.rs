//! The Memory Core (C6): the single seam through which every RPC handler
//! touches storage, the vector index, and the embedding worker. Every
//! method takes `user_id` as a mandatory argument — per spec.md 4.6, the
//! type system must make it impossible to call a user-scoped operation
//! without one.
//!
//! `recallMemories`'s composite strategy is grounded on the teacher's
//! `search/hybrid.rs::hybrid_search` scan-score-merge shape, simplified from
//! RRF to the linear weighted merge spec.md mandates
//! (`0.7 * vector_score + 0.3 * text_score`, clipped to `[0,1]`).

use std::sync::Arc;

use crate::embedding::index::SearchSimilarOptions;
use crate::embedding::{Embedder, EmbeddingWorkerHandle, VectorIndex};
use crate::error::{Error, Result};
use crate::storage::entity_queries;
use crate::storage::queries;
use crate::storage::Storage;
use crate::types::{
    CreateEntityInput, CreateMemoryInput, Entity, EmbeddingMode, ListOptions, Memory,
    RecallOptions, RecallStrategy, SearchResult, StorageStats, UpdateEntityInput,
    UpdateMemoryInput,
};

const VECTOR_WEIGHT: f32 = 0.7;
const TEXT_WEIGHT: f32 = 0.3;
/// Default `similarity` strategy threshold, per spec.md 4.6.
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.3;
/// Default threshold for `composite`'s vector leg, per spec.md 4.6. The
/// lexical leg has no default threshold — it is always unfiltered.
const DEFAULT_COMPOSITE_VECTOR_THRESHOLD: f32 = 0.6;

/// Memory Core: holds the storage handle, the in-memory vector index, a
/// synchronous embedder (used for `EmbeddingMode::Sync` writes and for
/// embedding recall queries), and a handle to the background worker (used
/// for `EmbeddingMode::Async` writes and `updateMissingEmbeddings`).
#[derive(Clone)]
pub struct MemoryCore {
    storage: Storage,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    worker: EmbeddingWorkerHandle,
}

/// Warnings the caller should surface in response metadata without failing
/// the call outright — e.g. unknown entity ids dropped, or composite recall
/// degrading to text-only because the embedder is unavailable.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CoreWarnings {
    pub dropped_entity_ids: Vec<String>,
    pub degraded_to_text_only: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AddMemoryResult {
    pub memory: Memory,
    pub warnings: CoreWarnings,
}

impl MemoryCore {
    pub fn new(storage: Storage, index: VectorIndex, embedder: Arc<dyn Embedder>, worker: EmbeddingWorkerHandle) -> Self {
        Self { storage, index, embedder, worker }
    }

    /// `addMemory(user_id, title, content, type, opts)`. `entity_ids` that do
    /// not exist under `user_id` are silently dropped and reported in
    /// `warnings.dropped_entity_ids`, per spec.md 4.6.
    pub async fn add_memory(
        &self,
        user_id: &str,
        mut input: CreateMemoryInput,
        mode: EmbeddingMode,
    ) -> Result<AddMemoryResult> {
        let requested_entity_ids = input.entity_ids.clone();
        let kept = self
            .storage
            .with_connection(|c| entity_queries::filter_existing_entity_ids(c, user_id, &requested_entity_ids))?;
        let dropped_entity_ids: Vec<String> = requested_entity_ids
            .into_iter()
            .filter(|id| !kept.contains(id))
            .collect();
        input.entity_ids = kept;

        let memory = self.storage.with_connection(|c| queries::create_memory(c, user_id, input))?;

        match mode {
            EmbeddingMode::Disabled => {}
            EmbeddingMode::Sync => {
                let vector = self.embedder.embed(&memory.embedding_text())?;
                self.storage
                    .with_connection(|c| queries::update_embedding(c, &memory.id, user_id, &vector))?;
                self.index.update_vector(&memory.id, vector)?;
            }
            EmbeddingMode::Async => {
                // Returns before the embedder is ever called — the worker
                // calls it later, off this request's critical path.
                self.worker.enqueue(user_id, &memory.id).await;
            }
        }

        let memory = self
            .storage
            .with_connection(|c| queries::get_memory_by_id(c, &memory.id, user_id))?
            .ok_or_else(|| Error::Internal("memory vanished immediately after creation".into()))?;

        Ok(AddMemoryResult {
            memory,
            warnings: CoreWarnings {
                dropped_entity_ids,
                degraded_to_text_only: false,
            },
        })
    }

    pub fn get_memory(&self, user_id: &str, id: &str) -> Result<Option<Memory>> {
        self.storage.with_connection(|c| queries::get_memory_by_id(c, id, user_id))
    }

    /// `updateMemory(id, user_id, patch)`. `patch` never carries `id` or
    /// `user_id` (enforced by `UpdateMemoryInput`'s shape). A patch that
    /// touches an embedded field clears the stored embedding and re-enqueues
    /// the memory with the worker so callers see a fresh embedding without
    /// asking for one.
    pub async fn update_memory(&self, user_id: &str, id: &str, patch: UpdateMemoryInput) -> Result<Option<Memory>> {
        let touches_embedding = patch.touches_embedded_fields();
        let updated = self.storage.with_connection(|c| queries::update_memory(c, id, user_id, patch))?;
        let Some(updated) = updated else {
            return Ok(None);
        };

        if touches_embedding {
            self.storage.with_connection(|c| queries::clear_embedding(c, id, user_id))?;
            self.index.remove_vectors(std::slice::from_ref(&id.to_string()));
            self.worker.enqueue(user_id, id).await;
        }

        self.storage.with_connection(|c| queries::get_memory_by_id(c, id, user_id))
    }

    pub fn delete_memory(&self, user_id: &str, id: &str) -> Result<bool> {
        let deleted = self.storage.with_connection(|c| queries::delete_memory(c, id, user_id))?;
        if deleted {
            self.index.remove_vectors(std::slice::from_ref(&id.to_string()));
        }
        Ok(deleted)
    }

    /// `recallMemories(user_id, query, opts)`. Edge cases per spec.md 4.6:
    /// an empty query returns the most recently updated memories regardless
    /// of strategy; `limit <= 0` returns zero results, not an error;
    /// `threshold > 1` yields an empty result, since no cosine/bm25 score
    /// can exceed it.
    pub fn recall_memories(&self, user_id: &str, query: &str, opts: RecallOptions) -> Result<(Vec<SearchResult>, CoreWarnings)> {
        let mut warnings = CoreWarnings::default();

        if opts.limit <= 0 {
            return Ok((Vec::new(), warnings));
        }
        if let Some(t) = opts.threshold {
            if t > 1.0 {
                return Ok((Vec::new(), warnings));
            }
        }

        if query.trim().is_empty() {
            let memories = self.storage.with_connection(|c| {
                queries::list_memories(
                    c,
                    user_id,
                    &ListOptions {
                        filters: Default::default(),
                        limit: opts.limit,
                        cursor: None,
                    },
                )
            })?;
            return Ok((
                memories
                    .into_iter()
                    .map(|memory| SearchResult { memory, score: 0.0, vector_score: None, text_score: None })
                    .collect(),
                warnings,
            ));
        }

        let results = match opts.strategy {
            RecallStrategy::Recency => {
                let memories = self.storage.with_connection(|c| {
                    queries::list_memories(
                        c,
                        user_id,
                        &ListOptions { filters: Default::default(), limit: opts.limit, cursor: None },
                    )
                })?;
                memories
                    .into_iter()
                    .map(|memory| SearchResult { memory, score: 0.0, vector_score: None, text_score: None })
                    .collect()
            }
            RecallStrategy::Importance => {
                let mut memories = self.storage.with_connection(|c| {
                    queries::list_memories(
                        c,
                        user_id,
                        &ListOptions { filters: Default::default(), limit: opts.limit.max(1) * 4, cursor: None },
                    )
                })?;
                memories.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap_or(std::cmp::Ordering::Equal));
                memories.truncate(opts.limit as usize);
                memories
                    .into_iter()
                    .map(|memory| {
                        let score = memory_importance(&memory);
                        SearchResult { memory, score, vector_score: None, text_score: None }
                    })
                    .collect()
            }
            RecallStrategy::Frequency => {
                // No access-count column in this schema's CORE scope; falls
                // back to recency, which is the closest available ordering.
                let memories = self.storage.with_connection(|c| {
                    queries::list_memories(
                        c,
                        user_id,
                        &ListOptions { filters: Default::default(), limit: opts.limit, cursor: None },
                    )
                })?;
                memories
                    .into_iter()
                    .map(|memory| SearchResult { memory, score: 0.0, vector_score: None, text_score: None })
                    .collect()
            }
            RecallStrategy::Similarity => self.vector_search(user_id, query, opts.limit, opts.threshold)?,
            RecallStrategy::Composite => {
                match self.embedder.embed(query) {
                    Ok(query_vector) => self.composite_search(user_id, query, &query_vector, opts.limit, opts.threshold)?,
                    Err(_) => {
                        warnings.degraded_to_text_only = true;
                        self.text_search(user_id, query, opts.limit, opts.threshold)?
                    }
                }
            }
        };

        Ok((results, warnings))
    }

    fn vector_search(&self, user_id: &str, query: &str, limit: i64, threshold: Option<f32>) -> Result<Vec<SearchResult>> {
        let query_vector = self.embedder.embed(query)?;
        let matches = self.index.search_similar(
            &query_vector,
            &SearchSimilarOptions { limit: limit.max(0) as usize, threshold: threshold.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD), include_distance: false },
        )?;
        let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
        let memories = self.storage.with_connection(|c| queries::get_memories_by_ids(c, &ids, user_id))?;
        Ok(join_scores(memories, matches.into_iter().map(|m| (m.id, m.score)).collect(), true))
    }

    fn text_search(&self, user_id: &str, query: &str, limit: i64, threshold: Option<f32>) -> Result<Vec<SearchResult>> {
        let hits = self.storage.with_connection(|c| queries::fts_search_memories(c, user_id, query, limit))?;
        Ok(hits
            .into_iter()
            .filter(|(_, score)| *score >= threshold.unwrap_or(0.0))
            .map(|(memory, score)| SearchResult { memory, score, vector_score: None, text_score: Some(score) })
            .collect())
    }

    /// `score = 0.7 * vector_score + 0.3 * text_score`, clipped to `[0,1]`.
    /// A memory found by only one side scores with the other component at 0.
    ///
    /// The threshold (default 0.6) filters the vector leg only, before the
    /// merge — the lexical leg is always unfiltered, per spec. A memory that
    /// the vector leg drops for being below threshold can still appear in
    /// the final results if the lexical leg finds it.
    fn composite_search(
        &self,
        user_id: &str,
        query: &str,
        query_vector: &[f32],
        limit: i64,
        threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        let vector_matches = self.index.search_similar(
            query_vector,
            &SearchSimilarOptions {
                limit: (limit.max(1) as usize) * 4,
                threshold: threshold.unwrap_or(DEFAULT_COMPOSITE_VECTOR_THRESHOLD),
                include_distance: false,
            },
        )?;
        let text_hits = self.storage.with_connection(|c| queries::fts_search_memories(c, user_id, query, limit.max(1) * 4))?;

        let mut combined: std::collections::HashMap<String, (f32, f32)> = std::collections::HashMap::new();
        for m in vector_matches {
            combined.entry(m.id).or_insert((0.0, 0.0)).0 = m.score;
        }
        for (memory, score) in &text_hits {
            combined.entry(memory.id.clone()).or_insert((0.0, 0.0)).1 = *score;
        }

        let ids: Vec<String> = combined.keys().cloned().collect();
        let memories = self.storage.with_connection(|c| queries::get_memories_by_ids(c, &ids, user_id))?;

        let mut results: Vec<SearchResult> = memories
            .into_iter()
            .filter_map(|memory| {
                let (vector_score, text_score) = *combined.get(&memory.id)?;
                let score = (VECTOR_WEIGHT * vector_score + TEXT_WEIGHT * text_score).clamp(0.0, 1.0);
                Some(SearchResult { memory, score, vector_score: Some(vector_score), text_score: Some(text_score) })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit.max(0) as usize);
        Ok(results)
    }

    pub fn get_statistics(&self, user_id: &str) -> Result<StorageStats> {
        self.storage.with_connection(|c| queries::get_statistics(c, user_id))
    }

    /// `updateMissingEmbeddings(user_id)`: delegates to the worker, scoped
    /// to one user.
    pub async fn update_missing_embeddings(&self, user_id: &str) {
        self.worker.scan_now(user_id).await;
    }

    // --- Entity operations mirror the memory operations above. ---

    pub fn store_entity(&self, user_id: &str, input: CreateEntityInput) -> Result<Entity> {
        self.storage.with_connection(|c| entity_queries::create_entity(c, user_id, input))
    }

    pub fn get_entity(&self, user_id: &str, id: &str) -> Result<Option<Entity>> {
        self.storage.with_connection(|c| entity_queries::get_entity_by_id(c, id, user_id))
    }

    pub fn update_entity(&self, user_id: &str, id: &str, patch: UpdateEntityInput) -> Result<Option<Entity>> {
        self.storage.with_connection(|c| entity_queries::update_entity(c, id, user_id, patch))
    }

    pub fn delete_entity(&self, user_id: &str, id: &str) -> Result<bool> {
        self.storage.with_connection(|c| entity_queries::delete_entity(c, id, user_id))
    }

    pub fn search_entities(&self, user_id: &str, query: &str, limit: i64) -> Result<Vec<Entity>> {
        self.storage.with_connection(|c| entity_queries::fts_search_entities(c, user_id, query, limit))
    }
}

fn memory_importance(memory: &Memory) -> f32 {
    memory.importance
}

/// Joins vector-index matches back to their `Memory` rows, preserving match
/// order (matches that lost their row — e.g. deleted mid-search — are
/// simply absent from the result).
fn join_scores(memories: Vec<Memory>, scores: std::collections::HashMap<String, f32>, is_vector: bool) -> Vec<SearchResult> {
    let mut by_id: std::collections::HashMap<String, Memory> = memories.into_iter().map(|m| (m.id.clone(), m)).collect();
    let mut ordered: Vec<(String, f32)> = scores.into_iter().collect();
    ordered.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ordered
        .into_iter()
        .filter_map(|(id, score)| {
            let memory = by_id.remove(&id)?;
            Some(SearchResult {
                memory,
                score,
                vector_score: is_vector.then_some(score),
                text_score: (!is_vector).then_some(score),
            })
        })
        .collect()
}
