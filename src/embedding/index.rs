//! The Vector Index (C4): an in-memory nearest-neighbor index over
//! cosine similarity.
//!
//! Grounded on `search/hybrid.rs::semantic_only_search`'s scan-score-sort
//! shape, generalized from "all memories with embeddings in this
//! connection" into a standalone structure the Memory Core can populate
//! incrementally instead of re-scanning SQLite on every recall.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::cosine_similarity;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleAggregation {
    Mean,
    Weighted,
    Max,
}

#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub id: String,
    pub score: f32,
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchSimilarOptions {
    pub limit: usize,
    pub threshold: f32,
    pub include_distance: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexStats {
    pub vector_count: usize,
    pub dimensions: usize,
}

/// Vectors are kept in a single `HashMap` guarded by an `RwLock`: reads
/// (search) vastly outnumber writes (add/remove) once the worker has caught
/// a user's memories up.
pub struct VectorIndex {
    dimensions: usize,
    vectors: Arc<RwLock<HashMap<String, Vec<f32>>>>,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(Error::Validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(())
    }

    pub fn add_vectors(&self, entries: Vec<(String, Vec<f32>)>) -> Result<()> {
        for (_, v) in &entries {
            self.check_dimensions(v)?;
        }
        let mut guard = self.vectors.write();
        for (id, v) in entries {
            guard.insert(id, v);
        }
        Ok(())
    }

    pub fn update_vector(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        self.check_dimensions(&vector)?;
        self.vectors.write().insert(id.to_string(), vector);
        Ok(())
    }

    pub fn remove_vectors(&self, ids: &[String]) {
        let mut guard = self.vectors.write();
        for id in ids {
            guard.remove(id);
        }
    }

    pub fn clear(&self) {
        self.vectors.write().clear();
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            vector_count: self.vectors.read().len(),
            dimensions: self.dimensions,
        }
    }

    /// Empty index → empty result. Ties broken by id ascending for stable
    /// ordering across calls.
    pub fn search_similar(&self, query: &[f32], options: &SearchSimilarOptions) -> Result<Vec<IndexMatch>> {
        self.check_dimensions(query)?;

        let guard = self.vectors.read();
        let mut scored: Vec<(String, f32)> = guard
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
            .filter(|(_, score)| *score >= options.threshold)
            .collect();

        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        scored.truncate(options.limit);

        Ok(scored
            .into_iter()
            .map(|(id, score)| IndexMatch {
                id,
                score,
                distance: options.include_distance.then_some(1.0 - score),
            })
            .collect())
    }

    /// Combines several query vectors (e.g. from a multi-aspect recall)
    /// into one ranking before scoring against the index.
    pub fn search_ensemble(
        &self,
        queries: &[Vec<f32>],
        weights: Option<&[f32]>,
        aggregation: EnsembleAggregation,
        options: &SearchSimilarOptions,
    ) -> Result<Vec<IndexMatch>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        for q in queries {
            self.check_dimensions(q)?;
        }
        if let Some(w) = weights {
            if w.len() != queries.len() {
                return Err(Error::Validation(
                    "weights length must match queries length".into(),
                ));
            }
        }

        let guard = self.vectors.read();
        let mut scored: Vec<(String, f32)> = guard
            .iter()
            .map(|(id, v)| {
                let per_query: Vec<f32> = queries.iter().map(|q| cosine_similarity(q, v)).collect();
                let score = match aggregation {
                    EnsembleAggregation::Mean => per_query.iter().sum::<f32>() / per_query.len() as f32,
                    EnsembleAggregation::Max => {
                        per_query.iter().cloned().fold(f32::MIN, f32::max)
                    }
                    EnsembleAggregation::Weighted => {
                        let w = weights.unwrap_or(&[]);
                        let total: f32 = w.iter().sum();
                        if total == 0.0 {
                            per_query.iter().sum::<f32>() / per_query.len() as f32
                        } else {
                            per_query.iter().zip(w.iter()).map(|(s, w)| s * w).sum::<f32>() / total
                        }
                    }
                };
                (id.clone(), score)
            })
            .filter(|(_, score)| *score >= options.threshold)
            .collect();

        scored.sort_by(|a, b| match b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal) {
            std::cmp::Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        scored.truncate(options.limit);

        Ok(scored
            .into_iter()
            .map(|(id, score)| IndexMatch {
                id,
                score,
                distance: options.include_distance.then_some(1.0 - score),
            })
            .collect())
    }
}

impl Clone for VectorIndex {
    fn clone(&self) -> Self {
        Self {
            dimensions: self.dimensions,
            vectors: self.vectors.clone(),
        }
    }
}
