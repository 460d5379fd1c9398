//! The Embedding Client (C3) and Vector Index (C4).
//!
//! `Embedder`/`cosine_similarity`/`OpenAIEmbedder` are carried close to
//! verbatim from the teacher's `embedding/mod.rs`; the zero-vector handling
//! there (return 0, not NaN) already matches spec.md 4.3 exactly.

pub mod index;
mod tfidf;
pub mod worker;

pub use index::VectorIndex;
pub use tfidf::TfIdfEmbedder;
pub use worker::{EmbeddingWorker, EmbeddingWorkerHandle};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::EmbeddingConfig;

/// Distinguishable failure modes an `Embedder` must surface, per spec.md 4.3.
/// Converted into the crate-wide `Error` at the call site so upstream code
/// works with one error type while still being able to match on these kinds
/// via `Error::{Unauthorized,RateLimited,Transient,Permanent}`.
#[derive(Debug)]
pub enum EmbedError {
    Auth,
    RateLimited { retry_after_secs: u64 },
    Transient(String),
    Permanent(String),
}

impl From<EmbedError> for Error {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Auth => Error::Unauthorized,
            EmbedError::RateLimited { retry_after_secs } => Error::RateLimited { retry_after_secs },
            EmbedError::Transient(msg) => Error::Transient(msg),
            EmbedError::Permanent(msg) => Error::Permanent(msg),
        }
    }
}

/// Single method: `embed(text) -> Vector`. Dimensionality is fixed per
/// provider/config.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Thin adapter to an OpenAI-compatible embeddings endpoint.
#[cfg(feature = "openai")]
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[cfg(feature = "openai")]
impl OpenAIEmbedder {
    pub fn new(api_key: String, base_url: Option<String>, model: String, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
            dimensions,
        }
    }

    async fn embed_async(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "input": text, "model": self.model }))
            .send()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(EmbedError::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(EmbedError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Transient(format!("{status}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Permanent(format!("{status}: {body}")));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::Permanent(e.to_string()))?;
        let embedding = data["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EmbedError::Permanent("unexpected response shape".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        Ok(embedding)
    }
}

#[cfg(feature = "openai")]
impl Embedder for OpenAIEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.embed_async(text))
        })
        .map_err(Error::from)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Builds the configured embedder. `tfidf` needs no network and no API key —
/// it is the default for tests and offline development.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        #[cfg(feature = "openai")]
        "openai" => {
            let api_key = config
                .api_key
                .clone()
                .ok_or_else(|| Error::Validation("embedding provider 'openai' requires an api key".into()))?;
            Ok(Arc::new(OpenAIEmbedder::new(
                api_key,
                config.base_url.clone(),
                config.model.clone(),
                config.dimensions,
            )))
        }
        "tfidf" => Ok(Arc::new(TfIdfEmbedder::new(config.dimensions))),
        other => Err(Error::Validation(format!("unknown embedding provider '{other}'"))),
    }
}

/// dot(a,b) / (‖a‖·‖b‖). Zero-length or zero-norm vectors return 0, not NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
