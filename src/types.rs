//! Domain types shared across the store, embedding pipeline, and RPC surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An identity-provider subject id. Opaque to this crate; never constructed
/// from a default/global constant (see `auth::AuthContext`).
pub type UserId = String;

/// A registered user, created lazily on first authenticated call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryType {
    System,
    Learned,
    Memory,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::System => "SYSTEM",
            MemoryType::Learned => "LEARNED",
            MemoryType::Memory => "MEMORY",
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SYSTEM" => Ok(MemoryType::System),
            "LEARNED" => Ok(MemoryType::Learned),
            "MEMORY" => Ok(MemoryType::Memory),
            other => Err(crate::error::Error::Validation(format!(
                "unknown memory_type '{other}'"
            ))),
        }
    }
}

/// A user-owned text record intended for later recall, optionally embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub memory_type: MemoryType,
    /// Normalized to [0,1]. Ordinal inputs 1..5 are linearly mapped at the edge.
    pub importance: f32,
    pub tags: Vec<String>,
    pub entity_ids: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    pub fn has_embedding(&self) -> bool {
        matches!(&self.embedding, Some(v) if !v.is_empty())
    }

    /// Text embedded for this memory: `[title, content, type, "Tags: a, b"]` joined by spaces.
    pub fn embedding_text(&self) -> String {
        format!(
            "{} {} {} Tags: {}",
            self.title,
            self.content,
            self.memory_type.as_str(),
            self.tags.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Person,
    Organization,
    Project,
}

impl Default for EntityType {
    fn default() -> Self {
        EntityType::Person
    }
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Project => "PROJECT",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PERSON" => Ok(EntityType::Person),
            "ORGANIZATION" => Ok(EntityType::Organization),
            "PROJECT" => Ok(EntityType::Project),
            other => Err(crate::error::Error::Validation(format!(
                "unknown entity_type '{other}'"
            ))),
        }
    }
}

/// A user-owned structured record about a person/organization/project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: UserId,
    pub name: String,
    pub entity_type: EntityType,
    pub person_type: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub website: Option<String>,
    pub notes: Option<String>,
    pub importance: f32,
    pub tags: Vec<String>,
    pub interaction_count: i64,
    pub is_archived: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional interaction log entry; increments `Entity::interaction_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub user_id: UserId,
    pub entity_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Additive-only usage accounting, used for quota enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsage {
    pub user_id: UserId,
    pub provider: String,
    pub date: chrono::NaiveDate,
    pub token_count: i64,
    pub cost: f64,
}

/// Registered out-of-band; drives the OAuth authorization-code flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret_hash: String,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Ephemeral, single-use. See `auth::oauth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub user_id: UserId,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// Bearer credential: possession grants the scope it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub client_id: String,
    pub user_id: UserId,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    RolledBack,
    Failed,
}

/// One row of the tamper-evident migration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i32,
    pub name: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub checksum: String,
    pub status: MigrationStatus,
}

/// Closed tagged variant replacing the source's loose `boolean | "sync" | "async"`
/// mode parameter (see SPEC_FULL.md REDESIGN notes). The rest of the code only
/// ever sees this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Compute the embedding before returning; `addMemory` still only fails
    /// on a write failure, never on an embedder failure in this mode.
    Sync,
    /// Write first, enqueue, return immediately. Default for interactive paths.
    #[default]
    Async,
    /// Never compute an embedding for this write.
    Disabled,
}

impl std::str::FromStr for EmbeddingMode {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(EmbeddingMode::Sync),
            "async" => Ok(EmbeddingMode::Async),
            "disabled" => Ok(EmbeddingMode::Disabled),
            other => Err(crate::error::Error::Validation(format!(
                "unknown embedding mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecallStrategy {
    Similarity,
    Composite,
    Recency,
    Frequency,
    Importance,
}

impl Default for RecallStrategy {
    fn default() -> Self {
        RecallStrategy::Composite
    }
}

impl std::str::FromStr for RecallStrategy {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similarity" => Ok(RecallStrategy::Similarity),
            "composite" => Ok(RecallStrategy::Composite),
            "recency" => Ok(RecallStrategy::Recency),
            "frequency" => Ok(RecallStrategy::Frequency),
            "importance" => Ok(RecallStrategy::Importance),
            other => Err(crate::error::Error::Validation(format!(
                "unknown recall strategy '{other}'"
            ))),
        }
    }
}

/// Result of `recallMemories`: the memory plus how it scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub memory: Memory,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallOptions {
    pub strategy: RecallStrategy,
    pub limit: i64,
    pub threshold: Option<f32>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub memory_type: Option<MemoryType>,
    pub archived: Option<bool>,
    pub tag: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub filters: ListFilters,
    pub limit: i64,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateMemoryInput {
    pub title: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub importance: f32,
    pub tags: Vec<String>,
    pub entity_ids: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Partial update. `id` and `user_id` are never present here by construction
/// — they arrive as separate mandatory arguments to `updateMemory`.
#[derive(Debug, Clone, Default)]
pub struct UpdateMemoryInput {
    pub title: Option<String>,
    pub content: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub importance: Option<f32>,
    pub tags: Option<Vec<String>>,
    pub entity_ids: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub is_archived: Option<bool>,
}

impl UpdateMemoryInput {
    /// Whether this patch touches fields that feed the embedding text
    /// (see SPEC_FULL.md 4.6, "clears the existing embedding and enqueues a re-embed").
    pub fn touches_embedded_fields(&self) -> bool {
        self.title.is_some()
            || self.content.is_some()
            || self.memory_type.is_some()
            || self.tags.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateEntityInput {
    pub name: String,
    pub entity_type: EntityType,
    pub person_type: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub website: Option<String>,
    pub notes: Option<String>,
    pub importance: f32,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateEntityInput {
    pub name: Option<String>,
    pub person_type: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub website: Option<String>,
    pub notes: Option<String>,
    pub importance: Option<f32>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
    pub is_archived: Option<bool>,
}

/// Storage engine selection. `Local` favors throughput; `CloudSafe` favors
/// single-writer-at-a-time safety on a folder synced by Dropbox/OneDrive/etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageMode::Local),
            "cloud-safe" | "cloud_safe" => Ok(StorageMode::CloudSafe),
            other => Err(crate::error::Error::Validation(format!(
                "unknown storage mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: String,
    pub storage_mode: StorageMode,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

/// Per-user statistics, always computed with `WHERE user_id = ?` — see
/// SPEC_FULL.md 9(b): this was historically a place isolation was forgotten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub user_id: UserId,
    pub total_memories: i64,
    pub by_type: HashMap<String, i64>,
    pub with_embedding: i64,
    pub archived: i64,
    pub embedding_coverage_pct: f32,
}
