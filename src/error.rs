//! The crate-wide error taxonomy.
//!
//! Nine kinds, matching SPEC_FULL.md 2.3.1 exactly. Every public fallible
//! function returns `Result<T>` from this module; `anyhow` is only used at
//! the binary edges (`bin/server.rs`, `bin/migrate.rs`) to add context before
//! printing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller-fixable input, e.g. empty `user_id`, unparseable enum variant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource absent, or present but not visible to the caller's user_id.
    /// Id-scoped get/update/delete return `None`/`false` rather than this
    /// variant (see SPEC_FULL.md 2.3.1); this variant is for operations that
    /// have no sensible "not found" value to return instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// No credentials, or credentials that do not resolve to a user.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated, but the token's scope does not cover this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Uniqueness violation or failed precondition (id collision, etc).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Provider backpressure; callers may retry after `retry_after_secs`.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Network/provider flake. Retryable.
    #[error("transient error: {0}")]
    Transient(String),

    /// Dimension mismatch, schema assertion, or other irrecoverable condition.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A bug. Never expected to be handled; only logged.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "openai")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether an upstream caller (e.g. the embedding worker's retry loop)
    /// should retry this error. Only `Transient` and `RateLimited` are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::RateLimited { .. })
    }

    /// JSON-RPC 2.0 style negative error code for this error kind, used by
    /// the RPC dispatcher when an error must surface as a transport-level
    /// error rather than inside a tool result envelope (auth failures,
    /// malformed envelopes — see mcp::dispatcher).
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::Validation(_) => -32602,
            Error::NotFound(_) => -32004,
            Error::Unauthorized => -32001,
            Error::Forbidden(_) => -32003,
            Error::Conflict(_) => -32010,
            Error::RateLimited { .. } => -32011,
            Error::Transient(_) => -32012,
            Error::Permanent(_) => -32013,
            Error::Internal(_) => -32603,
            Error::Database(_) => -32603,
            Error::Serialization(_) => -32603,
            Error::Io(_) => -32603,
            #[cfg(feature = "openai")]
            Error::Http(_) => -32012,
        }
    }
}
