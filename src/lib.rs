//! Engram - multi-tenant semantic memory service.
//!
//! Persistent, per-user memory for AI assistants: free-form "memories" and
//! typed "entities" are embedded and served back through hybrid semantic +
//! lexical search over an authenticated JSON-RPC tool surface.

pub mod auth;
pub mod embedding;
pub mod error;
pub mod mcp;
pub mod memory_core;
pub mod storage;
pub mod types;

pub use error::{Error, Result};
pub use memory_core::MemoryCore;
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
