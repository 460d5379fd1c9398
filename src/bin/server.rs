//! Entry point for the `engram-server` binary: parses CLI flags, wires up
//! storage, the embedding worker, and the Memory Core, then serves the RPC
//! Surface (C8) over stdio or HTTP depending on `--transport`.
//!
//! `tracing` is initialized to write exclusively to stderr regardless of
//! which transport is selected — stdout carries only JSON-RPC responses when
//! running stdio, and operators switch between transports without changing
//! anything else about how the process is supervised.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use engram::auth::idp::{IdentityProvider, OidcVerifier};
use engram::embedding::{create_embedder, EmbeddingWorker, VectorIndex};
use engram::mcp::dispatcher::StdioAuthMode;
use engram::mcp::http::{router, HttpState};
use engram::mcp::protocol::McpServer;
use engram::mcp::Dispatcher;
use engram::memory_core::MemoryCore;
use engram::storage::Storage;
use engram::types::{EmbeddingConfig, StorageConfig, StorageMode};
use engram::Result;

#[derive(Parser, Debug)]
#[command(name = "engram-server", about = "Multi-tenant semantic memory service")]
struct Args {
    /// Path to the SQLite database file
    #[arg(long, env = "ENGRAM_DB_PATH", default_value = "~/.engram/engram.db")]
    db_path: String,

    /// Storage mode: local or cloud-safe
    #[arg(long, env = "ENGRAM_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// RPC transport: stdio or http
    #[arg(long, env = "ENGRAM_TRANSPORT", default_value = "stdio")]
    transport: String,

    /// Bind address for the http transport
    #[arg(long, env = "ENGRAM_HTTP_ADDR", default_value = "127.0.0.1:8787")]
    http_addr: String,

    /// Embedding provider: tfidf or openai
    #[arg(long, env = "ENGRAM_EMBEDDING_PROVIDER", default_value = "tfidf")]
    embedding_provider: String,

    /// Embedding vector dimensions
    #[arg(long, env = "ENGRAM_EMBEDDING_DIMENSIONS", default_value_t = 256)]
    embedding_dimensions: usize,

    /// OIDC issuer used to verify bearer tokens in multi-tenant mode
    #[arg(long, env = "ENGRAM_IDP_ISSUER")]
    idp_issuer: Option<String>,

    /// Expected audience claim when verifying bearer tokens
    #[arg(long, env = "ENGRAM_IDP_AUDIENCE")]
    idp_audience: Option<String>,

    /// Require per-request IdP-verified auth instead of a single local user
    #[arg(long, env = "ENGRAM_MULTI_TENANT", default_value_t = false)]
    multi_tenant: bool,

    /// Tracing filter, e.g. "info" or "engram=debug"
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Never actually consulted: the stdio/http paths that call into an IdP are
/// both gated behind `--multi-tenant`, which requires `--idp-issuer`.
struct NullIdentityProvider;

#[async_trait::async_trait]
impl IdentityProvider for NullIdentityProvider {
    async fn verify(&self, _bearer_token: &str) -> Result<engram::auth::idp::IdpClaims> {
        Err(engram::Error::Unauthorized)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    if args.multi_tenant && args.idp_issuer.is_none() {
        return Err(engram::Error::Validation(
            "--multi-tenant requires --idp-issuer (or ENGRAM_IDP_ISSUER)".into(),
        ));
    }

    let db_path = shellexpand::tilde(&args.db_path).into_owned();
    let storage_mode: StorageMode = args.storage_mode.parse()?;
    let storage = Storage::open(StorageConfig { db_path, storage_mode })?;

    let embedding_config = EmbeddingConfig {
        provider: args.embedding_provider.clone(),
        api_key: std::env::var("ENGRAM_EMBEDDING_API_KEY").ok(),
        base_url: std::env::var("ENGRAM_EMBEDDING_BASE_URL").ok(),
        model: std::env::var("ENGRAM_EMBEDDING_MODEL").unwrap_or_else(|_| "default".to_string()),
        dimensions: args.embedding_dimensions,
    };
    let embedder = create_embedder(&embedding_config)?;
    let index = VectorIndex::new(embedder.dimensions());
    let worker = EmbeddingWorker::new(storage.clone(), index.clone(), embedder.clone()).spawn();
    let core = Arc::new(MemoryCore::new(storage.clone(), index, embedder, worker));

    let idp: Arc<dyn IdentityProvider> = match &args.idp_issuer {
        Some(issuer) => Arc::new(OidcVerifier::new(issuer, args.idp_audience.clone())),
        None => Arc::new(NullIdentityProvider),
    };

    let stdio_auth = if args.multi_tenant {
        StdioAuthMode::MultiTenant { idp: idp.clone() }
    } else {
        StdioAuthMode::LegacySingleUser {
            user_id: "local".to_string(),
            email: "local@localhost".to_string(),
        }
    };

    let dispatcher = Dispatcher::new(core, storage.clone(), stdio_auth);

    match args.transport.as_str() {
        "stdio" => {
            tracing::info!("starting engram-server on stdio transport");
            // `run()` blocks this thread on stdin; the embedding worker
            // keeps draining on the runtime's other worker threads.
            tokio::task::spawn_blocking(move || McpServer::new(dispatcher).run())
                .await
                .map_err(|e| engram::Error::Internal(e.to_string()))??;
            Ok(())
        }
        "http" => {
            tracing::info!(addr = %args.http_addr, "starting engram-server on http transport");
            let state = HttpState { dispatcher: Arc::new(dispatcher), storage, idp };
            let listener = tokio::net::TcpListener::bind(&args.http_addr).await?;
            axum::serve(listener, router(state)).await?;
            Ok(())
        }
        other => Err(engram::Error::Validation(format!(
            "unknown transport '{other}', expected 'stdio' or 'http'"
        ))),
    }
}
