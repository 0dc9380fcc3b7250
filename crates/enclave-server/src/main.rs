//! # enclave-server
//!
//! Chat server for a single organisation's verified email domains.
//!
//! This binary provides:
//! - **REST API** (axum) for conversations, channels, history and blocks
//! - **WebSocket endpoint** for joining rooms, sending messages and
//!   delivery acknowledgments
//! - **Per-identity send throttling** to protect against abuse
//!
//! Identity is established upstream; see [`auth`].

mod api;
mod auth;
mod config;
mod error;
mod throttle;
mod ws;

use tracing::info;
use tracing_subscriber::EnvFilter;

use enclave_engine::ChatEngine;
use enclave_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,enclave_server=debug,enclave_engine=debug")
        }))
        .init();

    info!("Starting Enclave chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open storage and build the engine
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Opened database");

    let engine = ChatEngine::new(db, config.engine.clone());
    let app_state = AppState::new(engine, &config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic throttle cleanup (every 5 minutes, evict buckets idle >10 min)
    let throttle = app_state.throttle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            throttle.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
