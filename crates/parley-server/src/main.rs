//! # parley-server
//!
//! Real-time messaging server for Parley.
//!
//! This binary provides:
//! - **WebSocket event surface** for presence, message delivery, seen
//!   receipts, typing and reactions
//! - **Duplicate-send suppression** so client retries never persist or
//!   deliver a message twice
//! - **REST API** (axum) for health checks, profiles, conversations and
//!   message history
//! - **SQLite storage** through `parley-store`

mod api;
mod backend;
mod config;
mod connection;
mod dedup;
mod dispatcher;
mod error;
mod messaging;
mod presence;
mod rooms;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_shared::constants::APP_NAME;
use parley_store::Database;

use crate::api::AppState;
use crate::backend::{SqliteBackend, Stores};
use crate::config::ServerConfig;
use crate::dedup::DuplicateGuard;
use crate::dispatcher::Dispatcher;
use crate::messaging::Messaging;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Store (creates the parent directory and runs migrations)
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Opened database");
    let stores = Stores::sqlite(SqliteBackend::new(db));

    // Process-local registries
    let presence = Arc::new(PresenceRegistry::new(config.multi_device));
    let rooms = Arc::new(RoomRegistry::new());
    let dispatcher = Dispatcher::new(presence, rooms);
    let guard = DuplicateGuard::new(config.duplicate_window);

    let messaging = Messaging::new(stores, guard.clone(), dispatcher);

    let app_state = AppState {
        messaging,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic duplicate-entry sweep (never longer than three windows)
    let sweep_every = config.duplicate_sweep;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            guard.sweep();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
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
