//! # causerie-server
//!
//! Write and delivery node for direct-message chat.
//!
//! This binary provides:
//! - **Submission endpoint** that verifies a client's signed RPC, validates
//!   it against the current chat state, and applies it
//! - **Relay endpoint** that applies envelopes already accepted by a peer
//! - **Notification bus** that turns committed RPCs into pushes
//! - **Websocket registry** for the clients connected to this process

mod abuse;
mod api;
mod bus;
mod config;
mod error;
mod inbox;
mod processor;
mod rate_limit;
mod registry;
mod validator;

use std::sync::Arc;

use causerie_shared::IdCodec;
use causerie_store::Database;
use tokio::sync::{watch, Mutex, Notify};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::abuse::AbuseOracle;
use crate::api::AppState;
use crate::bus::{BusConfig, NotificationBus};
use crate::config::ServerConfig;
use crate::processor::RpcProcessor;
use crate::rate_limit::RateLimiter;
use crate::registry::WebsocketRegistry;
use crate::validator::Validator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting causerie server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        aao_enabled = config.aao_server.is_some(),
        blast_push_delay_secs = config.blast_push_delay.as_secs(),
        "Delivery settings"
    );

    let codec = Arc::new(IdCodec::new(
        config.id_min_length,
        config.id_alphabet.as_deref(),
    )?);

    // -----------------------------------------------------------------------
    // 3. Open the store
    // -----------------------------------------------------------------------
    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => Database::default_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Arc::new(Mutex::new(Database::open_at(&db_path)?));

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let oracle = AbuseOracle::new(config.aao_server.clone(), config.aao_timeout)?;
    let rate_limiter = RateLimiter::new(config.rate_limit.clone());
    let wake = Arc::new(Notify::new());
    let registry = WebsocketRegistry::new(config.ws_replay_ttl, config.ws_send_queue);

    let processor = RpcProcessor::new(db.clone(), codec.clone(), wake.clone());
    let validator = Validator::new(db.clone(), codec.clone(), rate_limiter, oracle);

    let app_state = AppState {
        db,
        codec: codec.clone(),
        processor,
        validator,
        registry: registry.clone(),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn the notification bus on its own connection
    // -----------------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus = NotificationBus::new(
        Database::open_at(&db_path)?,
        codec,
        registry,
        wake,
        BusConfig {
            poll_interval: config.event_poll_interval,
            retention: config.event_retention,
            blast_delay: config.blast_push_delay,
        },
    )?;
    let bus_task = tokio::spawn(bus.run(shutdown_rx.clone()));

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr, shutdown_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = bus_task.await {
        tracing::error!(error = %e, "Notification bus task failed");
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}
