//! # veillee-server
//!
//! Room hub for the veillée watch-party service.
//!
//! This binary provides:
//! - **Authenticated WebSocket hub**: session-token auth, per-room
//!   presence and fan-out, liveness enforcement under hostile networks
//! - **Blind relay**: `encrypted` and `key-exchange` payloads are
//!   forwarded opaquely -- the server never sees plaintext
//! - **Room lifecycle**: on-demand creation, empty-grace deletion timers
//! - **Control plane** (axum): create room, join preflight, preview,
//!   health probe
//! - **Metadata mirror**: optional redis cache so room metadata survives
//!   restarts and is shared across instances

mod api;
mod auth;
mod config;
mod connection;
mod error;
mod mirror;
mod presence;
mod registry;
mod router;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::mirror::RoomMirror;
use crate::registry::RoomRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,veillee_server=debug")),
        )
        .init();

    info!("Starting veillée room hub v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load and validate configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    config.validate()?;
    info!(
        addr = %config.http_addr,
        production = config.production,
        mirror = config.cache_url.is_some(),
        default_encryption = config.default_encryption_required,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let verifier = Arc::new(TokenVerifier::new(
        config.session_secret.as_deref(),
        config.token_audience.as_deref(),
    ));
    info!(dev_mode = verifier.dev_mode(), "Token verifier initialized");

    let registry = RoomRegistry::new(config.default_encryption_required, config.room_empty_grace);

    let mirror = match &config.cache_url {
        Some(url) => match RoomMirror::connect(url, config.room_empty_grace).await {
            Ok(mirror) => {
                info!("Metadata mirror connected");
                Some(mirror)
            }
            Err(e) => {
                warn!(error = %e, "Metadata mirror unavailable, running in-memory only");
                None
            }
        },
        None => None,
    };

    // -----------------------------------------------------------------------
    // 4. Background: forward room deletions to the mirror
    // -----------------------------------------------------------------------
    if let Some(mirror) = mirror.clone() {
        let mut deletions = registry.deletions();
        tokio::spawn(async move {
            loop {
                match deletions.recv().await {
                    Ok(room_id) => mirror.delete(&room_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed room-deletion notifications");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        verifier,
        registry,
        mirror,
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, config.http_addr) => {
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
