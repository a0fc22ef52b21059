//! WebSocket relay between harbor controllers and targets.
//!
//! The relay never interprets commands: it checks that each frame is a typed
//! JSON object, stamps controller identity, and hands it to the bus, which
//! forwards it to the other role.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod state;
pub mod telemetry;
pub mod websocket;

use std::future::Future;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

pub use config::RelayConfig;
pub use state::{RelayState, StatsResponse};

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_handler))
        .route("/debug/stats", get(handlers::stats_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("harbor-relay listening on {}", addr);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}
