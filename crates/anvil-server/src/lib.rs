//! Anvil Server
//!
//! HTTP/JSON surface of the workflow orchestrator. Every route lives under
//! `/api/v1`; errors are returned as `{"code": ..., "message": ...}` with a
//! status derived from the code, so clients recover the same error taxonomy
//! the orchestrator uses.

pub mod api;
pub mod config;
pub mod error;

pub use config::*;
pub use error::*;

use anvil_workflow::{create_store, Orchestrator};
use anyhow::Context;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown; ends open context streams
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api::api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until `shutdown` is cancelled
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let store = create_store(&config.store)
        .await
        .context("Failed to open workflow store")?;
    let orchestrator = Arc::new(Orchestrator::with_config(store, config.orchestrator.clone()));
    let app = router(AppState::new(orchestrator, shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(address = %config.bind, store = ?config.store, "Anvil server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Server error")?;

    info!("Anvil server stopped");
    Ok(())
}
