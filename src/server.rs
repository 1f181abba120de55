use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{self, AppState, SharedState};
use crate::config::Config;
use crate::executor::{AgentClient, Dispatcher, RepoService};
use crate::hub::{ProgressHub, ws};
use crate::scheduler::{TaskScheduler, TaskStore};

/// Assemble the application state: store, hub, agent client, repository
/// service, dispatcher and scheduler (workers not yet started).
pub fn build_state(config: &Config) -> SharedState {
    let store = Arc::new(TaskStore::new());
    let hub = Arc::new(ProgressHub::new(config.websocket.send_buffer));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(AgentClient::new(config.agent.clone())),
        RepoService::new(config.git.clone()),
    ));
    let scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        store,
        Arc::clone(&hub),
        dispatcher,
    );
    Arc::new(AppState {
        scheduler,
        hub,
        ws_config: config.websocket.clone(),
    })
}

/// Build the full application router: REST API plus the per-task
/// WebSocket subscription endpoint.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/tasks/{id}", get(ws::task_ws_handler))
        .with_state(state)
}

/// Start the server and run until interrupted, then stop the scheduler.
pub async fn start_server(config: Config) -> Result<()> {
    let state = build_state(&config);
    state.scheduler.start().await;

    let mut app = build_router(Arc::clone(&state));
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, "crucible listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.scheduler.shutdown().await;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        return;
    }
    info!("shutdown signal received");
}
