//! HTTP tool server
//!
//! Exposes the tool catalogue, tool dispatch and the read-only resource
//! snapshots over JSON. The background sync engine runs alongside the
//! listener and both stop on Ctrl+C.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::tools::{builtin_tools, execute_tool, Collective, ToolCall};

/// Listener address for `serve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub collective: Arc<Collective>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (status, Json(ErrorResponse { error: error.to_string() })).into_response()
}

async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.collective.status().await)
}

async fn tools_handler() -> impl IntoResponse {
    Json(builtin_tools())
}

/// Tools read and write the snapshot file, so they run on the blocking pool
async fn call_handler(State(state): State<ServerState>, Json(call): Json<ToolCall>) -> Response {
    let collective = state.collective.clone();
    let handle = tokio::runtime::Handle::current();
    match tokio::task::spawn_blocking(move || handle.block_on(execute_tool(&call, &collective))).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn knowledge_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.collective.knowledge_snapshot())
}

async fn problems_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.collective.problem_snapshot())
}

async fn sync_handler(State(state): State<ServerState>) -> Response {
    match state.collective.sync_now().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(crate::error::Error::InvalidInput(e)) => error_response(StatusCode::CONFLICT, e),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

/// Routes over a shared [`Collective`]
pub fn router(collective: Arc<Collective>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/tools", get(tools_handler))
        .route("/api/tools/call", post(call_handler))
        .route("/api/resources/knowledge", get(knowledge_handler))
        .route("/api/resources/problems", get(problems_handler))
        .route("/api/sync", post(sync_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ServerState { collective })
}

/// Serve until Ctrl+C, running background sync alongside
pub async fn serve(collective: Arc<Collective>, config: &ServerConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let sync_task = collective.sync_engine().cloned().map(|engine| {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);
    println!("collective-memory listening on http://{} (Ctrl+C to stop)", addr);

    let mut server_shutdown = shutdown_tx.subscribe();
    let app = router(collective.clone());
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = server_shutdown.recv().await;
    });
    let server = tokio::spawn(async move { server.await });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Err(e)) => warn!("Server error during shutdown: {}", e),
        Err(e) => warn!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(task) = sync_task {
        if let Err(e) = task.await {
            warn!("Sync task failed: {}", e);
        }
    }

    collective.shutdown().context("Failed to flush knowledge store")?;
    Ok(())
}
