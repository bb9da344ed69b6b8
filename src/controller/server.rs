//! Controller HTTP front using Axum.

use super::Controller;
use crate::protocol::{tool_specification, OperationResult, StatusResponse};
use crate::state::SessionInfo;
use axum::{
    body::Bytes,
    extract::State,
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::info;

const REAP_INTERVAL: Duration = Duration::from_secs(60);

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/api/v1/action", post(action))
        .route("/api/v1/sessions", get(list_sessions))
        .route("/api/v1/health", get(health))
        .route("/api/v1/tool", get(tool))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

/// Serve until a stop signal, then stop every session.
pub async fn run_controller(port: u16, controller: Arc<Controller>) -> std::io::Result<()> {
    if let Some(ttl) = controller.config().idle_timeout {
        let reaper = controller.clone();
        tokio::spawn(async move {
            let mut interval = interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let reaped = reaper.reap_idle(ttl).await;
                if !reaped.is_empty() {
                    info!(sessions = ?reaped, "Reaped idle sessions");
                }
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting controller on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(controller.clone()))
        .with_graceful_shutdown(crate::shutdown_signal())
        .await?;

    controller.shutdown_all().await;
    Ok(())
}

/// Always 200: failures are reported inside the result.
async fn action(State(controller): State<Arc<Controller>>, body: Bytes) -> Json<OperationResult> {
    Json(controller.handle_json(&body).await)
}

async fn list_sessions(State(controller): State<Arc<Controller>>) -> Json<Vec<SessionInfo>> {
    Json(controller.sessions().await)
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::new("healthy"))
}

async fn tool() -> Json<serde_json::Value> {
    Json(tool_specification())
}
