//! Agent HTTP API using Axum.

use super::{Agent, AgentState};
use crate::error::{ErrorKind, SandboxError};
use crate::protocol::{
    CommandRequest, ContentResponse, ErrorBody, ExecResponse, FileRequest, PackageRequest,
    ReadFileQuery, StatusResponse,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Error half of every handler: `{detail, error_kind}` with a matching status.
pub struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ShuttingDown | ErrorKind::ChannelUnreachable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::InvalidRequest
            | ErrorKind::PathConfinementViolation
            | ErrorKind::CommandNotAllowed
            | ErrorKind::InvalidPackageName => StatusCode::BAD_REQUEST,
            ErrorKind::FileAccess => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/execute", post(execute))
        .route("/api/v1/write_file", post(write_file))
        .route("/api/v1/read_file", get(read_file))
        .route("/api/v1/install", post(install))
        .route("/api/v1/shutdown", post(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

/// Prepare the workspace and serve until the process receives a stop signal.
pub async fn run_agent(port: u16, agent: Arc<Agent>) -> std::io::Result<()> {
    agent
        .prepare()
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting agent on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(agent))
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
}

async fn health(State(agent): State<Arc<Agent>>) -> (StatusCode, Json<StatusResponse>) {
    match agent.state() {
        AgentState::Ready => (StatusCode::OK, Json(StatusResponse::new("healthy"))),
        AgentState::Starting => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse::new("starting")),
        ),
        AgentState::Draining => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse::new("draining")),
        ),
        AgentState::Stopped => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse::new("stopped")),
        ),
    }
}

async fn execute(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    info!("POST /execute - command: {:?}", req.command);
    let result = agent.execute(&req.command).await?;
    info!("POST /execute - exit={}", result.exit_code);
    Ok(Json(result))
}

async fn write_file(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<FileRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    agent.write_file(&req.path, &req.content).await?;
    Ok(Json(StatusResponse::new("success")))
}

async fn read_file(
    State(agent): State<Arc<Agent>>,
    Query(query): Query<ReadFileQuery>,
) -> Result<Json<ContentResponse>, ApiError> {
    let content = agent.read_file(&query.path).await?;
    Ok(Json(ContentResponse { content }))
}

async fn install(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<PackageRequest>,
) -> Result<Json<ExecResponse>, ApiError> {
    Ok(Json(agent.install_package(&req.package).await?))
}

async fn shutdown(State(agent): State<Arc<Agent>>) -> Json<StatusResponse> {
    let state = agent.shutdown();
    info!(state = ?state, "POST /shutdown");
    Json(StatusResponse::new("shutting down"))
}
