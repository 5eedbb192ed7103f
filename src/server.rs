//! HTTP surface: `POST /api/code` streams one request's events as SSE.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::emitter::sse_response;
use crate::error::{Error, Result};
use crate::orchestrator::{self, CodeRequest, OrchestratorDeps, Request};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// State shared by every handler.
pub struct AppState {
    pub deps: OrchestratorDeps,
}

pub type SharedState = Arc<AppState>;

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidRequest", msg),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "missing or invalid API key".to_string(),
            ),
        };
        (
            status,
            Json(json!({ "error_type": error_type, "message": message })),
        )
            .into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/api/code", post(create_code_request))
        .with_state(state)
}

/// Binds the configured address and serves until Ctrl-C.
pub async fn serve(deps: OrchestratorDeps) -> Result<()> {
    let server = &deps.config.server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address: {}", e)))?;

    let app = router(Arc::new(AppState { deps }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn service_info() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "code": "POST /api/code",
            "health": "GET /health",
        },
    }))
}

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "sandbox_provider": state.deps.sandbox.name(),
        "agent": state.deps.runner.name(),
    }))
}

async fn create_code_request(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: std::result::Result<Json<CodeRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let server = &state.deps.config.server;
    if server.require_auth {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented.is_none() || presented != server.api_key.as_deref() {
            tracing::warn!("rejected request with missing or invalid API key");
            return Err(ApiError::Unauthorized);
        }
    }

    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = Request::new(&body, &state.deps.config.limits)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(
        request_id = %request.id,
        repo = %request.repo,
        prompt_chars = request.prompt.chars().count(),
        "accepted code request"
    );

    let handle = orchestrator::spawn(request, state.deps.clone());
    // The task runs to its terminal state on its own; the stream only
    // observes it.
    drop(handle.task);

    let mut response = sse_response(handle.events, handle.cancel).into_response();
    if let Ok(value) = HeaderValue::from_str(&handle.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}
