//! HTTP API alongside the relay: health probes, online count, and the
//! progress acknowledgement endpoint.

use std::any::Any;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use sysinfo::{ProcessesToUpdate, System};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};

use crate::error::RelayError;
use crate::hub::RelayHub;

/// Environment variables whose presence marks an AI provider as configured.
const AI_PROVIDER_KEYS: [(&str, &str); 3] = [
    ("openai", "OPENAI_API_KEY"),
    ("claude", "CLAUDE_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
];

#[derive(Clone)]
struct ApiState {
    hub: RelayHub,
    started: Instant,
}

/// Errors returned by API handlers. Internal details never reach the client.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::Internal(detail) => {
                log::error!("API error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Build the API router.
pub fn router(hub: RelayHub, started: Instant) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/api/health", get(api_health))
        .route("/api/users/online", get(online_users))
        .route("/api/progress", post(progress))
        .fallback(not_found)
        .with_state(ApiState { hub, started });
    with_error_handling(routes)
}

/// CORS for any origin and a 500 for panicking handlers.
pub fn with_error_handling(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin),
        )
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    ApiError::Internal("handler panicked".to_string()).into_response()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": timestamp() }))
}

async fn api_health(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let stats = state.hub.stats().await?;
    let ai: serde_json::Map<String, Value> = AI_PROVIDER_KEYS
        .iter()
        .map(|(provider, var)| {
            let configured = std::env::var(var).is_ok_and(|v| !v.trim().is_empty());
            (provider.to_string(), Value::Bool(configured))
        })
        .collect();

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "uptime": state.started.elapsed().as_secs_f64(),
        "memory": { "rssBytes": resident_memory_bytes() },
        "connectedUsers": stats.online_users,
        "connections": stats.connections,
        "services": {
            "realtime": true,
            "ai": ai,
        },
    })))
}

async fn online_users(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let count = state.hub.online_count().await?;
    Ok(Json(json!({ "count": count })))
}

/// Acknowledge a progress report. Nothing is stored.
async fn progress(body: Result<Json<Value>, JsonRejection>) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user_id = match body.get("userId") {
        Some(Value::String(s)) if !s.trim().is_empty() => Value::String(s.clone()),
        Some(Value::Number(n)) => Value::Number(n.clone()),
        _ => return Err(ApiError::BadRequest("userId is required".to_string())),
    };
    if body.get("progress").map_or(true, Value::is_null) {
        return Err(ApiError::BadRequest("progress is required".to_string()));
    }

    log::info!("Progress received for user {user_id}");
    Ok(Json(json!({
        "success": true,
        "message": "Progress received",
        "userId": user_id,
        "timestamp": timestamp(),
    })))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Resident memory of this process, `None` on platforms sysinfo does not cover.
fn resident_memory_bytes() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map(sysinfo::Process::memory)
}
