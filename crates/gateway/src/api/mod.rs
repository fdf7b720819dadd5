pub mod agent;
pub mod auth;
pub mod blackboard;
pub mod llm;
pub mod observability;
pub mod oss;
pub mod registry;
pub mod sse;
pub mod workflow;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;

use tempo_domain::Error;

use crate::state::AppState;

/// Build the full API router. Every tenant-bound route extracts the tenant
/// context from headers; trace ids are attached by the middleware in
/// [`auth`].
pub fn router(state: AppState) -> Router {
    Router::new()
        // Agent chat (SSE)
        .route("/api/agent/chat", post(agent::chat))
        // Workflow engine
        .route("/api/workflow/start", post(workflow::start))
        .route("/api/workflow/:session_id/event", post(workflow::push_event))
        .route("/api/workflow/:session_id/state", get(workflow::get_state))
        .route("/api/workflow/:session_id", delete(workflow::terminate))
        .route("/api/workflow/:session_id/callback", post(workflow::callback))
        .route("/api/workflow/:session_id/events", get(workflow::replay_events))
        // Registry
        .route("/api/registry/nodes", get(registry::list_nodes))
        .route("/api/registry/nodes", post(registry::register_node))
        .route("/api/registry/flows", get(registry::list_flows))
        .route("/api/registry/flows", post(registry::register_flow))
        .route("/api/registry/flows/:flow_id", get(registry::get_flow))
        // Upload signing
        .route("/api/oss/post-signature", post(oss::post_signature))
        // LLM gateway
        .route("/api/llm/chat", post(llm::chat))
        .route("/api/llm/embedding", post(llm::embedding))
        // Blackboard (debug/admin)
        .route("/api/state/:session_id", get(blackboard::get_all))
        .route("/api/state/:session_id/:key", get(blackboard::get_key))
        .route("/api/state/:session_id/:key", put(blackboard::put_key))
        // Liveness
        .route("/health", get(observability::health))
        .route("/api/metrics", get(observability::metrics))
        .layer(axum::middleware::from_fn(auth::trace_layer))
        .with_state(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wrapper turning the shared [`Error`] into the unified wire shape:
/// `{ code, message, retryable, trace_id }`.
pub struct ApiError {
    pub error: Error,
    pub trace_id: String,
}

impl ApiError {
    pub fn new(error: Error, trace_id: impl Into<String>) -> Self {
        Self {
            error,
            trace_id: trace_id.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(serde_json::json!({
                "code": self.error.code(),
                "message": self.error.to_string(),
                "retryable": self.error.retryable(),
                "trace_id": self.trace_id,
            })),
        )
            .into_response()
    }
}
