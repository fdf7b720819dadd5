//! Liveness and counters.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "flows_registered": state.flows.len(),
        "nodes_registered": state.registry.len(),
        "metrics": state.metrics.snapshot(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.metrics.snapshot())
}
