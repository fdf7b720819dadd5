//! Blackboard debug/admin API — read and write session state directly.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::{auth, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StateWriteRequest {
    pub value: Value,
}

pub async fn get_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let fields = state.blackboard.get_all_state(&tenant.tenant_id, &session_id);
    Json(json!({
        "session_id": session_id,
        "state": fields,
        "artifacts": state.blackboard.list_artifacts(&tenant.tenant_id, &session_id),
    }))
    .into_response()
}

pub async fn get_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((session_id, key)): Path<(String, String)>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let value = state.blackboard.get_state(&tenant.tenant_id, &session_id, &key);
    Json(json!({ "session_id": session_id, "key": key, "value": value })).into_response()
}

pub async fn put_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((session_id, key)): Path<(String, String)>,
    Json(request): Json<StateWriteRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    state
        .blackboard
        .set_state(&tenant.tenant_id, &session_id, &key, &request.value);
    Json(json!({ "session_id": session_id, "key": key, "status": "written" })).into_response()
}
