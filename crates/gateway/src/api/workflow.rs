//! Workflow API — start, advance, query, and terminate sessions; the
//! webhook return channel; event replay for audit.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use tempo_domain::{Error, NodeResult};

use crate::api::{auth, ApiError};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub inherit_session: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    pub step: String,
    #[serde(flatten)]
    pub result: NodeResult,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/workflow/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();
    state.metrics.inc("sessions_total");

    let result = async {
        let session_id = match (&request.flow_id, &request.node_id) {
            (Some(flow_id), _) => match &request.inherit_session {
                Some(from) => {
                    state
                        .session_manager
                        .inherit(&tenant, flow_id, from, &request.params)
                        .await?
                }
                None => {
                    state
                        .session_manager
                        .start_flow(&tenant, flow_id, &request.params)
                        .await?
                }
            },
            (None, Some(node_id)) => {
                state
                    .session_manager
                    .start_single_node(&tenant, node_id, &request.params)
                    .await?
            }
            (None, None) => {
                return Err(Error::BadRequest(
                    "either flow_id or node_id must be provided".into(),
                ))
            }
        };

        // Run the initial step (explicit flows start at their first node;
        // implicit sessions run their single node).
        let outcome = state.dispatcher.run_current(&tenant, &session_id).await?;
        Ok::<_, Error>(json!({
            "session_id": session_id,
            "state": outcome.state,
            "flow_id": request.flow_id,
            "disposition": format!("{:?}", outcome.disposition),
            "ui_schema": outcome.result.as_ref().and_then(|r| r.ui_schema.clone()),
        }))
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/workflow/:session_id/event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn push_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<EventRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    let result = async {
        if request.event_type.is_empty() || request.event_type != request.event_type.to_uppercase()
        {
            return Err(Error::BadRequest(format!(
                "event_type must be UPPERCASE, got '{}'",
                request.event_type
            )));
        }
        state
            .session_manager
            .push_event(&tenant, &session_id, &request.event_type, request.payload.clone())
            .await?;
        let outcome = state
            .dispatcher
            .dispatch(&tenant, &session_id, &request.event_type)
            .await?;
        let status = state.session_manager.status(&tenant.tenant_id, &session_id).await?;
        Ok::<_, Error>(json!({
            "new_state": outcome.state,
            "session_state": status,
            "disposition": format!("{:?}", outcome.disposition),
            "ui_schema": outcome.result.as_ref().and_then(|r| r.ui_schema.clone()),
            "result": outcome.result.as_ref().map(|r| r.result.clone()),
        }))
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/workflow/:session_id/state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    let result = async {
        let status = state.session_manager.status(&tenant.tenant_id, &session_id).await?;
        let machine = state.session_manager.machine(&tenant.tenant_id, &session_id);
        let current = machine.current_state(&state.store, &tenant.tenant_id, &session_id);
        Ok::<_, Error>(json!({
            "session_id": session_id,
            "current_state": current,
            "session_state": status,
            "flow_id": state.session_manager.flow_id(&tenant.tenant_id, &session_id),
            "valid_events": machine.valid_events(&current),
        }))
    }
    .await;

    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /api/workflow/:session_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn terminate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    match state
        .stopper
        .abort(
            &tenant.tenant_id,
            &session_id,
            "user requested termination",
            Some(trace_id.clone()),
        )
        .await
    {
        Ok(()) => {
            state.metrics.inc("sessions_aborted");
            Json(json!({ "status": "terminated", "session_id": session_id })).into_response()
        }
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/workflow/:session_id/callback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<CallbackRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    match state
        .dispatcher
        .handle_callback(&tenant, &session_id, &request.step, request.result)
        .await
    {
        Ok(outcome) => Json(json!({
            "status": "received",
            "session_id": session_id,
            "state": outcome.state,
            "disposition": format!("{:?}", outcome.disposition),
        }))
        .into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/workflow/:session_id/events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Event replay for audit: all records in insertion order.
pub async fn replay_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    match state.events.replay(&session_id).await {
        Ok(records) => {
            let events: Vec<Value> = records
                .into_iter()
                .filter(|r| r.tenant_id == tenant.tenant_id)
                .map(|r| {
                    json!({
                        "event_id": r.event_id,
                        "type": r.event_type,
                        "source": r.source,
                        "target": r.target,
                        "tick": r.tick,
                        "trace_id": r.trace_id,
                        "priority": r.priority,
                        "from_state": r.from_state,
                        "to_state": r.to_state,
                        "payload": serde_json::from_str::<Value>(&r.payload)
                            .unwrap_or(Value::Null),
                        "created_at": r.created_at,
                    })
                })
                .collect();
            Json(json!({
                "session_id": session_id,
                "count": events.len(),
                "events": events,
            }))
            .into_response()
        }
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}
