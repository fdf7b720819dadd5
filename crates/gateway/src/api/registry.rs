//! Registry API — node and flow registration and listing.
//!
//! Registrations are upserted into the durable registry tables so peer
//! instances converge at their next startup reload.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use tempo_domain::node::{NodeInfo, NodeKind};
use tempo_domain::Error;
use tempo_kernel::flow::FlowDefinition;
use tempo_kernel::registry::WebhookNode;

use crate::api::{auth, ApiError};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct NodeRegistrationRequest {
    pub node_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub param_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct FlowRegistrationRequest {
    pub flow_id: String,
    pub name: String,
    pub yaml_content: String,
    #[serde(default)]
    pub description: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_nodes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = auth::tenant_from_headers(&headers) {
        return ApiError::new(e, "").into_response();
    }
    Json(json!({ "nodes": state.registry.list() })).into_response()
}

/// Register (or replace) an external webhook node.
pub async fn register_node(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NodeRegistrationRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    if !(request.endpoint.starts_with("http://") || request.endpoint.starts_with("https://")) {
        return ApiError::new(
            Error::BadRequest(format!("endpoint must be http(s): {}", request.endpoint)),
            trace_id,
        )
        .into_response();
    }

    let name = if request.name.is_empty() {
        request.node_id.clone()
    } else {
        request.name.clone()
    };
    let info = NodeInfo {
        node_id: request.node_id.clone(),
        node_type: NodeKind::Webhook,
        name: name.clone(),
        description: request.description.clone(),
        endpoint: Some(request.endpoint.clone()),
        param_schema: request.param_schema.clone(),
    };

    state.registry.register_webhook(WebhookNode {
        node_id: request.node_id.clone(),
        name,
        endpoint: request.endpoint.clone(),
        description: request.description.clone(),
        param_schema: request.param_schema,
    });
    if let Err(e) = state.node_repo.upsert(&info).await {
        return ApiError::new(e, trace_id).into_response();
    }

    Json(json!({ "node": info })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Flows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_flows(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = auth::tenant_from_headers(&headers) {
        return ApiError::new(e, "").into_response();
    }
    let flows: Vec<Value> = state
        .flows
        .list()
        .into_iter()
        .map(|(flow_id, name, description)| {
            json!({ "flow_id": flow_id, "name": name, "description": description })
        })
        .collect();
    Json(json!({ "flows": flows })).into_response()
}

/// Register (or replace) a flow from its YAML definition.
pub async fn register_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FlowRegistrationRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    let mut flow = match FlowDefinition::from_yaml(&request.yaml_content) {
        Ok(flow) => flow,
        Err(e) => return ApiError::new(e, trace_id).into_response(),
    };
    flow.name = request.name.clone();
    flow.description = request.description.clone();

    let builtins = state.registry.builtin_ids();
    let errors = state.flows.register(&request.flow_id, flow, Some(&builtins));
    if !errors.is_empty() {
        return ApiError::new(
            Error::BadRequest(format!("flow validation failed: {}", errors.join("; "))),
            trace_id,
        )
        .into_response();
    }

    if let Err(e) = state
        .flow_repo
        .upsert(&request.flow_id, &request.name, &request.description, &request.yaml_content)
        .await
    {
        return ApiError::new(e, trace_id).into_response();
    }
    state.metrics.set_gauge("flows_registered", state.flows.len() as f64);

    Json(json!({
        "flow_id": request.flow_id,
        "name": request.name,
        "description": request.description,
    }))
    .into_response()
}

pub async fn get_flow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(flow_id): Path<String>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };

    match state.flows.get(&flow_id) {
        Some(flow) => Json(json!({
            "flow_id": flow_id,
            "name": flow.name,
            "description": flow.description,
            "states": flow.states,
            "initial_state": flow.initial_state,
            "transitions": flow.transitions,
            "state_node_map": flow.state_node_map,
            "user_input_states": flow.user_input_states,
        }))
        .into_response(),
        None => ApiError::new(Error::FlowNotFound(flow_id), tenant.trace_id).into_response(),
    }
}
