//! LLM gateway endpoints — thin tenant-authenticated proxies over the LLM
//! client, sharing its retry policy.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use tempo_domain::llm::ChatMessage;
use tempo_domain::Error;

use crate::api::{auth, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatProxyRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub texts: Vec<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatProxyRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    if request.messages.is_empty() {
        return ApiError::new(Error::BadRequest("messages must not be empty".into()), trace_id)
            .into_response();
    }

    match state
        .llm
        .chat(&request.messages, None, request.model.as_deref())
        .await
    {
        Ok(completion) => Json(json!({
            "content": completion.content,
            "model": request.model.unwrap_or_else(|| state.llm.default_model().to_owned()),
            "usage": {
                "input_tokens": completion.usage.input_tokens,
                "output_tokens": completion.usage.output_tokens,
                "total_tokens": completion.usage.total_tokens,
            },
        }))
        .into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}

pub async fn embedding(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EmbeddingRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    if request.texts.is_empty() {
        return ApiError::new(Error::BadRequest("texts must not be empty".into()), trace_id)
            .into_response();
    }

    match state.llm.embeddings(&request.texts).await {
        Ok(vectors) => {
            let dim = vectors.first().map(Vec::len).unwrap_or(0);
            Json(json!({ "vectors": vectors, "dim": dim })).into_response()
        }
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}
