//! `POST /api/oss/post-signature` — short-lived POST policies for browser
//! direct upload. The server never touches file bytes.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use tempo_domain::Error;

use crate::api::{auth, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PostSignatureRequest {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Optional subdir under the tenant/user prefix (e.g. `templates/`).
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "d_expire")]
    pub expire_seconds: i64,
}

fn d_expire() -> i64 {
    600
}

pub async fn post_signature(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PostSignatureRequest>,
) -> Response {
    let tenant = match auth::tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    if request.filename.trim().is_empty() {
        return ApiError::new(Error::BadRequest("filename must not be empty".into()), trace_id)
            .into_response();
    }
    if !(30..=3600).contains(&request.expire_seconds) {
        return ApiError::new(
            Error::BadRequest("expire_seconds must be within 30..=3600".into()),
            trace_id,
        )
        .into_response();
    }
    if !state.signer.is_configured() {
        return (
            StatusCode::NOT_IMPLEMENTED,
            Json(serde_json::json!({
                "code": "INTERNAL_ERROR",
                "message": "OSS signing is not configured",
                "retryable": false,
                "trace_id": trace_id,
            })),
        )
            .into_response();
    }

    match state.signer.sign(
        &tenant,
        request.filename.trim(),
        request.dir.as_deref(),
        request.expire_seconds,
    ) {
        Ok(policy) => Json(policy).into_response(),
        Err(e) => ApiError::new(e, trace_id).into_response(),
    }
}
