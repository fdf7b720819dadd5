//! The streaming chat endpoint — `POST /api/agent/chat`.
//!
//! Pre-stream failures surface as HTTP errors; anything after the stream
//! starts becomes an `error` frame followed by `done` while the HTTP status
//! stays 200. Idle gaps are filled with `ping` frames.

use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::Stream;

use tempo_domain::{Error, TenantContext};

use crate::api::{auth, sse, ApiError};
use crate::runtime::{run_chat_turn, ChatFrame, ChatRequest};
use crate::state::AppState;

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    let tenant = match auth::chat_tenant_from_headers(&headers) {
        Ok(tenant) => tenant,
        Err(e) => return ApiError::new(e, "").into_response(),
    };
    let trace_id = tenant.trace_id.clone();

    if request.messages.is_empty() {
        return ApiError::new(
            Error::BadRequest("messages must not be empty".into()),
            trace_id,
        )
        .into_response();
    }
    if request
        .messages
        .iter()
        .all(|m| m.content.trim().is_empty() && m.files.is_empty())
    {
        return ApiError::new(
            Error::BadRequest("no message content provided".into()),
            trace_id,
        )
        .into_response();
    }

    // Resolve or create the session before the stream starts, so session
    // errors are proper HTTP responses.
    let session_id = match resolve_session(&state, &tenant, &request).await {
        Ok(session_id) => session_id,
        Err(e) => return ApiError::new(e, trace_id).into_response(),
    };

    // Input lock: one streaming turn per session. Held by the stream and
    // released when it ends — the `done` frame is the release signal.
    let permit = match state.session_locks.try_acquire(&session_id) {
        Ok(permit) => permit,
        Err(_) => {
            return ApiError::new(
                Error::RateLimited(format!("session {session_id} has a turn in progress")),
                trace_id,
            )
            .into_response()
        }
    };

    let ping_interval = Duration::from_secs(state.config.server.sse_ping_interval_secs);
    let rx = run_chat_turn(state, tenant, session_id, request);

    Sse::new(frame_stream(rx, permit, ping_interval)).into_response()
}

/// Turn the frame channel into an SSE stream, inserting `ping` frames on
/// idle and closing after `done`.
fn frame_stream(
    mut rx: tokio::sync::mpsc::Receiver<ChatFrame>,
    permit: tokio::sync::OwnedSemaphorePermit,
    ping_interval: Duration,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut ping = tokio::time::interval(ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            let is_done = matches!(frame, ChatFrame::Done { .. });
                            ping.reset();
                            yield Ok(sse::frame_event(&frame));
                            if is_done {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    yield Ok(sse::ping_event());
                }
            }
        }
        // Input lock released here, when the stream closes.
        drop(permit);
    }
}

/// Resume the referenced session or create a fresh implicit one. A supplied
/// session id that cannot be resolved (evicted beyond snapshot recovery) is
/// the client's error.
async fn resolve_session(
    state: &AppState,
    tenant: &TenantContext,
    request: &ChatRequest,
) -> Result<String, Error> {
    match &request.session_id {
        Some(session_id) if !session_id.is_empty() => {
            state
                .session_manager
                .ensure_live(&tenant.tenant_id, session_id)
                .await
                .map_err(|e| match e {
                    Error::SessionNotFound(id) => {
                        Error::BadRequest(format!("unknown session '{id}'"))
                    }
                    other => other,
                })?;
            Ok(session_id.clone())
        }
        _ => {
            state
                .session_manager
                .start_single_node(
                    tenant,
                    crate::runtime::turn::CHAT_NODE_ID,
                    &serde_json::json!({}),
                )
                .await
        }
    }
}
