//! The capture listener — a bus subscriber that bridges events to the
//! Tonglu data service.
//!
//! Two jobs:
//!   - FILE_UPLOADED → parse the object-store file, answer FILE_READY
//!     (the chat controller waits on this)
//!   - EVENT_RESULT → forward declared artifacts into the data service
//!     (fire-and-forget; the audit log is the source of truth)

use serde_json::json;

use tempo_domain::event::{EVENT_RESULT, FILE_READY, FILE_UPLOADED};
use tempo_domain::EventEnvelope;

use crate::state::AppState;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = state.bus.subscribe_all();
        tracing::info!("capture listener started");
        while let Some(event) = subscription.recv().await {
            match event.kind.as_str() {
                FILE_UPLOADED => {
                    let state = state.clone();
                    tokio::spawn(async move { parse_file(state, event).await });
                }
                EVENT_RESULT => {
                    let state = state.clone();
                    tokio::spawn(async move { capture_artifacts(state, event).await });
                }
                _ => {}
            }
        }
        tracing::info!("capture listener stopped");
    })
}

/// Parse one uploaded file and publish FILE_READY. Failures still answer
/// (with empty text) so waiting chat turns do not sit out the full deadline.
async fn parse_file(state: AppState, event: EventEnvelope) {
    let file_url = event.payload["file_url"].as_str().unwrap_or_default().to_owned();
    let file_name = event.payload["file_name"].as_str().unwrap_or_default().to_owned();
    if file_url.is_empty() {
        return;
    }

    let text = match parse_via_tonglu(&state, &event, &file_url, &file_name).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(file = %file_name, error = %e, "file parse failed");
            state.metrics.inc("file_parse_errors");
            String::new()
        }
    };

    match EventEnvelope::new(FILE_READY, "capture", &event.tenant_id, &event.session_id) {
        Ok(ready) => {
            state.bus.publish(&ready.with_trace(event.trace_id.clone()).with_payload(json!({
                "file_url": file_url,
                "file_name": file_name,
                "text_content": text,
            })));
            state.metrics.inc("files_parsed");
        }
        Err(e) => tracing::error!(error = %e, "FILE_READY envelope"),
    }
}

async fn parse_via_tonglu(
    state: &AppState,
    event: &EventEnvelope,
    file_url: &str,
    file_name: &str,
) -> tempo_domain::Result<String> {
    let task_id = state
        .tonglu
        .ingest_url(file_url, file_name, &event.tenant_id, None)
        .await?;
    let record = state.tonglu.wait_for_task(&task_id).await?;
    Ok(record["text_content"]
        .as_str()
        .or_else(|| record["content"].as_str())
        .unwrap_or_default()
        .to_owned())
}

/// Forward a result's artifacts to the data service for later retrieval.
async fn capture_artifacts(state: AppState, event: EventEnvelope) {
    let Some(artifact_ids) = event.payload["artifacts"].as_array() else {
        return;
    };
    for artifact_id in artifact_ids.iter().filter_map(|v| v.as_str()) {
        let Some(value) =
            state
                .blackboard
                .read_artifact(&event.tenant_id, &event.session_id, artifact_id)
        else {
            continue;
        };
        let metadata = json!({
            "session_id": event.session_id,
            "artifact_id": artifact_id,
            "source_event": event.id,
        });
        if let Err(e) = state
            .tonglu
            .ingest(&value, &event.tenant_id, Some("artifact"), Some(&metadata))
            .await
        {
            tracing::debug!(artifact_id, error = %e, "artifact capture skipped");
            return;
        }
        state.metrics.inc("artifacts_captured");
    }
}
