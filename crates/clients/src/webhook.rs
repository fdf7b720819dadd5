//! Webhook caller — dispatches execution requests to out-of-process nodes.
//!
//! The endpoint is expected to accept the request and later POST its
//! [`tempo_domain::NodeResult`] to the callback URL; the call here only
//! reports whether the hand-off was accepted.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use tempo_domain::Result;

use crate::from_reqwest;

/// Body POSTed to a webhook node.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookCall {
    pub session_id: String,
    pub tenant_id: String,
    pub step: String,
    pub attempt: u32,
    pub params: Value,
    pub callback_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Result of the dispatch hand-off (not of the node's work).
#[derive(Debug, Clone)]
pub struct WebhookAccepted {
    pub status_code: u16,
    pub accepted: bool,
    pub body: String,
}

pub struct WebhookCaller {
    client: reqwest::Client,
}

impl WebhookCaller {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| from_reqwest("webhook", e))?;
        Ok(Self { client })
    }

    pub async fn call(&self, endpoint: &str, call: &WebhookCall) -> Result<WebhookAccepted> {
        tracing::info!(
            endpoint = %endpoint,
            session_id = %call.session_id,
            step = %call.step,
            "webhook dispatch"
        );
        let resp = self
            .client
            .post(endpoint)
            .json(call)
            .send()
            .await
            .map_err(|e| from_reqwest("webhook", e))?;

        let status_code = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Ok(WebhookAccepted {
            status_code,
            accepted: status_code < 400,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_body_shape() {
        let call = WebhookCall {
            session_id: "s1".into(),
            tenant_id: "t1".into(),
            step: "approve".into(),
            attempt: 1,
            params: serde_json::json!({"amount": 12000}),
            callback_url: "https://runtime.example.com/api/workflow/s1/callback".into(),
            trace_id: None,
        };
        let wire = serde_json::to_value(&call).unwrap();
        assert_eq!(wire["session_id"], "s1");
        assert_eq!(wire["callback_url"].as_str().unwrap().contains("callback"), true);
        assert!(wire.get("trace_id").is_none());
    }
}
