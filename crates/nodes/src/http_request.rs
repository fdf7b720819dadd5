//! Generic outbound HTTP request node for flows that call simple APIs
//! without a registered webhook.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use tempo_domain::{NodeResult, Result};
use tempo_kernel::node::{Node, NodeContext};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_id(&self) -> &str {
        "http_request"
    }

    fn name(&self) -> &str {
        "HTTP 请求"
    }

    fn description(&self) -> &str {
        "向外部 API 发起 HTTP 请求并返回响应"
    }

    fn param_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "enum": ALLOWED_METHODS, "default": "GET" },
                "headers": { "type": "object" },
                "body": {},
            },
            "required": ["url"],
        })
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeResult> {
        let Some(url) = ctx.param_str("url").map(str::to_owned) else {
            return Ok(NodeResult::error("missing required param: url"));
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(NodeResult::error(format!("unsupported url scheme: {url}")));
        }
        let method = ctx.param_str("method").unwrap_or("GET").to_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Ok(NodeResult::error(format!("method not allowed: {method}")));
        }

        if ctx.aborted() {
            return Ok(NodeResult::aborted());
        }

        let mut request = match method.as_str() {
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.get(&url),
        };
        if let Some(headers) = ctx.params.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = ctx.params.get("body") {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(NodeResult::error(format!("request failed: {e}"))),
        };
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));

        let result = json!({ "status": status, "body": body });
        Ok(NodeResult::success(result.clone()).with_artifact("http_response", result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempo_kernel::{Blackboard, FastStore};

    fn ctx(params: Value) -> NodeContext {
        NodeContext {
            tenant_id: "t1".into(),
            session_id: "s1".into(),
            params,
            blackboard: Arc::new(Blackboard::with_defaults(Arc::new(FastStore::new()))),
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn rejects_missing_url_and_bad_method() {
        let node = HttpRequestNode::new();
        let result = node.execute(ctx(json!({}))).await.unwrap();
        assert_eq!(result.status.as_str(), "error");

        let result = node
            .execute(ctx(json!({ "url": "https://example.com", "method": "PATCH" })))
            .await
            .unwrap();
        assert_eq!(result.status.as_str(), "error");
        assert!(result.error_message.unwrap().contains("PATCH"));
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let node = HttpRequestNode::new();
        let result = node
            .execute(ctx(json!({ "url": "file:///etc/passwd" })))
            .await
            .unwrap();
        assert_eq!(result.status.as_str(), "error");
    }
}
