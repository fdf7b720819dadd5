//! Client for the external LLM endpoint (OpenAI-compatible chat completions
//! with tool calling, a search-enabled completion mode, and embeddings).
//!
//! Transient failures are retried with jittered exponential backoff; the
//! per-call deadline comes from config (default 60 s).

use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};

use tempo_domain::config::LlmConfig;
use tempo_domain::llm::{ChatMessage, SearchSource, ToolCall, ToolDefinition, Usage};
use tempo_domain::{Error, Result};

use crate::from_reqwest;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One completed chat call: assistant text, any tool calls, token usage, and
/// search citations when the search mode was on.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub search_sources: Vec<SearchSource>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    search_model: String,
    embedding_model: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| from_reqwest("llm", e))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key(),
            model: config.model.clone(),
            search_model: config.search_model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn default_model(&self) -> &str {
        &self.model
    }

    // ── Chat ────────────────────────────────────────────────────

    /// One chat completion, optionally with tools the model may call.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        model: Option<&str>,
    ) -> Result<ChatCompletion> {
        let mut body = json!({
            "model": model.unwrap_or(&self.model),
            "messages": messages.iter().map(message_to_wire).collect::<Vec<Value>>(),
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
            }
        }
        self.call_with_retry("chat", &body).await
    }

    /// Search-enabled completion: the endpoint performs a live web search and
    /// returns the answer plus source citations.
    pub async fn search_completion(
        &self,
        messages: &[ChatMessage],
        search_strategy: &str,
    ) -> Result<ChatCompletion> {
        let body = json!({
            "model": self.search_model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<Value>>(),
            "enable_search": true,
            "search_options": {
                "search_strategy": search_strategy,
                "enable_source": true,
            },
        });
        self.call_with_retry("search", &body).await
    }

    // ── Embeddings ──────────────────────────────────────────────

    pub async fn embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self.require_key()?;
        let url = format!("{}/embeddings", self.base_url);
        let body = json!({ "model": self.embedding_model, "input": texts });

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            let result = async {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| from_reqwest("llm", e))?;
                check_status("llm", resp).await?.json::<Value>().await.map_err(|e| from_reqwest("llm", e))
            }
            .await;

            match result {
                Ok(parsed) => {
                    let vectors = parsed["data"]
                        .as_array()
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(|item| item["embedding"].as_array())
                                .map(|v| {
                                    v.iter()
                                        .filter_map(Value::as_f64)
                                        .map(|f| f as f32)
                                        .collect()
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    return Ok(vectors);
                }
                Err(e) if attempt < self.max_retries => {
                    self.backoff(attempt, &e).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Internal("llm retries exhausted".into())))
    }

    // ── Internals ───────────────────────────────────────────────

    fn require_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Upstream {
                service: "llm".into(),
                message: "api key not configured".into(),
            })
    }

    async fn call_with_retry(&self, label: &str, body: &Value) -> Result<ChatCompletion> {
        let api_key = self.require_key()?;
        let url = format!("{}/chat/completions", self.base_url);

        let mut last_error = None;
        for attempt in 1..=self.max_retries {
            let result = async {
                let resp = self
                    .client
                    .post(&url)
                    .bearer_auth(api_key)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| from_reqwest("llm", e))?;
                let parsed: Value = check_status("llm", resp)
                    .await?
                    .json()
                    .await
                    .map_err(|e| from_reqwest("llm", e))?;
                Ok::<ChatCompletion, Error>(parse_completion(&parsed))
            }
            .await;

            match result {
                Ok(completion) => return Ok(completion),
                Err(e) if e.retryable() && attempt < self.max_retries => {
                    tracing::warn!(
                        call = label,
                        attempt,
                        max = self.max_retries,
                        error = %e,
                        "llm call failed, retrying"
                    );
                    self.backoff(attempt, &e).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Internal("llm retries exhausted".into())))
    }

    /// Jittered exponential backoff (1s, 2s, 4s … ±20%).
    async fn backoff(&self, attempt: u32, _error: &Error) {
        let base = 2u64.saturating_pow(attempt - 1);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        tokio::time::sleep(Duration::from_secs_f64(base as f64 * jitter)).await;
    }
}

async fn check_status(service: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        return Err(Error::RateLimited(format!("{service}: {message}")));
    }
    Err(Error::Upstream {
        service: service.to_owned(),
        message: format!("{status}: {message}"),
    })
}

// ── Wire mapping ────────────────────────────────────────────────────

fn message_to_wire(msg: &ChatMessage) -> Value {
    let mut out = json!({ "role": msg.role, "content": msg.content });
    if !msg.tool_calls.is_empty() {
        out["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.call_id,
                        "type": "function",
                        "function": {
                            "name": tc.tool_name,
                            "arguments": tc.arguments.to_string(),
                        },
                    })
                })
                .collect(),
        );
    }
    if let Some(ref name) = msg.name {
        out["name"] = json!(name);
    }
    out
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

fn parse_completion(parsed: &Value) -> ChatCompletion {
    let message = &parsed["choices"][0]["message"];
    let content = message["content"].as_str().unwrap_or_default().to_owned();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    call_id: tc["id"]
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    tool_name: tc["function"]["name"].as_str().unwrap_or_default().to_owned(),
                    arguments: parse_arguments(&tc["function"]["arguments"]),
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = Usage {
        input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        total_tokens: parsed["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
    };

    let search_sources = parsed["search_info"]["search_results"]
        .as_array()
        .map(|sources| {
            sources
                .iter()
                .map(|s| SearchSource {
                    title: s["title"].as_str().unwrap_or_default().to_owned(),
                    url: s["url"].as_str().unwrap_or_default().to_owned(),
                    index: s["index"].clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    ChatCompletion {
        content,
        tool_calls,
        usage,
        search_sources,
    }
}

/// Tool-call arguments arrive as a JSON string; malformed or empty arguments
/// default to an empty object rather than failing the turn.
fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) if !s.trim().is_empty() => {
            serde_json::from_str(s).unwrap_or_else(|_| {
                tracing::warn!("tool call arguments are not valid JSON, defaulting to empty object");
                json!({})
            })
        }
        Value::Object(_) => raw.clone(),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_completion() {
        let parsed = json!({
            "choices": [{ "message": { "role": "assistant", "content": "你好" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 },
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.content, "你好");
        assert!(completion.tool_calls.is_empty());
        assert_eq!(completion.usage.total_tokens, 15);
    }

    #[test]
    fn parses_tool_calls_with_string_arguments() {
        let parsed = json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "search", "arguments": "{\"query\":\"钢管\"}" },
                }],
            }}],
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].tool_name, "search");
        assert_eq!(completion.tool_calls[0].arguments["query"], "钢管");
    }

    #[test]
    fn malformed_arguments_default_to_empty_object() {
        assert_eq!(parse_arguments(&json!("not json")), json!({}));
        assert_eq!(parse_arguments(&json!("")), json!({}));
        assert_eq!(parse_arguments(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn parses_search_sources() {
        let parsed = json!({
            "choices": [{ "message": { "content": "结果 [1]" } }],
            "search_info": { "search_results": [
                { "title": "供应商A", "url": "https://a.example.com", "index": 1 },
            ]},
        });
        let completion = parse_completion(&parsed);
        assert_eq!(completion.search_sources.len(), 1);
        assert_eq!(completion.search_sources[0].title, "供应商A");
    }

    #[test]
    fn wire_message_includes_tool_fields() {
        let msg = ChatMessage::assistant_tool_calls(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "writer".into(),
                arguments: json!({"skill": "quotation"}),
            }],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "writer");
        // Arguments are re-serialized to a string per the wire contract.
        assert!(wire["tool_calls"][0]["function"]["arguments"].is_string());
    }
}
