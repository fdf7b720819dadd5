//! Client for the Tonglu data service — file ingestion, async parse-task
//! polling, semantic/structured query, and record access.

use std::time::Duration;

use serde_json::{json, Value};

use tempo_domain::config::TongluConfig;
use tempo_domain::{Error, Result};

use crate::from_reqwest;

pub struct TongluClient {
    base_url: String,
    client: reqwest::Client,
    file_parse_timeout: Duration,
}

impl TongluClient {
    pub fn from_config(config: &TongluConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| from_reqwest("tonglu", e))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            client,
            file_parse_timeout: Duration::from_secs(config.file_parse_timeout_secs),
        })
    }

    // ── Query ───────────────────────────────────────────────────

    /// Semantic + structured query. `mode` is sql | vector | hybrid.
    pub async fn query(
        &self,
        intent: &str,
        filters: Option<&Value>,
        tenant_id: &str,
        mode: &str,
        limit: u32,
    ) -> Result<Vec<Value>> {
        let body = json!({
            "query": intent,
            "mode": mode,
            "filters": filters.cloned().unwrap_or_else(|| json!({})),
            "tenant_id": tenant_id,
            "limit": limit,
        });
        let parsed = self.post_json("/api/query", &body).await?;
        Ok(parsed["results"].as_array().cloned().unwrap_or_default())
    }

    // ── Ingest ──────────────────────────────────────────────────

    /// Ingest text/JSON data; returns the record id.
    pub async fn ingest(
        &self,
        data: &Value,
        tenant_id: &str,
        schema_type: Option<&str>,
        metadata: Option<&Value>,
    ) -> Result<String> {
        let body = json!({
            "data": data,
            "tenant_id": tenant_id,
            "schema_type": schema_type,
            "metadata": metadata,
        });
        let parsed = self.post_json("/api/ingest/text", &body).await?;
        parsed["record_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| upstream("ingest response missing record_id"))
    }

    /// Register an already-uploaded object-store file for parsing; returns a
    /// task id to poll.
    pub async fn ingest_url(
        &self,
        file_url: &str,
        file_name: &str,
        tenant_id: &str,
        schema_type: Option<&str>,
    ) -> Result<String> {
        let body = json!({
            "file_url": file_url,
            "file_name": file_name,
            "tenant_id": tenant_id,
            "schema_type": schema_type,
        });
        let parsed = self.post_json("/api/ingest/url", &body).await?;
        parsed["task_id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| upstream("ingest response missing task_id"))
    }

    // ── Records and tasks ───────────────────────────────────────

    pub async fn get_record(&self, record_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/records/{record_id}")).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Value> {
        self.get_json(&format!("/api/tasks/{task_id}")).await
    }

    /// Poll a parse task until it is ready, errored, or the file-parse
    /// deadline lapses.
    pub async fn wait_for_task(&self, task_id: &str) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + self.file_parse_timeout;
        let poll_interval = Duration::from_secs(2);

        loop {
            let task = self.get_task(task_id).await?;
            match task["status"].as_str() {
                Some("ready") => {
                    if let Some(record_id) = task["record_id"].as_str() {
                        return self.get_record(record_id).await;
                    }
                    return Ok(task);
                }
                Some("error") => {
                    return Err(upstream(&format!(
                        "file parse failed: {}",
                        task["error"].as_str().unwrap_or("unknown")
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(Error::Timeout(format!(
                    "file parse task {task_id} exceeded {}s",
                    self.file_parse_timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    // ── Internals ───────────────────────────────────────────────

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| from_reqwest("tonglu", e))?;
        parse_response(resp).await
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| from_reqwest("tonglu", e))?;
        parse_response(resp).await
    }
}

async fn parse_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(upstream(&format!("{status}: {message}")));
    }
    resp.json().await.map_err(|e| from_reqwest("tonglu", e))
}

fn upstream(message: &str) -> Error {
    Error::Upstream {
        service: "tonglu".into(),
        message: message.to_owned(),
    }
}
