use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The external LLM HTTP endpoint (OpenAI-compatible chat completions plus
/// an embeddings route and a search-enabled completion mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key. Unset = LLM disabled.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Central controller model.
    #[serde(default = "d_model")]
    pub model: String,
    /// Model used for search-enabled completions.
    #[serde(default = "d_search_model")]
    pub search_model: String,
    #[serde(default = "d_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "d_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            model: d_model(),
            search_model: d_search_model(),
            embedding_model: d_embedding_model(),
            timeout_secs: d_timeout(),
            max_retries: d_max_retries(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".into()
}
fn d_api_key_env() -> String {
    "DASHSCOPE_API_KEY".into()
}
fn d_model() -> String {
    "qwen3-max".into()
}
fn d_search_model() -> String {
    "qwen-max".into()
}
fn d_embedding_model() -> String {
    "text-embedding-v4".into()
}
fn d_timeout() -> u64 {
    60
}
fn d_max_retries() -> u32 {
    3
}
