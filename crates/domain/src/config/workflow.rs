use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Directory of YAML flow definitions loaded at startup.
    #[serde(default = "d_flows_dir")]
    pub flows_dir: String,
    /// FSM advance retries before the dispatcher reports a conflict.
    #[serde(default = "d_fsm_retries")]
    pub fsm_advance_retries: u32,
    /// Tool iterations per chat turn before the controller gives up.
    #[serde(default = "d_tool_loops")]
    pub max_tool_loops: u32,
    /// Deadline for one webhook dispatch call.
    #[serde(default = "d_webhook_timeout")]
    pub webhook_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            flows_dir: d_flows_dir(),
            fsm_advance_retries: d_fsm_retries(),
            max_tool_loops: d_tool_loops(),
            webhook_timeout_secs: d_webhook_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Per-node retry parameters (exponential backoff).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "d_backoff_base")]
    pub backoff_base_secs: f64,
    #[serde(default = "d_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "d_max_backoff")]
    pub max_backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: d_max_attempts(),
            backoff_base_secs: d_backoff_base(),
            backoff_multiplier: d_backoff_multiplier(),
            max_backoff_secs: d_max_backoff(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_flows_dir() -> String {
    "flows".into()
}
fn d_fsm_retries() -> u32 {
    3
}
fn d_tool_loops() -> u32 {
    6
}
fn d_webhook_timeout() -> u64 {
    30
}
fn d_max_attempts() -> u32 {
    3
}
fn d_backoff_base() -> f64 {
    1.0
}
fn d_backoff_multiplier() -> f64 {
    2.0
}
fn d_max_backoff() -> f64 {
    60.0
}
