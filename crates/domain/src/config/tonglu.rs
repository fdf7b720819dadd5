use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tonglu data service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The external file-parsing / semantic-query data service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TongluConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_timeout")]
    pub timeout_secs: u64,
    /// Deadline for waiting on a file-parse result before the chat turn
    /// degrades to a "file not parsed" notice.
    #[serde(default = "d_parse_timeout")]
    pub file_parse_timeout_secs: u64,
}

impl Default for TongluConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            timeout_secs: d_timeout(),
            file_parse_timeout_secs: d_parse_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "http://localhost:8100".into()
}
fn d_timeout() -> u64 {
    120
}
fn d_parse_timeout() -> u64 {
    60
}
