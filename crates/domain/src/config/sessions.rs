use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Fast-store TTL for session state; refreshed on every write.
    #[serde(default = "d_ttl")]
    pub ttl_seconds: u64,
    /// Fast-store TTL for artifacts (longer-lived than session state).
    #[serde(default = "d_artifact_ttl")]
    pub artifact_ttl_seconds: u64,
    /// Tempo-clock interval for the TTL sweep that pauses aged-out sessions.
    #[serde(default = "d_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: d_ttl(),
            artifact_ttl_seconds: d_artifact_ttl(),
            sweep_interval_secs: d_sweep(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_ttl() -> u64 {
    1800
}
fn d_artifact_ttl() -> u64 {
    7 * 24 * 3600
}
fn d_sweep() -> u64 {
    30
}
