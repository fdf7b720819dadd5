use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Durable storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. `sqlite::memory:` is accepted for tests.
    #[serde(default = "d_database")]
    pub database_path: String,
    #[serde(default = "d_max_connections")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: d_database(),
            max_connections: d_max_connections(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_database() -> String {
    ".data/tempo.db".into()
}
fn d_max_connections() -> u32 {
    5
}
