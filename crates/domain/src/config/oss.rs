use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OSS direct upload (POST policy)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Object-store signing settings. The secret never reaches the browser —
/// the server only issues short-lived POST policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OssConfig {
    /// e.g. `oss-cn-hangzhou.aliyuncs.com`
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "d_key_id_env")]
    pub access_key_id_env: String,
    #[serde(default = "d_key_secret_env")]
    pub access_key_secret_env: String,
    /// Base prefix for uploaded object keys.
    #[serde(default = "d_prefix")]
    pub upload_prefix: String,
    #[serde(default = "d_max_size")]
    pub max_upload_size: u64,
}

impl OssConfig {
    pub fn access_key_id(&self) -> Option<String> {
        std::env::var(&self.access_key_id_env).ok().filter(|v| !v.is_empty())
    }

    pub fn access_key_secret(&self) -> Option<String> {
        std::env::var(&self.access_key_secret_env).ok().filter(|v| !v.is_empty())
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
            && !self.bucket.is_empty()
            && self.access_key_id().is_some()
            && self.access_key_secret().is_some()
    }
}

impl Default for OssConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: String::new(),
            access_key_id_env: d_key_id_env(),
            access_key_secret_env: d_key_secret_env(),
            upload_prefix: d_prefix(),
            max_upload_size: d_max_size(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_key_id_env() -> String {
    "OSS_ACCESS_KEY_ID".into()
}
fn d_key_secret_env() -> String {
    "OSS_ACCESS_KEY_SECRET".into()
}
fn d_prefix() -> String {
    "tempoos".into()
}
fn d_max_size() -> u64 {
    200 * 1024 * 1024
}
