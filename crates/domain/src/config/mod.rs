mod llm;
mod oss;
mod server;
mod sessions;
mod storage;
mod tonglu;
mod workflow;

pub use llm::*;
pub use oss::*;
pub use server::*;
pub use sessions::*;
pub use storage::*;
pub use tonglu::*;
pub use workflow::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tonglu: TongluConfig,
    #[serde(default)]
    pub oss: OssConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load from a TOML file; fall back to defaults if the file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "config parse failed, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
        }
    }

    /// Collect validation issues. Errors prevent startup; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port must be non-zero"));
        }
        if self.sessions.ttl_seconds == 0 {
            issues.push(ConfigIssue::error("sessions.ttl_seconds must be non-zero"));
        }
        if self.workflow.max_tool_loops == 0 {
            issues.push(ConfigIssue::error("workflow.max_tool_loops must be non-zero"));
        }
        if self.llm.api_key().is_none() {
            issues.push(ConfigIssue::warning(format!(
                "LLM api key env '{}' is unset — LLM-backed endpoints will refuse requests",
                self.llm.api_key_env
            )));
        }
        if !self.oss.is_configured() {
            issues.push(ConfigIssue::warning(
                "OSS signing is not configured — /api/oss/post-signature will return 501",
            ));
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_errors() {
        let issues = Config::default().validate();
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("port")));
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [sessions]
            ttl_seconds = 600
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.sessions.ttl_seconds, 600);
        // Untouched sections keep defaults.
        assert_eq!(config.workflow.max_tool_loops, 6);
    }
}
