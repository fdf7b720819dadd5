//! The node execution contract.
//!
//! A node is the unit of executable work: builtin (in-process) or webhook
//! (out-of-process, results arrive through the callback endpoint). Both
//! produce a [`NodeResult`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Error,
    NeedUserInput,
    Aborted,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Success => "success",
            NodeStatus::Error => "error",
            NodeStatus::NeedUserInput => "need_user_input",
            NodeStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result returned by every node execution (builtin return value or webhook
/// callback body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_schema: Option<Value>,
    /// Artifact id → value; the dispatcher persists these into the blackboard
    /// under the same identifiers.
    #[serde(default)]
    pub artifacts: BTreeMap<String, Value>,
    /// Events the node wants fed into the FSM after its own trigger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NodeResult {
    pub fn success(result: Value) -> Self {
        Self {
            status: NodeStatus::Success,
            result,
            ui_schema: None,
            artifacts: BTreeMap::new(),
            next_events: Vec::new(),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Error,
            result: Value::Object(Default::default()),
            ui_schema: None,
            artifacts: BTreeMap::new(),
            next_events: Vec::new(),
            error_message: Some(message.into()),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: NodeStatus::Aborted,
            result: Value::Object(Default::default()),
            ui_schema: None,
            artifacts: BTreeMap::new(),
            next_events: Vec::new(),
            error_message: None,
        }
    }

    pub fn need_user_input(result: Value) -> Self {
        Self {
            status: NodeStatus::NeedUserInput,
            result,
            ui_schema: None,
            artifacts: BTreeMap::new(),
            next_events: Vec::new(),
            error_message: None,
        }
    }

    pub fn with_ui_schema(mut self, ui_schema: Value) -> Self {
        self.ui_schema = Some(ui_schema);
        self
    }

    pub fn with_artifact(mut self, id: impl Into<String>, value: Value) -> Self {
        self.artifacts.insert(id.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registration metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Builtin,
    Webhook,
}

/// Summary info for registry listings and the durable node-registry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: NodeKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_schema: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::NeedUserInput).unwrap(),
            r#""need_user_input""#
        );
        assert_eq!(NodeStatus::Aborted.as_str(), "aborted");
    }

    #[test]
    fn webhook_callback_body_parses_with_defaults() {
        // Minimal callback body: only status is mandatory.
        let result: NodeResult = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert!(result.is_success());
        assert!(result.artifacts.is_empty());
        assert!(result.ui_schema.is_none());
    }

    #[test]
    fn artifacts_round_trip() {
        let result = NodeResult::success(serde_json::json!({"rows": 3}))
            .with_artifact("search_result", serde_json::json!({"rows": 3}));
        let parsed: NodeResult =
            serde_json::from_str(&serde_json::to_string(&result).unwrap()).unwrap();
        assert!(parsed.artifacts.contains_key("search_result"));
    }
}
