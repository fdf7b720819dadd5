//! Row types for the durable tables.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub tenant_id: String,
    pub flow_id: Option<String>,
    pub current_state: String,
    /// Lifecycle status: idle, running, waiting_user, paused, completed,
    /// error, aborted.
    pub status: String,
    /// JSON-encoded parameter bag.
    pub params: String,
    pub ttl_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlowRecord {
    pub flow_id: String,
    pub name: String,
    pub description: String,
    pub yaml_content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRecord {
    /// Insertion order (autoincrement) — the replay ordering key.
    pub id: i64,
    pub event_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub event_type: String,
    pub source: String,
    pub target: String,
    pub tick: i64,
    pub trace_id: Option<String>,
    pub priority: i64,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    /// JSON-encoded payload.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub session_id: String,
    pub step: String,
    pub attempt: i64,
    /// started | success | error
    pub status: String,
    pub result_digest: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRecord {
    pub node_id: String,
    /// builtin | webhook
    pub node_type: String,
    pub name: String,
    pub description: String,
    pub endpoint: Option<String>,
    /// JSON-encoded parameter schema.
    pub param_schema: Option<String>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRecord {
    pub session_id: String,
    pub tenant_id: String,
    pub current_state: String,
    pub status: String,
    /// JSON-encoded chat history.
    pub chat_history: String,
    /// JSON-encoded blackboard fields.
    pub blackboard: String,
    /// JSON-encoded accumulated tool results.
    pub tool_results: String,
    /// JSON-encoded artifact-id list (the session's artifact set).
    pub artifacts: String,
    pub chat_summary: String,
    pub routed_scene: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
