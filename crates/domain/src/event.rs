//! The canonical event envelope — every message on the bus and every row in
//! the audit log is one of these.
//!
//! Two invariants are enforced at construction time:
//!   - `kind` is UPPERCASE (silent misrouting from case typos is a real
//!     failure mode when types are plain strings)
//!   - `tenant_id` and `session_id` are never empty

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event type vocabulary
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// Commands (kernel → node)
pub const CMD_EXECUTE: &str = "CMD_EXECUTE";

// Results (node → kernel)
pub const EVENT_RESULT: &str = "EVENT_RESULT";
pub const EVENT_ERROR: &str = "EVENT_ERROR";
pub const EVENT_ABORTED: &str = "EVENT_ABORTED";
pub const EVENT_PENDING_FANIN: &str = "EVENT_PENDING_FANIN";

// State transitions
pub const STATE_TRANSITION: &str = "STATE_TRANSITION";
pub const STEP_DONE: &str = "STEP_DONE";
pub const NEED_USER_INPUT: &str = "NEED_USER_INPUT";

// User actions
pub const USER_CONFIRM: &str = "USER_CONFIRM";
pub const USER_SKIP: &str = "USER_SKIP";
pub const USER_MODIFY: &str = "USER_MODIFY";
pub const USER_ROLLBACK: &str = "USER_ROLLBACK";

// Session lifecycle
pub const SESSION_START: &str = "SESSION_START";
pub const SESSION_PAUSE: &str = "SESSION_PAUSE";
pub const SESSION_RESUME: &str = "SESSION_RESUME";
pub const SESSION_COMPLETE: &str = "SESSION_COMPLETE";
pub const RESET: &str = "RESET";

// File processing
pub const FILE_UPLOADED: &str = "FILE_UPLOADED";
pub const FILE_READY: &str = "FILE_READY";

// System
pub const ABORT: &str = "ABORT";
pub const ERROR: &str = "ERROR";
pub const PING: &str = "PING";

pub const DEFAULT_PRIORITY: u8 = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One event, as published on the bus and as appended to the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Globally unique event identifier (UUID v4).
    pub id: String,
    /// Event type constant — always UPPERCASE.
    #[serde(rename = "type")]
    pub kind: String,
    pub tenant_id: String,
    pub session_id: String,
    /// Component that emitted this event.
    pub source: String,
    /// Intended receiver (`*` = broadcast).
    #[serde(default = "broadcast_target")]
    pub target: String,
    /// Per-session monotonic counter.
    #[serde(default)]
    pub tick: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// 0 = lowest, 10 = highest.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

fn broadcast_target() -> String {
    "*".into()
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl EventEnvelope {
    /// Build a new event with a fresh id and timestamp.
    ///
    /// Returns `BadRequest` if the kind is not UPPERCASE or a mandatory
    /// identifier is empty.
    pub fn new(
        kind: impl Into<String>,
        source: impl Into<String>,
        tenant_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Result<Self> {
        let kind = kind.into();
        if kind.is_empty() || kind != kind.to_uppercase() {
            return Err(Error::BadRequest(format!(
                "event type must be UPPERCASE, got '{kind}'"
            )));
        }
        let tenant_id = tenant_id.into();
        let session_id = session_id.into();
        if tenant_id.is_empty() || session_id.is_empty() {
            return Err(Error::BadRequest(
                "event requires non-empty tenant_id and session_id".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            kind,
            tenant_id,
            session_id,
            source: source.into(),
            target: broadcast_target(),
            tick: 0,
            trace_id: None,
            priority: DEFAULT_PRIORITY,
            from_state: None,
            to_state: None,
            payload: Value::Object(Default::default()),
            created_at: Utc::now(),
        })
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_tick(mut self, tick: u64) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_trace(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_states(
        mut self,
        from_state: Option<String>,
        to_state: Option<String>,
    ) -> Self {
        self.from_state = from_state;
        self.to_state = to_state;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_lowercase_kind() {
        let err = EventEnvelope::new("step_done", "test", "t1", "s1").unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
    }

    #[test]
    fn rejects_empty_tenant() {
        assert!(EventEnvelope::new(STEP_DONE, "test", "", "s1").is_err());
        assert!(EventEnvelope::new(STEP_DONE, "test", "t1", "").is_err());
    }

    #[test]
    fn json_round_trip_preserves_fields() {
        let event = EventEnvelope::new(EVENT_RESULT, "dispatcher", "t1", "s1")
            .unwrap()
            .with_tick(7)
            .with_trace(Some("tr-1".into()))
            .with_states(Some("search".into()), Some("compare".into()))
            .with_payload(serde_json::json!({"status": "success"}));

        let parsed = EventEnvelope::from_json(&event.to_json()).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.kind, EVENT_RESULT);
        assert_eq!(parsed.tick, 7);
        assert_eq!(parsed.from_state.as_deref(), Some("search"));
    }

    #[test]
    fn serialized_type_field_is_named_type() {
        let event = EventEnvelope::new(ABORT, "stopper", "t1", "s1").unwrap();
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], ABORT);
        assert_eq!(value["target"], "*");
        assert_eq!(value["priority"], 5);
    }
}
