//! The blackboard — per-session, per-tenant shared state over the fast store.
//!
//! Nodes communicate through it instead of parameter passing: small values go
//! into the session hash, larger blobs become artifacts addressed by id, and
//! boolean signals (`abort`, …) ride on reserved `signal:` fields. Every
//! session write refreshes the session TTL to at least the configured default.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use tempo_domain::Result;

use crate::keys;
use crate::store::FastStore;
use std::sync::Arc;

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(1800);
pub const DEFAULT_ARTIFACT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct Blackboard {
    store: Arc<FastStore>,
    session_ttl: Duration,
    artifact_ttl: Duration,
}

impl Blackboard {
    pub fn new(store: Arc<FastStore>, session_ttl: Duration, artifact_ttl: Duration) -> Self {
        Self {
            store,
            session_ttl,
            artifact_ttl,
        }
    }

    pub fn with_defaults(store: Arc<FastStore>) -> Self {
        Self::new(store, DEFAULT_SESSION_TTL, DEFAULT_ARTIFACT_TTL)
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    // ── Session state ───────────────────────────────────────────

    /// Set one session field. The session TTL is extended to at least the
    /// configured default, never shortened.
    pub fn set_state(&self, tenant_id: &str, session_id: &str, field: &str, value: &Value) {
        let key = keys::session(tenant_id, session_id);
        let serialized = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.store.hash_set(&key, field, serialized);
        self.store.expire_at_least(&key, self.session_ttl);
    }

    pub fn get_state(&self, tenant_id: &str, session_id: &str, field: &str) -> Option<Value> {
        let raw = self
            .store
            .hash_get(&keys::session(tenant_id, session_id), field)?;
        Some(parse_loose(&raw))
    }

    pub fn get_all_state(&self, tenant_id: &str, session_id: &str) -> HashMap<String, Value> {
        self.store
            .hash_get_all(&keys::session(tenant_id, session_id))
            .into_iter()
            .map(|(k, v)| (k, parse_loose(&v)))
            .collect()
    }

    pub fn delete_state(&self, tenant_id: &str, session_id: &str, field: &str) {
        self.store
            .hash_del(&keys::session(tenant_id, session_id), field);
    }

    /// Whether any state exists for the session (TTL not yet lapsed).
    pub fn session_exists(&self, tenant_id: &str, session_id: &str) -> bool {
        self.store.exists(&keys::session(tenant_id, session_id))
    }

    // ── Accumulated results ─────────────────────────────────────

    /// Append a tool result to the per-(session, tool) list. Unlike
    /// `set_state` this preserves every call in a multi-tool turn.
    /// Returns the new list length.
    pub fn append_result(
        &self,
        tenant_id: &str,
        session_id: &str,
        tool: &str,
        value: &Value,
    ) -> usize {
        let key = keys::results(tenant_id, session_id, tool);
        let len = self.store.list_push(&key, value.to_string());
        self.store.expire_at_least(&key, self.session_ttl);
        len
    }

    pub fn get_results(
        &self,
        tenant_id: &str,
        session_id: &str,
        tool: &str,
        limit: usize,
    ) -> Vec<Value> {
        self.store
            .list_tail(&keys::results(tenant_id, session_id, tool), limit)
            .iter()
            .map(|raw| parse_loose(raw))
            .collect()
    }

    // ── Artifacts ───────────────────────────────────────────────

    /// Store an artifact and add its id to the session's artifact set.
    /// Artifact identifiers are unique within a session and the blob is
    /// keyed by `(tenant, session, artifact)` — the same id in a sibling
    /// session names a different blob. Contents are immutable once written;
    /// re-writing the same id is rejected by the idempotency discipline
    /// upstream, not here.
    pub fn write_artifact(
        &self,
        tenant_id: &str,
        session_id: &str,
        artifact_id: &str,
        value: &Value,
    ) -> Result<()> {
        self.store.set_text(
            &keys::artifact(tenant_id, session_id, artifact_id),
            value.to_string(),
            Some(self.artifact_ttl),
        );
        self.track_artifact(tenant_id, session_id, artifact_id);
        Ok(())
    }

    pub fn read_artifact(
        &self,
        tenant_id: &str,
        session_id: &str,
        artifact_id: &str,
    ) -> Option<Value> {
        let raw = self
            .store
            .get_text(&keys::artifact(tenant_id, session_id, artifact_id))?;
        serde_json::from_str(&raw).ok()
    }

    /// Re-add an id to the session's artifact set without touching the blob
    /// (snapshot rehydration).
    pub fn track_artifact(&self, tenant_id: &str, session_id: &str, artifact_id: &str) {
        let set_key = keys::session_artifacts(tenant_id, session_id);
        self.store.set_add(&set_key, artifact_id);
        self.store.expire_at_least(&set_key, self.session_ttl);
    }

    pub fn list_artifacts(&self, tenant_id: &str, session_id: &str) -> Vec<String> {
        self.store
            .set_members(&keys::session_artifacts(tenant_id, session_id))
    }

    // ── Signals ─────────────────────────────────────────────────

    pub fn set_signal(&self, tenant_id: &str, session_id: &str, name: &str, value: bool) {
        self.set_state(
            tenant_id,
            session_id,
            &format!("signal:{name}"),
            &Value::Bool(value),
        );
    }

    /// Read a signal flag; absent means false.
    pub fn get_signal(&self, tenant_id: &str, session_id: &str, name: &str) -> bool {
        self.get_state(tenant_id, session_id, &format!("signal:{name}"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    // ── Cleanup ─────────────────────────────────────────────────

    /// Delete all state for a session (hash, artifact set, result lists stay
    /// until their own TTLs; artifacts remain addressable for inheritance).
    pub fn clear_session(&self, tenant_id: &str, session_id: &str) {
        self.store.delete(&keys::session(tenant_id, session_id));
        self.store
            .delete(&keys::session_artifacts(tenant_id, session_id));
        self.store.delete(&keys::tick(tenant_id, session_id));
    }
}

/// Values are stored as their JSON encoding, except bare strings which are
/// stored raw; parse back accordingly.
fn parse_loose(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
