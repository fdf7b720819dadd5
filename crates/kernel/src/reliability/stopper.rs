//! The hard-stopper — emergency session termination.
//!
//! Sets the abort marker in the fast store, flips the blackboard abort
//! signal that builtin nodes poll, appends an ABORT record to the audit log,
//! and publishes the same event on the bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tempo_domain::event::ABORT;
use tempo_domain::{EventEnvelope, Result};
use tempo_storage::{EventRepo, SessionRepo};

use crate::blackboard::Blackboard;
use crate::bus::EventBus;
use crate::keys;
use crate::store::FastStore;

const ABORT_MARKER_TTL: Duration = Duration::from_secs(3600);

pub struct HardStopper {
    store: Arc<FastStore>,
    bus: Arc<EventBus>,
    blackboard: Arc<Blackboard>,
    events: EventRepo,
    sessions: SessionRepo,
}

impl HardStopper {
    pub fn new(
        store: Arc<FastStore>,
        bus: Arc<EventBus>,
        blackboard: Arc<Blackboard>,
        events: EventRepo,
        sessions: SessionRepo,
    ) -> Self {
        Self {
            store,
            bus,
            blackboard,
            events,
            sessions,
        }
    }

    /// Terminate a session:
    /// 1. fast-store abort marker (cheap dispatcher poll)
    /// 2. blackboard `signal:abort` (cheap builtin-node poll)
    /// 3. session status → aborted
    /// 4. ABORT appended to the audit log and published on the bus
    pub async fn abort(
        &self,
        tenant_id: &str,
        session_id: &str,
        reason: &str,
        trace_id: Option<String>,
    ) -> Result<()> {
        self.store.set_text(
            &keys::abort(tenant_id, session_id),
            reason,
            Some(ABORT_MARKER_TTL),
        );
        self.blackboard.set_signal(tenant_id, session_id, "abort", true);
        self.blackboard.set_state(
            tenant_id,
            session_id,
            "_status",
            &json!("aborted"),
        );
        self.sessions.mark_completed(session_id, "aborted").await?;

        let event = EventEnvelope::new(ABORT, "hard_stopper", tenant_id, session_id)?
            .with_trace(trace_id)
            .with_payload(json!({ "reason": reason }));
        self.events.append(&event).await?;
        self.bus.publish(&event);

        tracing::warn!(session_id = %session_id, reason = %reason, "session aborted");
        Ok(())
    }

    /// Fast-path abort check (store marker only).
    pub fn is_aborted(&self, tenant_id: &str, session_id: &str) -> bool {
        self.store.exists(&keys::abort(tenant_id, session_id))
    }

    pub fn abort_reason(&self, tenant_id: &str, session_id: &str) -> Option<String> {
        self.store.get_text(&keys::abort(tenant_id, session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_storage::Database;

    async fn stopper() -> (HardStopper, Arc<Blackboard>, Arc<EventBus>, EventRepo) {
        let store = Arc::new(FastStore::new());
        let bus = Arc::new(EventBus::new());
        let blackboard = Arc::new(Blackboard::with_defaults(store.clone()));
        let db = Database::in_memory().await.unwrap();
        let events = EventRepo::new(db.pool().clone());
        let sessions = SessionRepo::new(db.pool().clone());
        (
            HardStopper::new(store, bus.clone(), blackboard.clone(), events.clone(), sessions),
            blackboard,
            bus,
            events,
        )
    }

    #[tokio::test]
    async fn abort_sets_marker_signal_and_audit() {
        let (stopper, blackboard, bus, events) = stopper().await;
        let mut sub = bus.subscribe("t1");

        assert!(!stopper.is_aborted("t1", "s1"));
        stopper
            .abort("t1", "s1", "user requested termination", Some("tr-1".into()))
            .await
            .unwrap();

        assert!(stopper.is_aborted("t1", "s1"));
        assert_eq!(
            stopper.abort_reason("t1", "s1").as_deref(),
            Some("user requested termination")
        );
        assert!(blackboard.get_signal("t1", "s1", "abort"));

        let published = sub.recv().await.unwrap();
        assert_eq!(published.kind, ABORT);
        assert_eq!(published.trace_id.as_deref(), Some("tr-1"));

        let replayed = events.replay("s1").await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_type, ABORT);
    }

    #[tokio::test]
    async fn abort_is_session_scoped() {
        let (stopper, _, _, _) = stopper().await;
        stopper.abort("t1", "s1", "stop", None).await.unwrap();
        assert!(!stopper.is_aborted("t1", "s2"));
        assert!(!stopper.is_aborted("t2", "s1"));
    }
}
