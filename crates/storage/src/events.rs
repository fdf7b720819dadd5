//! The append-only event audit log.
//!
//! Insertion order (the autoincrement `id`) is the replay ordering key;
//! within a session it matches publish order on the bus because the
//! dispatcher serializes the two writes.

use sqlx::SqlitePool;

use tempo_domain::event::STEP_DONE;
use tempo_domain::{EventEnvelope, Result};

use crate::db_err;
use crate::records::EventRecord;

#[derive(Clone)]
pub struct EventRepo {
    pool: SqlitePool,
}

impl EventRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event. Events are immutable once written.
    pub async fn append(&self, event: &EventEnvelope) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_events
                (event_id, tenant_id, session_id, event_type, source, target,
                 tick, trace_id, priority, from_state, to_state, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.tenant_id)
        .bind(&event.session_id)
        .bind(&event.kind)
        .bind(&event.source)
        .bind(&event.target)
        .bind(event.tick as i64)
        .bind(&event.trace_id)
        .bind(event.priority as i64)
        .bind(&event.from_state)
        .bind(&event.to_state)
        .bind(event.payload.to_string())
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// All events for a session in insertion order (replay).
    pub async fn replay(&self, session_id: &str) -> Result<Vec<EventRecord>> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, event_id, tenant_id, session_id, event_type, source, target,
                   tick, trace_id, priority, from_state, to_state, payload, created_at
            FROM workflow_events
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Most recent events first, for list endpoints.
    pub async fn list_by_session(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, event_id, tenant_id, session_id, event_type, source, target,
                   tick, trace_id, priority, from_state, to_state, payload, created_at
            FROM workflow_events
            WHERE session_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Fan-in readiness for one prerequisite step: the last event recorded
    /// with `from_state = step` must be a STEP_DONE.
    pub async fn step_done(&self, session_id: &str, step: &str) -> Result<bool> {
        let last: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT event_type
            FROM workflow_events
            WHERE session_id = ? AND from_state = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(last.map(|(kind,)| kind == STEP_DONE).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use tempo_domain::event::{EVENT_RESULT, STATE_TRANSITION};

    fn event(kind: &str, session: &str, tick: u64) -> EventEnvelope {
        EventEnvelope::new(kind, "test", "t1", session)
            .unwrap()
            .with_tick(tick)
    }

    #[tokio::test]
    async fn replay_preserves_insertion_order() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepo::new(db.pool().clone());

        repo.append(&event(STATE_TRANSITION, "s1", 1)).await.unwrap();
        repo.append(&event(EVENT_RESULT, "s1", 2)).await.unwrap();
        repo.append(&event(STEP_DONE, "s1", 3)).await.unwrap();
        repo.append(&event(EVENT_RESULT, "s2", 1)).await.unwrap();

        let replayed = repo.replay("s1").await.unwrap();
        assert_eq!(replayed.len(), 3);
        assert!(replayed.windows(2).all(|w| w[0].id < w[1].id));
        assert!(replayed.windows(2).all(|w| w[0].tick <= w[1].tick));
        assert_eq!(replayed[0].event_type, STATE_TRANSITION);
        assert_eq!(replayed[2].event_type, STEP_DONE);
    }

    #[tokio::test]
    async fn step_done_checks_last_event_for_step() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepo::new(db.pool().clone());

        // No events yet.
        assert!(!repo.step_done("s1", "search").await.unwrap());

        let mut done = event(STEP_DONE, "s1", 1);
        done.from_state = Some("search".into());
        repo.append(&done).await.unwrap();
        assert!(repo.step_done("s1", "search").await.unwrap());

        // A later error on the same step withdraws readiness.
        let mut err = event("EVENT_ERROR", "s1", 2);
        err.from_state = Some("search".into());
        repo.append(&err).await.unwrap();
        assert!(!repo.step_done("s1", "search").await.unwrap());
    }

    #[tokio::test]
    async fn list_by_session_is_most_recent_first() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepo::new(db.pool().clone());
        for tick in 1..=5 {
            repo.append(&event(EVENT_RESULT, "s1", tick)).await.unwrap();
        }
        let listed = repo.list_by_session("s1", 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].tick, 5);
    }
}
