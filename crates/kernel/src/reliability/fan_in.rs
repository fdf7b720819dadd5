//! The fan-in checker — gates convergence steps behind the completion of
//! every parallel branch, decided by event-log lookups rather than any
//! structural analysis of the flow graph.

use tempo_domain::Result;
use tempo_storage::EventRepo;

pub struct FanInChecker {
    events: EventRepo,
}

impl FanInChecker {
    pub fn new(events: EventRepo) -> Self {
        Self { events }
    }

    /// True when every prerequisite step has a STEP_DONE as its most recent
    /// recorded event for this session. Completion order does not matter.
    pub async fn ready(&self, session_id: &str, prerequisites: &[String]) -> Result<bool> {
        Ok(self.pending(session_id, prerequisites).await?.is_empty())
    }

    /// The prerequisite steps not yet satisfied.
    pub async fn pending(
        &self,
        session_id: &str,
        prerequisites: &[String],
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for step in prerequisites {
            if !self.events.step_done(session_id, step).await? {
                missing.push(step.clone());
            }
        }
        if !missing.is_empty() {
            tracing::debug!(
                session_id = %session_id,
                missing = ?missing,
                "fan-in not ready"
            );
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_domain::event::STEP_DONE;
    use tempo_domain::EventEnvelope;
    use tempo_storage::Database;

    async fn fixture() -> (FanInChecker, EventRepo) {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepo::new(db.pool().clone());
        (FanInChecker::new(repo.clone()), repo)
    }

    async fn mark_done(repo: &EventRepo, session: &str, step: &str) {
        let mut event = EventEnvelope::new(STEP_DONE, "dispatcher", "t1", session).unwrap();
        event.from_state = Some(step.to_owned());
        repo.append(&event).await.unwrap();
    }

    #[tokio::test]
    async fn ready_only_when_all_branches_done() {
        let (checker, repo) = fixture().await;
        let prereqs = vec!["search_a".to_string(), "search_b".to_string()];

        assert!(!checker.ready("s1", &prereqs).await.unwrap());

        mark_done(&repo, "s1", "search_b").await;
        assert_eq!(checker.pending("s1", &prereqs).await.unwrap(), vec!["search_a"]);

        // Completion order does not matter.
        mark_done(&repo, "s1", "search_a").await;
        assert!(checker.ready("s1", &prereqs).await.unwrap());
    }

    #[tokio::test]
    async fn empty_prerequisites_are_trivially_ready() {
        let (checker, _repo) = fixture().await;
        assert!(checker.ready("s1", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn other_sessions_do_not_count() {
        let (checker, repo) = fixture().await;
        mark_done(&repo, "other", "search_a").await;
        assert!(!checker
            .ready("s1", &["search_a".to_string()])
            .await
            .unwrap());
    }
}
