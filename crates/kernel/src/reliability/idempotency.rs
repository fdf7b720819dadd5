//! The idempotency guard — at-most-once-effective node execution.
//!
//! Before running a step the dispatcher claims `(session, step, attempt)`;
//! after running it records the terminal status and a result digest. The
//! claim is an exclusive insert in the idempotency log, so two dispatchers
//! racing on the same tuple can never both observe `Proceed`.

use sha2::{Digest, Sha256};

use tempo_domain::Result;
use tempo_storage::{IdempotencyRepo, IDEMPOTENCY_ERROR, IDEMPOTENCY_SUCCESS};

/// Decision returned by [`IdempotencyGuard::before_execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// This caller holds the claim; run the node.
    Proceed,
    /// Some attempt of this step already succeeded; do not run again.
    SkipCompleted,
    /// This exact tuple is claimed elsewhere (in flight or failed); do not run.
    SkipClaimed,
}

pub struct IdempotencyGuard {
    repo: IdempotencyRepo,
}

impl IdempotencyGuard {
    pub fn new(repo: IdempotencyRepo) -> Self {
        Self { repo }
    }

    /// Gate one execution attempt.
    pub async fn before_execute(
        &self,
        session_id: &str,
        step: &str,
        attempt: u32,
    ) -> Result<Gate> {
        if self.repo.any_success(session_id, step).await? {
            tracing::info!(
                session_id = %session_id,
                step = %step,
                "idempotency: step already succeeded, skipping"
            );
            return Ok(Gate::SkipCompleted);
        }
        if self.repo.try_claim(session_id, step, attempt).await? {
            Ok(Gate::Proceed)
        } else {
            tracing::info!(
                session_id = %session_id,
                step = %step,
                attempt,
                "idempotency: tuple already claimed, skipping"
            );
            Ok(Gate::SkipClaimed)
        }
    }

    /// Record the outcome of a claimed attempt.
    pub async fn after_execute(
        &self,
        session_id: &str,
        step: &str,
        attempt: u32,
        success: bool,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let digest = result.map(result_digest);
        let status = if success {
            IDEMPOTENCY_SUCCESS
        } else {
            IDEMPOTENCY_ERROR
        };
        self.repo
            .finalize(session_id, step, attempt, status, digest.as_deref())
            .await
    }

    /// Next attempt number for a retry, or `None` when the budget is spent.
    pub async fn next_attempt(
        &self,
        session_id: &str,
        step: &str,
        max_attempts: u32,
    ) -> Result<Option<u32>> {
        let max = self.repo.max_attempt(session_id, step).await?;
        if max >= max_attempts {
            Ok(None)
        } else {
            Ok(Some(max + 1))
        }
    }
}

/// Short digest of a node result, stored for replay comparison.
fn result_digest(result: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(result.to_string().as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_storage::Database;

    async fn guard() -> IdempotencyGuard {
        let db = Database::in_memory().await.unwrap();
        IdempotencyGuard::new(IdempotencyRepo::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn proceed_is_exclusive_per_tuple() {
        let guard = guard().await;
        assert_eq!(guard.before_execute("s1", "search", 1).await.unwrap(), Gate::Proceed);
        assert_eq!(
            guard.before_execute("s1", "search", 1).await.unwrap(),
            Gate::SkipClaimed
        );
    }

    #[tokio::test]
    async fn success_skips_all_later_attempts() {
        let guard = guard().await;
        guard.before_execute("s1", "search", 1).await.unwrap();
        guard
            .after_execute("s1", "search", 1, true, Some(&serde_json::json!({"rows": 3})))
            .await
            .unwrap();

        assert_eq!(
            guard.before_execute("s1", "search", 2).await.unwrap(),
            Gate::SkipCompleted
        );
        // Other steps are unaffected.
        assert_eq!(guard.before_execute("s1", "writer", 1).await.unwrap(), Gate::Proceed);
    }

    #[tokio::test]
    async fn failed_attempt_allows_next_attempt() {
        let guard = guard().await;
        guard.before_execute("s1", "search", 1).await.unwrap();
        guard.after_execute("s1", "search", 1, false, None).await.unwrap();

        assert_eq!(guard.next_attempt("s1", "search", 3).await.unwrap(), Some(2));
        assert_eq!(guard.before_execute("s1", "search", 2).await.unwrap(), Gate::Proceed);
    }

    #[tokio::test]
    async fn retry_budget_exhausts() {
        let guard = guard().await;
        for attempt in 1..=3 {
            guard.before_execute("s1", "search", attempt).await.unwrap();
            guard.after_execute("s1", "search", attempt, false, None).await.unwrap();
        }
        assert_eq!(guard.next_attempt("s1", "search", 3).await.unwrap(), None);
    }

    #[test]
    fn digest_is_stable_and_short() {
        let a = result_digest(&serde_json::json!({"rows": 3}));
        let b = result_digest(&serde_json::json!({"rows": 3}));
        let c = result_digest(&serde_json::json!({"rows": 4}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
