//! The idempotency log.
//!
//! Claiming a `(session, step, attempt)` tuple is an INSERT against the
//! primary key: exactly one of two racing dispatchers succeeds, which is
//! where the at-most-once-effective guarantee bottoms out.

use chrono::Utc;
use sqlx::SqlitePool;

use tempo_domain::Result;

use crate::db_err;
use crate::records::IdempotencyRecord;

pub const IDEMPOTENCY_STARTED: &str = "started";
pub const IDEMPOTENCY_SUCCESS: &str = "success";
pub const IDEMPOTENCY_ERROR: &str = "error";

#[derive(Clone)]
pub struct IdempotencyRepo {
    pool: SqlitePool,
}

impl IdempotencyRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claim `(session, step, attempt)` by inserting a `started` row.
    ///
    /// Returns true if this caller won the claim; false if any row (started,
    /// success, or error) already exists.
    pub async fn try_claim(&self, session_id: &str, step: &str, attempt: u32) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO idempotency_log
                (session_id, step, attempt, status, created_at, updated_at)
            VALUES (?, ?, ?, 'started', ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(step)
        .bind(attempt as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Finalize a claimed tuple with its terminal status and result digest.
    pub async fn finalize(
        &self,
        session_id: &str,
        step: &str,
        attempt: u32,
        status: &str,
        result_digest: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_log
            SET status = ?, result_digest = ?, updated_at = ?
            WHERE session_id = ? AND step = ? AND attempt = ?
            "#,
        )
        .bind(status)
        .bind(result_digest)
        .bind(Utc::now())
        .bind(session_id)
        .bind(step)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(
        &self,
        session_id: &str,
        step: &str,
        attempt: u32,
    ) -> Result<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT session_id, step, attempt, status, result_digest, created_at, updated_at
            FROM idempotency_log
            WHERE session_id = ? AND step = ? AND attempt = ?
            "#,
        )
        .bind(session_id)
        .bind(step)
        .bind(attempt as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    /// Whether any attempt of this step already finished successfully.
    pub async fn any_success(&self, session_id: &str, step: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM idempotency_log
            WHERE session_id = ? AND step = ? AND status = 'success'
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Highest attempt recorded for a step (0 = never attempted).
    pub async fn max_attempt(&self, session_id: &str, step: &str) -> Result<u32> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT MAX(attempt) FROM idempotency_log
            WHERE session_id = ? AND step = ?
            "#,
        )
        .bind(session_id)
        .bind(step)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.and_then(|(max,)| max).unwrap_or(0) as u32)
    }
}
