//! Session repository — the durable record behind the fast store.

use chrono::Utc;
use sqlx::SqlitePool;

use tempo_domain::Result;

use crate::db_err;
use crate::records::SessionRecord;

#[derive(Clone)]
pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(
        &self,
        session_id: &str,
        tenant_id: &str,
        flow_id: Option<&str>,
        params: &serde_json::Value,
        ttl_seconds: u64,
        initial_state: &str,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workflow_sessions
                (session_id, tenant_id, flow_id, current_state, status, params,
                 ttl_seconds, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'running', ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(tenant_id)
        .bind(flow_id)
        .bind(initial_state)
        .bind(params.to_string())
        .bind(ttl_seconds as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, tenant_id, flow_id, current_state, status, params,
                   ttl_seconds, created_at, updated_at, completed_at
            FROM workflow_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn update_state(
        &self,
        session_id: &str,
        current_state: &str,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_sessions
            SET current_state = ?, status = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(current_state)
        .bind(status)
        .bind(Utc::now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn mark_completed(&self, session_id: &str, status: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE workflow_sessions
            SET status = ?, completed_at = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(status)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Sessions still live in the fast store (candidates for the TTL sweep).
    pub async fn list_active(&self) -> Result<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, tenant_id, flow_id, current_state, status, params,
                   ttl_seconds, created_at, updated_at, completed_at
            FROM workflow_sessions
            WHERE status IN ('idle', 'running', 'waiting_user')
            ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list_by_tenant(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, tenant_id, flow_id, current_state, status, params,
                   ttl_seconds, created_at, updated_at, completed_at
            FROM workflow_sessions
            WHERE tenant_id = ?
            ORDER BY created_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
