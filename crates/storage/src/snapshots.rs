//! Cold-swap snapshots — where sessions go when they age out of the fast
//! store, and where rehydration reads from.

use chrono::Utc;
use sqlx::SqlitePool;

use tempo_domain::Result;

use crate::db_err;
use crate::records::SnapshotRecord;

#[derive(Clone)]
pub struct SnapshotRepo {
    pool: SqlitePool,
}

impl SnapshotRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        session_id: &str,
        tenant_id: &str,
        current_state: &str,
        status: &str,
        chat_history: &serde_json::Value,
        blackboard: &serde_json::Value,
        tool_results: &serde_json::Value,
        artifacts: &serde_json::Value,
        chat_summary: &str,
        routed_scene: &str,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO session_snapshots
                (session_id, tenant_id, current_state, status, chat_history,
                 blackboard, tool_results, artifacts, chat_summary,
                 routed_scene, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_id) DO UPDATE SET
                current_state = excluded.current_state,
                status = excluded.status,
                chat_history = excluded.chat_history,
                blackboard = excluded.blackboard,
                tool_results = excluded.tool_results,
                artifacts = excluded.artifacts,
                chat_summary = excluded.chat_summary,
                routed_scene = excluded.routed_scene,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(tenant_id)
        .bind(current_state)
        .bind(status)
        .bind(chat_history.to_string())
        .bind(blackboard.to_string())
        .bind(tool_results.to_string())
        .bind(artifacts.to_string())
        .bind(chat_summary)
        .bind(routed_scene)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SnapshotRecord>> {
        sqlx::query_as::<_, SnapshotRecord>(
            r#"
            SELECT session_id, tenant_id, current_state, status, chat_history,
                   blackboard, tool_results, artifacts, chat_summary,
                   routed_scene, created_at, updated_at
            FROM session_snapshots
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_snapshots WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn snapshot_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let repo = SnapshotRepo::new(db.pool().clone());

        repo.upsert(
            "s1",
            "t1",
            "compare",
            "paused",
            &serde_json::json!([{"role": "user", "content": "比价"}]),
            &serde_json::json!({"last_search_query": "钢管"}),
            &serde_json::json!({}),
            &serde_json::json!(["search_result"]),
            "",
            "procurement",
        )
        .await
        .unwrap();

        let snap = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(snap.current_state, "compare");
        assert_eq!(snap.routed_scene, "procurement");
        let blackboard: serde_json::Value = serde_json::from_str(&snap.blackboard).unwrap();
        assert_eq!(blackboard["last_search_query"], "钢管");
        let artifacts: Vec<String> = serde_json::from_str(&snap.artifacts).unwrap();
        assert_eq!(artifacts, vec!["search_result"]);

        repo.delete("s1").await.unwrap();
        assert!(repo.get("s1").await.unwrap().is_none());
    }
}
