//! Flow definition repository.

use chrono::Utc;
use sqlx::SqlitePool;

use tempo_domain::Result;

use crate::db_err;
use crate::records::FlowRecord;

#[derive(Clone)]
pub struct FlowRepo {
    pool: SqlitePool,
}

impl FlowRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        flow_id: &str,
        name: &str,
        description: &str,
        yaml_content: &str,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO workflow_flows (flow_id, name, description, yaml_content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (flow_id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                yaml_content = excluded.yaml_content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(flow_id)
        .bind(name)
        .bind(description)
        .bind(yaml_content)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, flow_id: &str) -> Result<Option<FlowRecord>> {
        sqlx::query_as::<_, FlowRecord>(
            r#"
            SELECT flow_id, name, description, yaml_content, created_at, updated_at
            FROM workflow_flows
            WHERE flow_id = ?
            "#,
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list(&self) -> Result<Vec<FlowRecord>> {
        sqlx::query_as::<_, FlowRecord>(
            r#"
            SELECT flow_id, name, description, yaml_content, created_at, updated_at
            FROM workflow_flows
            ORDER BY flow_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn upsert_replaces() {
        let db = Database::in_memory().await.unwrap();
        let repo = FlowRepo::new(db.pool().clone());

        repo.upsert("procurement", "Procurement", "", "states: [a, b]").await.unwrap();
        repo.upsert("procurement", "Procurement v2", "chain", "states: [a, b, c]")
            .await
            .unwrap();

        let record = repo.get("procurement").await.unwrap().unwrap();
        assert_eq!(record.name, "Procurement v2");
        assert!(record.yaml_content.contains("c]"));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
