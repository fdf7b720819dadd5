//! Durable node registry — the convergence point for peer instances.

use chrono::Utc;
use sqlx::SqlitePool;

use tempo_domain::node::{NodeInfo, NodeKind};
use tempo_domain::Result;

use crate::db_err;
use crate::records::NodeRecord;

#[derive(Clone)]
pub struct NodeRepo {
    pool: SqlitePool,
}

impl NodeRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, info: &NodeInfo) -> Result<()> {
        let node_type = match info.node_type {
            NodeKind::Builtin => "builtin",
            NodeKind::Webhook => "webhook",
        };
        sqlx::query(
            r#"
            INSERT INTO registry_nodes
                (node_id, node_type, name, description, endpoint, param_schema, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'active', ?)
            ON CONFLICT (node_id) DO UPDATE SET
                node_type = excluded.node_type,
                name = excluded.name,
                description = excluded.description,
                endpoint = excluded.endpoint,
                param_schema = excluded.param_schema,
                status = 'active',
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&info.node_id)
        .bind(node_type)
        .bind(&info.name)
        .bind(&info.description)
        .bind(&info.endpoint)
        .bind(info.param_schema.as_ref().map(|s| s.to_string()))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT node_id, node_type, name, description, endpoint, param_schema, status, updated_at
            FROM registry_nodes
            WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    pub async fn list(&self, node_type: Option<&str>) -> Result<Vec<NodeRecord>> {
        match node_type {
            Some(node_type) => sqlx::query_as::<_, NodeRecord>(
                r#"
                SELECT node_id, node_type, name, description, endpoint, param_schema, status, updated_at
                FROM registry_nodes
                WHERE node_type = ?
                ORDER BY node_id
                "#,
            )
            .bind(node_type)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err),
            None => sqlx::query_as::<_, NodeRecord>(
                r#"
                SELECT node_id, node_type, name, description, endpoint, param_schema, status, updated_at
                FROM registry_nodes
                ORDER BY node_id
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(db_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn upsert_and_filter() {
        let db = Database::in_memory().await.unwrap();
        let repo = NodeRepo::new(db.pool().clone());

        repo.upsert(&NodeInfo {
            node_id: "search".into(),
            node_type: NodeKind::Builtin,
            name: "联网搜索".into(),
            description: String::new(),
            endpoint: None,
            param_schema: None,
        })
        .await
        .unwrap();
        repo.upsert(&NodeInfo {
            node_id: "erp".into(),
            node_type: NodeKind::Webhook,
            name: "ERP".into(),
            description: String::new(),
            endpoint: Some("https://erp.example.com/hook".into()),
            param_schema: Some(serde_json::json!({"type": "object"})),
        })
        .await
        .unwrap();

        assert_eq!(repo.list(None).await.unwrap().len(), 2);
        let webhooks = repo.list(Some("webhook")).await.unwrap();
        assert_eq!(webhooks.len(), 1);
        assert_eq!(webhooks[0].node_id, "erp");
        assert!(webhooks[0].param_schema.is_some());

        // Upsert replaces the endpoint.
        repo.upsert(&NodeInfo {
            node_id: "erp".into(),
            node_type: NodeKind::Webhook,
            name: "ERP".into(),
            description: String::new(),
            endpoint: Some("https://erp2.example.com/hook".into()),
            param_schema: None,
        })
        .await
        .unwrap();
        let record = repo.get("erp").await.unwrap().unwrap();
        assert_eq!(record.endpoint.as_deref(), Some("https://erp2.example.com/hook"));
    }
}
