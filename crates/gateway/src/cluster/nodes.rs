//! The cluster node directory.

use std::collections::HashMap;

use aegis_domain::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub ws_url: String,
    pub last_seen_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn upsert(&self, node: ClusterNode) -> Result<()>;
    async fn get(&self, node_id: &str) -> Result<Option<ClusterNode>>;
    /// Nodes seen within `ttl_secs`.
    async fn list_alive(&self, ttl_secs: u64) -> Result<Vec<ClusterNode>>;
    /// Drop nodes silent for longer than `ttl_secs`. Returns how many.
    async fn prune(&self, ttl_secs: u64) -> Result<usize>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory directory (single node, tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryNodeDirectory {
    nodes: RwLock<HashMap<String, ClusterNode>>,
}

impl MemoryNodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cutoff(ttl_secs: u64) -> DateTime<Utc> {
    Utc::now() - Duration::seconds(ttl_secs as i64)
}

#[async_trait::async_trait]
impl NodeDirectory for MemoryNodeDirectory {
    async fn upsert(&self, node: ClusterNode) -> Result<()> {
        self.nodes.write().insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<ClusterNode>> {
        Ok(self.nodes.read().get(node_id).cloned())
    }

    async fn list_alive(&self, ttl_secs: u64) -> Result<Vec<ClusterNode>> {
        let cutoff = cutoff(ttl_secs);
        let mut alive: Vec<ClusterNode> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.last_seen_at >= cutoff)
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(alive)
    }

    async fn prune(&self, ttl_secs: u64) -> Result<usize> {
        let cutoff = cutoff(ttl_secs);
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|_, n| n.last_seen_at >= cutoff);
        Ok(before - nodes.len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Postgres directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PgNodeDirectory {
    pool: sqlx::PgPool,
}

impl PgNodeDirectory {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl NodeDirectory for PgNodeDirectory {
    async fn upsert(&self, node: ClusterNode) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateway_nodes (node_id, ws_url, last_seen_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (node_id) DO UPDATE
             SET ws_url = EXCLUDED.ws_url, last_seen_at = EXCLUDED.last_seen_at",
        )
        .bind(&node.node_id)
        .bind(&node.ws_url)
        .bind(node.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("upsert node: {e}")))?;
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<ClusterNode>> {
        let row: Option<(String, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT node_id, ws_url, last_seen_at FROM gateway_nodes WHERE node_id = $1")
                .bind(node_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::Storage(format!("get node: {e}")))?;
        Ok(row.map(|(node_id, ws_url, last_seen_at)| ClusterNode {
            node_id,
            ws_url,
            last_seen_at,
        }))
    }

    async fn list_alive(&self, ttl_secs: u64) -> Result<Vec<ClusterNode>> {
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT node_id, ws_url, last_seen_at FROM gateway_nodes
             WHERE last_seen_at >= $1 ORDER BY node_id",
        )
        .bind(cutoff(ttl_secs))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("list nodes: {e}")))?;
        Ok(rows
            .into_iter()
            .map(|(node_id, ws_url, last_seen_at)| ClusterNode {
                node_id,
                ws_url,
                last_seen_at,
            })
            .collect())
    }

    async fn prune(&self, ttl_secs: u64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM gateway_nodes WHERE last_seen_at < $1")
            .bind(cutoff(ttl_secs))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("prune nodes: {e}")))?;
        Ok(result.rows_affected() as usize)
    }
}
