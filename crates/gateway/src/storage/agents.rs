//! Agent records: persisted so clients reconnecting (or another node)
//! see consistent state.

use aegis_domain::agent::AgentState;
use aegis_domain::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub state: AgentState,
    pub node_id: Option<String>,
    pub metadata: serde_json::Value,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait AgentStore: Send + Sync {
    async fn upsert(&self, record: AgentRecord) -> Result<()>;
    async fn set_state(&self, id: &str, state: AgentState) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<AgentRecord>>;
    async fn list(&self) -> Result<Vec<AgentRecord>>;
    async fn add_usage(&self, id: &str, input_tokens: i64, output_tokens: i64) -> Result<()>;
    /// Soft delete; the id stays reserved forever.
    async fn mark_deleted(&self, id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryAgentStore {
    records: RwLock<HashMap<String, AgentRecord>>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AgentStore for MemoryAgentStore {
    async fn upsert(&self, record: AgentRecord) -> Result<()> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_state(&self, id: &str, state: AgentState) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(id) {
            record.state = state;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<AgentRecord>> {
        let mut records: Vec<AgentRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn add_usage(&self, id: &str, input_tokens: i64, output_tokens: i64) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(id) {
            record.total_input_tokens += input_tokens;
            record.total_output_tokens += output_tokens;
        }
        Ok(())
    }

    async fn mark_deleted(&self, id: &str) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(id) {
            record.deleted_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Postgres store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PgAgentStore {
    pool: sqlx::PgPool,
}

impl PgAgentStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

type AgentRow = (
    String,
    String,
    String,
    Option<String>,
    serde_json::Value,
    i64,
    i64,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn row_to_record(row: AgentRow) -> Result<AgentRecord> {
    let state: AgentState = serde_json::from_value(serde_json::Value::String(row.2.clone()))
        .map_err(|_| Error::Storage(format!("unknown agent state '{}'", row.2)))?;
    Ok(AgentRecord {
        id: row.0,
        name: row.1,
        state,
        node_id: row.3,
        metadata: row.4,
        total_input_tokens: row.5,
        total_output_tokens: row.6,
        created_at: row.7,
        deleted_at: row.8,
    })
}

const SELECT_COLS: &str = "id, name, state, node_id, metadata, \
                           total_input_tokens, total_output_tokens, created_at, deleted_at";

#[async_trait::async_trait]
impl AgentStore for PgAgentStore {
    async fn upsert(&self, record: AgentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (id, name, state, node_id, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, state = EXCLUDED.state,
                 node_id = EXCLUDED.node_id, metadata = EXCLUDED.metadata",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(record.state.as_str())
        .bind(&record.node_id)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("upsert agent: {e}")))?;
        Ok(())
    }

    async fn set_state(&self, id: &str, state: AgentState) -> Result<()> {
        sqlx::query("UPDATE agents SET state = $2 WHERE id = $1")
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("set agent state: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        let row: Option<AgentRow> =
            sqlx::query_as(&format!("SELECT {SELECT_COLS} FROM agents WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::Storage(format!("get agent: {e}")))?;
        row.map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<AgentRecord>> {
        let rows: Vec<AgentRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLS} FROM agents WHERE deleted_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("list agents: {e}")))?;
        rows.into_iter().map(row_to_record).collect()
    }

    async fn add_usage(&self, id: &str, input_tokens: i64, output_tokens: i64) -> Result<()> {
        sqlx::query(
            "UPDATE agents
             SET total_input_tokens = total_input_tokens + $2,
                 total_output_tokens = total_output_tokens + $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(input_tokens)
        .bind(output_tokens)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("add usage: {e}")))?;
        Ok(())
    }

    async fn mark_deleted(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE agents SET deleted_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("mark deleted: {e}")))?;
        Ok(())
    }
}
