//! Memory recall interface.
//!
//! The vector-search backend is an external collaborator; the gateway
//! only speaks to this trait. The in-process store backs dev mode and
//! tests with naive substring recall.

use aegis_domain::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub content: String,
    pub kind: String,
    pub stored_at: DateTime<Utc>,
}

/// The opaque recall interface the task router forwards memory
/// operations to.
#[async_trait::async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn search(&self, agent_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryHit>>;
    async fn store_fact(&self, agent_id: &str, fact: &str) -> Result<()>;
    async fn record_episode(&self, agent_id: &str, episode: serde_json::Value) -> Result<()>;
    async fn learn_procedure(&self, agent_id: &str, name: &str, steps: serde_json::Value)
        -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
struct Entry {
    agent_id: String,
    kind: String,
    content: String,
    stored_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryRecall {
    entries: RwLock<Vec<Entry>>,
}

impl InMemoryRecall {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, agent_id: &str, kind: &str, content: String) {
        self.entries.write().push(Entry {
            agent_id: agent_id.to_string(),
            kind: kind.to_string(),
            content,
            stored_at: Utc::now(),
        });
    }
}

#[async_trait::async_trait]
impl MemoryRecall for InMemoryRecall {
    async fn search(&self, agent_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let needle = query.to_lowercase();
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|e| e.agent_id == agent_id && e.content.to_lowercase().contains(&needle))
            .rev()
            .take(limit)
            .map(|e| MemoryHit {
                content: e.content.clone(),
                kind: e.kind.clone(),
                stored_at: e.stored_at,
            })
            .collect())
    }

    async fn store_fact(&self, agent_id: &str, fact: &str) -> Result<()> {
        self.push(agent_id, "fact", fact.to_string());
        Ok(())
    }

    async fn record_episode(&self, agent_id: &str, episode: serde_json::Value) -> Result<()> {
        self.push(agent_id, "episode", episode.to_string());
        Ok(())
    }

    async fn learn_procedure(
        &self,
        agent_id: &str,
        name: &str,
        steps: serde_json::Value,
    ) -> Result<()> {
        self.push(agent_id, "procedure", format!("{name}: {steps}"));
        Ok(())
    }
}
