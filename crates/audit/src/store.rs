//! Durable audit storage backends.

use aegis_domain::{Error, Result};
use parking_lot::Mutex;

use crate::entry::AuditEntry;

/// A sink for flushed audit batches.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a batch atomically. A failed batch is retried in full by
    /// the flusher, so implementations must be all-or-nothing.
    async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store (dev mode, tests)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
    /// When set, the next `fail_next` batches error (test seam).
    fail_next: Mutex<u32>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Make the next `n` insert_batch calls fail (flush-retry tests).
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock() = n;
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        {
            let mut fail = self.fail_next.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(Error::Storage("simulated audit store outage".into()));
            }
        }
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Postgres store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PgAuditStore {
    pool: sqlx::PgPool,
}

impl PgAuditStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditStore for PgAuditStore {
    async fn insert_batch(&self, entries: &[AuditEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO audit_log \
             (action, resource_type, resource_id, actor_id, details, outcome, created_at) ",
        );
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(&entry.action)
                .push_bind(&entry.resource_type)
                .push_bind(&entry.resource_id)
                .push_bind(&entry.actor_id)
                .push_bind(&entry.details)
                .push_bind(entry.outcome.as_str())
                .push_bind(entry.created_at);
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("audit batch insert: {e}")))?;
        Ok(())
    }
}
