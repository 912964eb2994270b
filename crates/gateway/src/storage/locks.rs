//! Cluster-wide per-job locking via Postgres advisory locks.
//!
//! Each guard owns a dedicated connection for the lock's lifetime;
//! advisory locks are session-scoped, so releasing the connection back
//! to the pool without unlocking would leak the lock.

use crate::scheduler::JobLock;
use crate::storage::advisory_keys;

pub struct PgJobLock {
    pool: sqlx::PgPool,
}

impl PgJobLock {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

struct PgGuard {
    conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>>,
    keys: (i32, i32),
}

impl Drop for PgGuard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let keys = self.keys;
            tokio::spawn(async move {
                let _ = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                    .bind(keys.0)
                    .bind(keys.1)
                    .execute(&mut *conn)
                    .await;
            });
        }
    }
}

#[async_trait::async_trait]
impl JobLock for PgJobLock {
    async fn try_acquire(&self, job_id: &str) -> Option<Box<dyn Send>> {
        let keys = advisory_keys(&format!("aegis-job:{job_id}"));
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "job lock connection unavailable");
                return None;
            }
        };

        let acquired: (bool,) = match sqlx::query_as("SELECT pg_try_advisory_lock($1, $2)")
            .bind(keys.0)
            .bind(keys.1)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "job lock query failed");
                return None;
            }
        };

        if !acquired.0 {
            return None;
        }
        Some(Box::new(PgGuard {
            conn: Some(conn),
            keys,
        }))
    }
}
