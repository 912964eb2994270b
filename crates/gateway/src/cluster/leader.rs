//! Advisory-lock leader election.
//!
//! One reserved connection holds `pg_try_advisory_lock(k1, k2)` for the
//! lifetime of leadership. Every check interval the leader pings its
//! connection; a failed ping demotes immediately (Postgres releases the
//! lock with the dead session). Followers retry the acquire on the same
//! cadence.

use std::sync::Arc;
use std::time::Duration;

use aegis_domain::{Error, Result};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::storage::advisory_keys;

pub struct LeaderElection {
    pool: sqlx::PgPool,
    keys: (i32, i32),
    check_interval: Duration,
    /// Reserved while leader; never returned to the pool mid-term.
    conn: Mutex<Option<sqlx::pool::PoolConnection<sqlx::Postgres>>>,
    leader_tx: watch::Sender<bool>,
}

impl LeaderElection {
    pub fn new(pool: sqlx::PgPool, lock_name: &str, check_interval_ms: u64) -> Arc<Self> {
        let (leader_tx, _) = watch::channel(false);
        Arc::new(Self {
            pool,
            keys: advisory_keys(lock_name),
            check_interval: Duration::from_millis(check_interval_ms),
            conn: Mutex::new(None),
            leader_tx,
        })
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Leadership transitions in issue order.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    pub fn spawn_loop(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let election = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(election.check_interval) => {}
                }
                election.tick().await;
            }
            election.resign().await;
        })
    }

    /// One election pass: leaders verify their session, followers try to
    /// acquire.
    pub async fn tick(&self) {
        if self.is_leader() {
            if let Err(e) = self.ping().await {
                tracing::warn!(error = %e, "leader connection lost, stepping down");
                self.demote().await;
            }
        } else if let Err(e) = self.try_acquire().await {
            tracing::debug!(error = %e, "leader acquire attempt failed");
        }
    }

    async fn try_acquire(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| Error::Cluster(format!("reserving election connection: {e}")))?;
            *guard = Some(conn);
        }
        let conn = guard.as_mut().ok_or_else(|| Error::Cluster("no connection".into()))?;

        let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1, $2)")
            .bind(self.keys.0)
            .bind(self.keys.1)
            .fetch_one(&mut **conn)
            .await
            .map_err(|e| Error::Cluster(format!("advisory lock: {e}")))?;

        if acquired.0 {
            tracing::info!("acquired leader lock");
            self.leader_tx.send_replace(true);
        } else {
            // Keep the connection released while following; the pool
            // shouldn't carry an idle reserved session.
            *guard = None;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| Error::Cluster("leader has no reserved connection".into()))?;
        sqlx::query("SELECT 1")
            .execute(&mut **conn)
            .await
            .map_err(|e| Error::Cluster(format!("leader ping: {e}")))?;
        Ok(())
    }

    async fn demote(&self) {
        // Dropping the connection closes the session; Postgres releases
        // the advisory lock with it.
        *self.conn.lock().await = None;
        self.leader_tx.send_replace(false);
    }

    /// Explicit release (graceful shutdown).
    pub async fn resign(&self) {
        if !self.is_leader() {
            return;
        }
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            let _ = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(self.keys.0)
                .bind(self.keys.1)
                .execute(&mut **conn)
                .await;
        }
        *guard = None;
        self.leader_tx.send_replace(false);
        tracing::info!("released leader lock");
    }
}
