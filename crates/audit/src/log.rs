//! The buffered audit log.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aegis_domain::config::AuditConfig;
use aegis_domain::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::entry::{AuditEntry, AuditOutcome};
use crate::store::AuditStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Filters for [`AuditLog::query`]. All fields optional; unset = match all.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub resource_type: Option<String>,
    pub agent_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditQuery {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            if entry.outcome != outcome {
                return false;
            }
        }
        if let Some(rt) = &self.resource_type {
            if entry.resource_type.as_deref() != Some(rt.as_str()) {
                return false;
            }
        }
        if let Some(agent) = &self.agent_id {
            if entry.actor_id.as_deref() != Some(agent.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.created_at > until {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts over the in-memory ring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub by_outcome: HashMap<String, usize>,
    pub by_action: HashMap<String, usize>,
    pub by_resource_type: HashMap<String, usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AuditLog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Buffered, batched audit log.
///
/// `append` is synchronous and lock-only; the flusher task owns all store
/// I/O. When the flush queue exceeds the configured high-water mark the
/// oldest queued entries are dropped and a synthetic `audit.drop` entry
/// records how many were lost.
pub struct AuditLog {
    config: AuditConfig,
    store: Arc<dyn AuditStore>,
    /// Recent entries served by the query API.
    ring: Mutex<VecDeque<AuditEntry>>,
    /// Entries awaiting durable flush.
    queue: Mutex<VecDeque<AuditEntry>>,
    notify: Notify,
    stopped: AtomicBool,
}

impl AuditLog {
    pub fn new(config: AuditConfig, store: Arc<dyn AuditStore>) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(config.ring_capacity)),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            config,
            store,
        })
    }

    /// Append an entry. Never blocks on I/O.
    pub fn append(&self, entry: AuditEntry) {
        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.config.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }

        let depth = {
            let mut queue = self.queue.lock();

            // High-water: shed oldest and leave a marker.
            if queue.len() >= self.config.high_water {
                let mut dropped = 0usize;
                while queue.len() >= self.config.high_water {
                    queue.pop_front();
                    dropped += 1;
                }
                let marker = AuditEntry::new("audit.drop", AuditOutcome::Error)
                    .details(serde_json::json!({ "dropped": dropped }));
                tracing::warn!(dropped, "audit queue over high-water mark, dropped oldest");
                queue.push_back(marker.clone());
                let mut ring = self.ring.lock();
                if ring.len() >= self.config.ring_capacity {
                    ring.pop_front();
                }
                ring.push_back(marker);
            }

            queue.push_back(entry);
            queue.len()
        };

        metrics::gauge!("aegis_audit_buffer_depth", depth as f64);
        if depth >= self.config.buffer_size {
            self.notify.notify_one();
        }
    }

    /// Entries currently awaiting flush.
    pub fn buffer_depth(&self) -> usize {
        self.queue.lock().len()
    }

    // ── Flushing ───────────────────────────────────────────────────

    /// Spawn the background flusher. Runs until [`AuditLog::stop`] and the
    /// queue drains.
    pub fn spawn_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff_ms: u64 = 0;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(
                        log.config.flush_interval_ms + backoff_ms,
                    )) => {}
                    _ = log.notify.notified() => {}
                }

                match log.flush_batch().await {
                    Ok(_) => backoff_ms = 0,
                    Err(e) => {
                        // Exponential backoff, capped at 10s.
                        backoff_ms = (backoff_ms.max(250) * 2).min(10_000);
                        tracing::warn!(error = %e, backoff_ms, "audit flush failed, retrying");
                    }
                }

                if log.stopped.load(Ordering::Acquire) && log.queue.lock().is_empty() {
                    break;
                }
            }
        })
    }

    /// Flush one batch (up to `buffer_size` entries). On store failure the
    /// batch is requeued at the front so ordering is preserved.
    async fn flush_batch(&self) -> Result<usize> {
        let batch: Vec<AuditEntry> = {
            let mut queue = self.queue.lock();
            let n = queue.len().min(self.config.buffer_size);
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match self.store.insert_batch(&batch).await {
            Ok(()) => {
                metrics::gauge!("aegis_audit_buffer_depth", self.buffer_depth() as f64);
                Ok(batch.len())
            }
            Err(e) => {
                let mut queue = self.queue.lock();
                for entry in batch.into_iter().rev() {
                    queue.push_front(entry);
                }
                Err(e)
            }
        }
    }

    /// Drain the whole queue now (graceful-shutdown path).
    pub async fn flush_all(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.flush_batch().await?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Signal the flusher to exit once the queue is drained.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Query the in-memory ring, newest first.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let ring = self.ring.lock();
        let limit = query.limit.unwrap_or(100);
        ring.iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AuditStats {
        let ring = self.ring.lock();
        let mut by_outcome: HashMap<String, usize> = HashMap::new();
        let mut by_action: HashMap<String, usize> = HashMap::new();
        let mut by_resource_type: HashMap<String, usize> = HashMap::new();
        for entry in ring.iter() {
            *by_outcome.entry(entry.outcome.as_str().to_string()).or_default() += 1;
            *by_action.entry(entry.action.clone()).or_default() += 1;
            if let Some(rt) = &entry.resource_type {
                *by_resource_type.entry(rt.clone()).or_default() += 1;
            }
        }
        AuditStats {
            total: ring.len(),
            by_outcome,
            by_action,
            by_resource_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditStore;

    fn small_config() -> AuditConfig {
        AuditConfig {
            buffer_size: 4,
            flush_interval_ms: 20,
            ring_capacity: 8,
            high_water: 6,
        }
    }

    fn entry(action: &str, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry::new(action, outcome)
    }

    #[tokio::test]
    async fn append_and_flush() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::new(small_config(), store.clone());
        let flusher = log.spawn_flusher();

        for i in 0..5 {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Success));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.len() < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("entries should flush");

        log.stop();
        let _ = flusher.await;
        assert_eq!(store.len(), 5);
        assert_eq!(log.buffer_depth(), 0);
    }

    #[tokio::test]
    async fn store_outage_retries_without_loss() {
        let store = Arc::new(MemoryAuditStore::new());
        store.fail_next(2);
        let log = AuditLog::new(small_config(), store.clone());
        let flusher = log.spawn_flusher();

        for i in 0..4 {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Success));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len() < 4 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("entries should flush after outage");

        log.stop();
        let _ = flusher.await;
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn high_water_drops_oldest_with_marker() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::new(small_config(), store.clone());
        // No flusher: force the queue to fill.

        for i in 0..10 {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Success));
        }

        let queued: Vec<String> = {
            let q = log.queue.lock();
            q.iter().map(|e| e.action.clone()).collect()
        };
        assert!(queued.iter().any(|a| a == "audit.drop"));
        assert!(log.buffer_depth() <= small_config().high_water + 1);

        // Marker is also visible to queries.
        let drops = log.query(&AuditQuery {
            action: Some("audit.drop".into()),
            ..Default::default()
        });
        assert!(!drops.is_empty());
        assert!(drops[0].details["dropped"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn flush_all_drains_everything() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::new(small_config(), store.clone());
        for i in 0..9 {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Blocked));
        }
        let flushed = log.flush_all().await.unwrap();
        assert_eq!(flushed, 9);
        assert_eq!(store.len(), 9);
    }

    #[test]
    fn query_filters() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::new(small_config(), store);
        log.append(
            entry("file.read", AuditOutcome::Blocked)
                .actor("agent-1")
                .resource("file", "/etc/passwd"),
        );
        log.append(entry("chat", AuditOutcome::Success).actor("agent-2"));

        let blocked = log.query(&AuditQuery {
            outcome: Some(AuditOutcome::Blocked),
            ..Default::default()
        });
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].action, "file.read");

        let by_agent = log.query(&AuditQuery {
            agent_id: Some("agent-2".into()),
            ..Default::default()
        });
        assert_eq!(by_agent.len(), 1);

        let none = log.query(&AuditQuery {
            action: Some("nope".into()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn stats_aggregates() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::new(small_config(), store);
        log.append(entry("chat", AuditOutcome::Success));
        log.append(entry("chat", AuditOutcome::Success));
        log.append(entry("file.read", AuditOutcome::Blocked).resource("file", "/x"));

        let stats = log.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_action["chat"], 2);
        assert_eq!(stats.by_outcome["blocked"], 1);
        assert_eq!(stats.by_resource_type["file"], 1);
    }

    #[test]
    fn ring_is_bounded() {
        let store = Arc::new(MemoryAuditStore::new());
        let config = small_config();
        let cap = config.ring_capacity;
        let log = AuditLog::new(config, store);
        // Keep the queue below high-water so only ring bounding is in play.
        for i in 0..cap {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Success));
        }
        let _ = log.queue.lock().drain(..).count();
        for i in cap..cap + 3 {
            log.append(entry(&format!("op.{i}"), AuditOutcome::Success));
        }
        assert_eq!(log.stats().total, cap);
    }
}
