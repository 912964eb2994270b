//! Degradation manager: periodic dependency health probes feeding a
//! global load-shedding level.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_domain::config::DegradationConfig;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    Normal,
    Degraded,
    Emergency,
}

pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
pub type Fallback = Arc<dyn Fn() + Send + Sync>;

struct ServiceState {
    health_check: HealthCheck,
    fallback: Option<Fallback>,
    healthy: bool,
    fallback_active: bool,
}

/// Snapshot row for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    pub fallback_active: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DegradationManager {
    config: DegradationConfig,
    services: RwLock<HashMap<String, ServiceState>>,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            services: RwLock::new(HashMap::new()),
        })
    }

    /// Register a dependency. Services start healthy until proven
    /// otherwise.
    pub fn register(&self, name: &str, health_check: HealthCheck, fallback: Option<Fallback>) {
        self.services.write().insert(
            name.to_string(),
            ServiceState {
                health_check,
                fallback,
                healthy: true,
                fallback_active: false,
            },
        );
    }

    /// Run every health check in parallel and apply transitions. A
    /// healthy→unhealthy edge fires the fallback once.
    pub async fn run_checks(&self) {
        let checks: Vec<(String, HealthCheck)> = self
            .services
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.health_check.clone()))
            .collect();

        let results = futures_util::future::join_all(
            checks
                .into_iter()
                .map(|(name, check)| async move { (name, check().await) }),
        )
        .await;

        let mut services = self.services.write();
        for (name, healthy) in results {
            let Some(state) = services.get_mut(&name) else { continue };
            if state.healthy && !healthy {
                tracing::warn!(service = %name, "dependency became unhealthy");
                if let Some(fallback) = &state.fallback {
                    fallback();
                }
                state.fallback_active = true;
            } else if !state.healthy && healthy {
                tracing::info!(service = %name, "dependency recovered");
                state.fallback_active = false;
            }
            state.healthy = healthy;
        }
    }

    /// Current global level, computed from unavailable-service count.
    pub fn level(&self) -> DegradationLevel {
        let services = self.services.read();
        let unavailable = services.values().filter(|s| !s.healthy).count();
        if unavailable >= self.config.emergency_threshold {
            DegradationLevel::Emergency
        } else if unavailable > 0 {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Normal
        }
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.services
            .read()
            .get(name)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<ServiceHealth> {
        let mut rows: Vec<ServiceHealth> = self
            .services
            .read()
            .iter()
            .map(|(name, s)| ServiceHealth {
                name: name.clone(),
                healthy: s.healthy,
                fallback_active: s.fallback_active,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Spawn the periodic probe loop.
    pub fn spawn_loop(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.check_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                manager.run_checks().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn check_from(flag: Arc<AtomicBool>) -> HealthCheck {
        Arc::new(move || {
            let flag = flag.clone();
            Box::pin(async move { flag.load(Ordering::SeqCst) })
        })
    }

    fn manager() -> Arc<DegradationManager> {
        DegradationManager::new(DegradationConfig {
            check_interval_ms: 10,
            emergency_threshold: 2,
        })
    }

    #[tokio::test]
    async fn level_progression() {
        let mgr = manager();
        let a = Arc::new(AtomicBool::new(true));
        let b = Arc::new(AtomicBool::new(true));
        mgr.register("db", check_from(a.clone()), None);
        mgr.register("llm", check_from(b.clone()), None);

        mgr.run_checks().await;
        assert_eq!(mgr.level(), DegradationLevel::Normal);

        a.store(false, Ordering::SeqCst);
        mgr.run_checks().await;
        assert_eq!(mgr.level(), DegradationLevel::Degraded);
        assert!(!mgr.is_available("db"));
        assert!(mgr.is_available("llm"));

        b.store(false, Ordering::SeqCst);
        mgr.run_checks().await;
        assert_eq!(mgr.level(), DegradationLevel::Emergency);
    }

    #[tokio::test]
    async fn fallback_fires_once_per_transition() {
        let mgr = manager();
        let healthy = Arc::new(AtomicBool::new(true));
        let fires = Arc::new(AtomicU32::new(0));
        let fires_clone = fires.clone();
        mgr.register(
            "db",
            check_from(healthy.clone()),
            Some(Arc::new(move || {
                fires_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        healthy.store(false, Ordering::SeqCst);
        mgr.run_checks().await;
        mgr.run_checks().await;
        assert_eq!(fires.load(Ordering::SeqCst), 1, "fallback fires on the edge only");
        assert!(mgr.snapshot()[0].fallback_active);

        // Recovery clears the flag; the next outage fires again.
        healthy.store(true, Ordering::SeqCst);
        mgr.run_checks().await;
        assert!(!mgr.snapshot()[0].fallback_active);
        healthy.store(false, Ordering::SeqCst);
        mgr.run_checks().await;
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_service_is_unavailable() {
        let mgr = manager();
        assert!(!mgr.is_available("nope"));
    }
}
