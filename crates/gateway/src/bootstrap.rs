//! AppState construction and background-task spawning.
//!
//! `build_app_state` is the shared boot path for `serve` and the
//! integration tests: it validates config, wires every subsystem, and
//! spawns the background loops (audit flusher, health prober, scheduler,
//! degradation probes, cluster election).

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use aegis_audit::{AuditLog, AuditStore, MemoryAuditStore, PgAuditStore};
use aegis_capability::CapabilityManager;
use aegis_domain::config::{Config, ConfigSeverity};
use aegis_providers::health::spawn_health_prober;
use aegis_providers::{LlmRouter, ProviderRegistry};
use aegis_reliability::{BreakerConfig, BreakerRegistry, RateLimiter, TokenTracker};
use aegis_supervisor::WorkerSupervisor;

use crate::api::auth::TokenGuard;
use crate::cluster::{
    ClusterCoordinator, LeaderElection, MemoryNodeDirectory, NodeDirectory, PgNodeDirectory,
};
use crate::degradation::DegradationManager;
use crate::memory::InMemoryRecall;
use crate::scheduler::{JobConfig, JobLock, LocalJobLock, Scheduler};
use crate::sessions::ClientRegistry;
use crate::state::AppState;
use crate::storage::{self, AgentStore, MemoryAgentStore, PgAgentStore, PgJobLock};
use crate::tasks::TaskRouter;

/// Validate config, initialize every subsystem, and return fully-wired
/// state.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let shutdown = CancellationToken::new();

    // ── Metrics recorder ─────────────────────────────────────────────
    // Installed once per process; later boots (tests) reuse the handle.
    static METRICS: std::sync::OnceLock<metrics_exporter_prometheus::PrometheusHandle> =
        std::sync::OnceLock::new();
    let metrics = match METRICS.get() {
        Some(handle) => handle.clone(),
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .context("installing metrics recorder")?;
            let _ = METRICS.set(handle.clone());
            handle
        }
    };

    // ── Database ─────────────────────────────────────────────────────
    let pool = storage::connect(&config.database).await?;
    if let Some(pool) = &pool {
        let report = storage::migrate(pool).await?;
        tracing::info!(
            applied = report.applied,
            skipped = report.skipped,
            "database ready"
        );
    } else {
        tracing::info!("no database configured, using in-memory stores");
    }

    // ── Audit log ────────────────────────────────────────────────────
    let audit_store: Arc<dyn AuditStore> = match &pool {
        Some(pool) => Arc::new(PgAuditStore::new(pool.clone())),
        None => Arc::new(MemoryAuditStore::new()),
    };
    let audit = AuditLog::new(config.audit.clone(), audit_store);
    audit.spawn_flusher();
    tracing::info!("audit log ready");

    // ── Policy engine ────────────────────────────────────────────────
    let policy = match &config.policy.file {
        Some(path) => aegis_policy::load_policy_file(path, audit.clone())
            .context("loading policy file")?,
        None => aegis_policy::template(&config.policy.template, audit.clone())
            .context("building policy template")?,
    };
    let policy = Arc::new(policy.with_allowlists(&config.security));
    tracing::info!(template = %config.policy.template, "policy engine ready");

    // ── Capability manager ───────────────────────────────────────────
    let permission_secret = match std::env::var("PERMISSION_SECRET") {
        Ok(secret) if !secret.is_empty() => secret.into_bytes(),
        _ => {
            // Dev mode: a process-local random secret still yields
            // unforgeable tokens, they just don't survive restarts.
            tracing::warn!("PERMISSION_SECRET not set, using an ephemeral secret");
            use rand::RngCore;
            let mut secret = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            secret
        }
    };
    let capabilities = Arc::new(CapabilityManager::new(
        permission_secret.clone(),
        config.security.capability_ttl_ms,
        audit.clone(),
    ));

    // ── LLM routing ──────────────────────────────────────────────────
    let registry = Arc::new(
        ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?,
    );
    if registry.is_empty() {
        tracing::info!("no LLM providers initialized — configure API keys to enable chat");
    } else {
        tracing::info!(providers = registry.len(), "LLM provider registry ready");
    }
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        op_timeout: std::time::Duration::from_millis(config.llm.request_timeout_ms),
        ..BreakerConfig::default()
    }));
    let limiter = Arc::new(RateLimiter::new());
    let tracker = Arc::new(TokenTracker::new(config.llm.budget.clone()));
    let llm = Arc::new(LlmRouter::new(
        registry.clone(),
        config.llm.clone(),
        breakers,
        limiter,
        tracker,
    ));
    spawn_health_prober(
        registry.clone(),
        config.llm.health_check_interval_ms,
        shutdown.clone(),
    );

    // ── Worker supervisor ────────────────────────────────────────────
    let supervisor = WorkerSupervisor::new(config.supervisor.clone(), audit.clone());
    tracing::info!(runtime = ?config.supervisor.runtime, "worker supervisor ready");

    // ── Agent records ────────────────────────────────────────────────
    let agents: Arc<dyn AgentStore> = match &pool {
        Some(pool) => Arc::new(PgAgentStore::new(pool.clone())),
        None => Arc::new(MemoryAgentStore::new()),
    };

    // ── Cluster ──────────────────────────────────────────────────────
    let internal_token = std::env::var("INTERNAL_AUTH_TOKEN").ok().filter(|t| !t.is_empty());
    let (cluster, leader) = if config.cluster.enabled {
        let pool = pool
            .clone()
            .context("cluster mode requires a database")?;
        let leader = LeaderElection::new(
            pool.clone(),
            &config.cluster.leader_lock_key,
            config.cluster.check_interval_ms,
        );
        leader.spawn_loop(shutdown.clone());
        let directory: Arc<dyn NodeDirectory> = Arc::new(PgNodeDirectory::new(pool));
        let coordinator = ClusterCoordinator::new(
            config.cluster.clone(),
            Some(leader.clone()),
            directory,
            internal_token.clone(),
        );
        tracing::info!(node_id = %config.cluster.node_id, "cluster mode enabled");
        (Some(coordinator), Some(leader))
    } else {
        let directory: Arc<dyn NodeDirectory> = Arc::new(MemoryNodeDirectory::new());
        let coordinator = ClusterCoordinator::new(
            config.cluster.clone(),
            None,
            directory,
            internal_token.clone(),
        );
        (Some(coordinator), None)
    };

    // ── Degradation manager ──────────────────────────────────────────
    let degradation = DegradationManager::new(config.degradation.clone());
    if let Some(pool) = pool.clone() {
        degradation.register(
            "database",
            Arc::new(move || {
                let pool = pool.clone();
                Box::pin(async move { sqlx::query("SELECT 1").execute(&pool).await.is_ok() })
            }),
            None,
        );
    }
    {
        let registry = registry.clone();
        degradation.register(
            "llm",
            Arc::new(move || {
                let registry = registry.clone();
                Box::pin(async move {
                    registry.is_empty()
                        || registry.health_snapshot().iter().any(|(_, healthy)| *healthy)
                })
            }),
            None,
        );
    }
    degradation.spawn_loop(shutdown.clone());

    // ── Scheduler ────────────────────────────────────────────────────
    let job_lock: Arc<dyn JobLock> = match &pool {
        Some(pool) => Arc::new(PgJobLock::new(pool.clone())),
        None => Arc::new(LocalJobLock::new()),
    };
    let leader_probe: Arc<dyn Fn() -> bool + Send + Sync> = match &leader {
        Some(leader) => {
            let leader = leader.clone();
            Arc::new(move || leader.is_leader())
        }
        None => Arc::new(|| true),
    };
    let scheduler = Scheduler::new(job_lock, leader_probe);
    scheduler.spawn_loop(shutdown.clone());

    // ── Sessions & task router ───────────────────────────────────────
    let clients = ClientRegistry::new(config.server.max_sessions);
    let auth_guard = TokenGuard::from_env("GATEWAY_AUTH_TOKEN").map(Arc::new);
    if auth_guard.is_none() {
        tracing::warn!("GATEWAY_AUTH_TOKEN not set — dev mode, any token authenticates");
    }
    let internal_guard = internal_token.as_deref().map(|t| Arc::new(TokenGuard::new(t)));

    let tasks = TaskRouter::new(
        policy.clone(),
        capabilities.clone(),
        audit.clone(),
        supervisor.clone(),
        llm.clone(),
        Arc::new(InMemoryRecall::new()),
        degradation.clone(),
        cluster.clone(),
        agents.clone(),
        internal_guard.clone(),
        Some(permission_secret),
        config.cluster.node_id.clone(),
        config.security.capability_ttl_ms,
    );
    supervisor.set_internal_router(tasks.clone());

    // ── Background jobs ──────────────────────────────────────────────
    register_jobs(&scheduler, &capabilities, cluster.as_ref(), &config)?;

    // ── State-change fan-out ─────────────────────────────────────────
    spawn_state_fanout(&supervisor, &agents, &clients, shutdown.clone());

    Ok(AppState {
        config,
        audit,
        policy,
        capabilities,
        llm,
        supervisor,
        tasks,
        agents,
        clients,
        scheduler,
        degradation,
        cluster,
        leader,
        pool,
        auth_guard,
        internal_guard,
        metrics,
        started_at: Instant::now(),
        shutdown,
    })
}

/// Periodic housekeeping jobs.
fn register_jobs(
    scheduler: &Arc<Scheduler>,
    capabilities: &Arc<CapabilityManager>,
    cluster: Option<&Arc<ClusterCoordinator>>,
    config: &Config,
) -> anyhow::Result<()> {
    {
        let capabilities = capabilities.clone();
        scheduler
            .register(
                JobConfig::new("capability-cleanup", "Sweep expired capability tokens", 60_000),
                Arc::new(move || {
                    let capabilities = capabilities.clone();
                    Box::pin(async move {
                        let swept = capabilities.cleanup();
                        if swept > 0 {
                            tracing::debug!(swept, "expired capability tokens removed");
                        }
                        Ok(())
                    })
                }),
            )
            .map_err(|e| anyhow::anyhow!("registering capability-cleanup: {e}"))?;
    }

    if let Some(cluster) = cluster {
        let heartbeat_cluster = cluster.clone();
        scheduler
            .register(
                JobConfig::new("node-heartbeat", "Publish this node's liveness", 10_000)
                    .run_immediately(),
                Arc::new(move || {
                    let cluster = heartbeat_cluster.clone();
                    Box::pin(async move { cluster.heartbeat().await })
                }),
            )
            .map_err(|e| anyhow::anyhow!("registering node-heartbeat: {e}"))?;

        let prune_cluster = cluster.clone();
        let ttl = config.cluster.node_ttl_secs;
        scheduler
            .register(
                JobConfig::new("node-prune", "Drop silent cluster nodes", 30_000).leader_only(),
                Arc::new(move || {
                    let cluster = prune_cluster.clone();
                    Box::pin(async move {
                        cluster.directory().prune(ttl).await.map(|_| ())
                    })
                }),
            )
            .map_err(|e| anyhow::anyhow!("registering node-prune: {e}"))?;
    }

    Ok(())
}

/// Forward supervisor state transitions to persisted records and
/// subscribed clients.
fn spawn_state_fanout(
    supervisor: &Arc<WorkerSupervisor>,
    agents: &Arc<dyn AgentStore>,
    clients: &Arc<ClientRegistry>,
    shutdown: CancellationToken,
) {
    let mut events = supervisor.subscribe();
    let agents = agents.clone();
    let clients = clients.clone();
    tokio::spawn(async move {
        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(change) => change,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "state fan-out lagged");
                        continue;
                    }
                    Err(_) => break,
                },
            };

            if let Err(e) = agents.set_state(&change.agent_id, change.state).await {
                tracing::warn!(agent_id = %change.agent_id, error = %e, "failed to persist state");
            }
            clients.publish(
                "agents",
                "agent.state.changed",
                serde_json::json!({
                    "agentId": change.agent_id,
                    "state": change.state,
                }),
            );
        }
    });
}
