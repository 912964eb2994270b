use std::sync::Arc;
use std::time::Instant;

use aegis_audit::AuditLog;
use aegis_capability::CapabilityManager;
use aegis_domain::config::Config;
use aegis_policy::PolicyEngine;
use aegis_providers::LlmRouter;
use aegis_supervisor::WorkerSupervisor;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use crate::api::auth::TokenGuard;
use crate::cluster::{ClusterCoordinator, LeaderElection};
use crate::degradation::DegradationManager;
use crate::scheduler::Scheduler;
use crate::sessions::ClientRegistry;
use crate::storage::AgentStore;
use crate::tasks::TaskRouter;

/// Shared application state passed to all handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, audit, policy, capabilities, LLM
/// - **Agents** — supervisor, task router, persisted records
/// - **Sessions** — client registry
/// - **Background** — scheduler, degradation, cluster
/// - **Security & observability** — token guards, metrics, shutdown
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub audit: Arc<AuditLog>,
    pub policy: Arc<PolicyEngine>,
    pub capabilities: Arc<CapabilityManager>,
    pub llm: Arc<LlmRouter>,

    // ── Agents ────────────────────────────────────────────────────────
    pub supervisor: Arc<WorkerSupervisor>,
    pub tasks: Arc<TaskRouter>,
    pub agents: Arc<dyn AgentStore>,

    // ── Sessions ──────────────────────────────────────────────────────
    pub clients: Arc<ClientRegistry>,

    // ── Background ────────────────────────────────────────────────────
    pub scheduler: Arc<Scheduler>,
    pub degradation: Arc<DegradationManager>,
    pub cluster: Option<Arc<ClusterCoordinator>>,
    pub leader: Option<Arc<LeaderElection>>,
    pub pool: Option<sqlx::PgPool>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// HMAC tag of GATEWAY_AUTH_TOKEN. `None` = dev mode.
    pub auth_guard: Option<Arc<TokenGuard>>,
    /// HMAC tag of INTERNAL_AUTH_TOKEN.
    pub internal_guard: Option<Arc<TokenGuard>>,

    // ── Observability ─────────────────────────────────────────────────
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}
