//! The agent model: lifecycle states, trust levels, resource limits, and
//! explicit permission grants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Agent lifecycle state.
///
/// Transitions follow idle → starting → ready ⇄ running → terminated,
/// with `Error` reachable from any non-terminal state. A terminated
/// agent is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Starting,
    Ready,
    Running,
    Error,
    Terminated,
}

impl AgentState {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            // Error is reachable from any non-terminal state.
            (Terminated, _) => false,
            (_, Error) => true,
            (Idle, Starting) => true,
            (Starting, Ready) => true,
            (Ready, Running) | (Running, Ready) => true,
            (Ready, Terminated) | (Running, Terminated) | (Starting, Terminated) => true,
            (Error, Terminated) => true,
            // Restarting after a crash re-enters Starting.
            (Error, Starting) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == AgentState::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Starting => "starting",
            AgentState::Ready => "ready",
            AgentState::Running => "running",
            AgentState::Error => "error",
            AgentState::Terminated => "terminated",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trust
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trust level controlling human-approval requirements for tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrustLevel {
    /// Every tool invocation requires approval.
    #[serde(rename = "supervised")]
    #[default]
    Supervised,
    /// Approval only for tools flagged `requires_confirmation` or
    /// policy `approve` decisions.
    #[serde(rename = "semi-autonomous")]
    SemiAutonomous,
    /// Same approval rules as semi-autonomous; all calls audited.
    #[serde(rename = "monitored-autonomous")]
    MonitoredAutonomous,
}

impl TrustLevel {
    /// Whether every invocation needs approval regardless of tool flags.
    pub fn always_requires_approval(self) -> bool {
        matches!(self, TrustLevel::Supervised)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits & grants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-agent resource limits. All optional; `None` = unlimited or the
/// supervisor default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_per_request: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_quota_mb: Option<u32>,
}

/// An explicit permission grant declared in a manifest.
///
/// Grants take precedence over trust-level defaults: a matching grant
/// satisfies the permission check, and trust level only decides whether
/// human approval is additionally required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionGrant {
    /// Permission category, e.g. `filesystem`, `network`, `tools`.
    pub category: String,
    /// Actions within the category, e.g. `["read", "write"]`.
    pub actions: Vec<String>,
    /// Optional resource pattern the grant is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Free-form constraints (max sizes, rate hints).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<HashMap<String, serde_json::Value>>,
}

impl PermissionGrant {
    /// Whether this grant covers `category`/`action` (resource matching is
    /// the policy engine's job; the grant's `resource` is carried through
    /// for it).
    pub fn covers(&self, category: &str, action: &str) -> bool {
        self.category == category
            && (self.actions.iter().any(|a| a == action || a == "*"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A registered agent. Owned by the supervisor for its lifetime; other
/// subsystems reference it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub state: AgentState,
    #[serde(default)]
    pub trust_level: TrustLevel,
    /// Declared permission strings, e.g. `"filesystem.read:/tmp"`.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub permission_grants: Vec<PermissionGrant>,
    #[serde(default)]
    pub limits: AgentLimits,
    /// Cluster node currently hosting the agent's worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Whether a declared permission string covers `category.action`
    /// (optionally scoped with `:resource`, which the policy engine
    /// evaluates separately).
    pub fn has_permission(&self, category: &str, action: &str) -> bool {
        let exact = format!("{category}.{action}");
        let wildcard = format!("{category}.*");
        self.permissions.iter().any(|p| {
            let base = p.split(':').next().unwrap_or(p);
            base == exact || base == wildcard || base == "*"
        }) || self
            .permission_grants
            .iter()
            .any(|g| g.covers(category, action))
    }
}
