//! Gateway configuration: TOML file + environment overrides + validation.
//!
//! Layering: defaults ← TOML file ← environment knobs. Secrets
//! (`GATEWAY_AUTH_TOKEN`, `PERMISSION_SECRET`, `INTERNAL_AUTH_TOKEN`) are
//! never stored here — they are read once at bootstrap and only their
//! digests are kept in process state.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub degradation: DegradationConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults + environment overrides only (no file).
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Apply the documented environment knobs on top of the current values.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_parse::<u16>("GATEWAY_PORT") {
            self.server.port = port;
        }
        if let Some(port) = env_parse::<u16>("HEALTH_PORT") {
            self.server.health_port = port;
        }
        if let Some(v) = env_bool("ENFORCE_PRODUCTION_HARDENING") {
            self.security.enforce_production_hardening = v;
        }
        if let Ok(v) = std::env::var("AGENT_WORKER_RUNTIME") {
            match v.as_str() {
                "local" => self.supervisor.runtime = WorkerRuntime::Local,
                "container" => self.supervisor.runtime = WorkerRuntime::Container,
                other => {
                    tracing::warn!(value = %other, "unknown AGENT_WORKER_RUNTIME, keeping config value")
                }
            }
        }
        if let Ok(v) = std::env::var("ALLOWED_PATHS") {
            self.security.allowed_paths = split_list(&v);
        }
        if let Ok(v) = std::env::var("ALLOWED_DOMAINS") {
            self.security.allowed_domains = split_list(&v);
        }
        if let Some(v) = env_bool("ALLOW_ALL_PATHS") {
            self.security.allow_all_paths = v;
        }
        if let Some(v) = env_bool("ALLOW_ALL_DOMAINS") {
            self.security.allow_all_domains = v;
        }
        if let Some(v) = env_bool("CLUSTER_MODE") {
            self.cluster.enabled = v;
        }
        if let Ok(v) = std::env::var("CLUSTER_NODE_ID") {
            if !v.is_empty() {
                self.cluster.node_id = v;
            }
        }
        if let Ok(v) = std::env::var("CLUSTER_LEADER_LOCK_KEY") {
            if !v.is_empty() {
                self.cluster.leader_lock_key = v;
            }
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            if !v.is_empty() {
                self.database.url = Some(v);
            }
        }
    }

    /// Validate, returning every issue found. Callers refuse to start on
    /// any [`ConfigSeverity::Error`].
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        // Allow-all flags combined with explicit allowlists are ambiguous
        // and rejected outright.
        if self.security.allow_all_paths && !self.security.allowed_paths.is_empty() {
            issues.push(ConfigIssue::error(
                "ALLOW_ALL_PATHS is set together with a non-empty path allowlist; pick one",
            ));
        }
        if self.security.allow_all_domains && !self.security.allowed_domains.is_empty() {
            issues.push(ConfigIssue::error(
                "ALLOW_ALL_DOMAINS is set together with a non-empty domain allowlist; pick one",
            ));
        }

        if self.security.enforce_production_hardening {
            for (name, min_len) in [
                ("GATEWAY_AUTH_TOKEN", 32usize),
                ("PERMISSION_SECRET", 32usize),
            ] {
                match std::env::var(name) {
                    Ok(v) if v.len() >= min_len => {}
                    Ok(_) => issues.push(ConfigIssue::error(format!(
                        "{name} must be at least {min_len} characters in production"
                    ))),
                    Err(_) => issues.push(ConfigIssue::error(format!(
                        "{name} is required when production hardening is enforced"
                    ))),
                }
            }
            if self.security.allow_all_paths || self.security.allow_all_domains {
                issues.push(ConfigIssue::warning(
                    "allow-all flags are enabled under production hardening",
                ));
            }
        }

        if self.cluster.enabled && self.database.url.is_none() {
            issues.push(ConfigIssue::error(
                "cluster mode requires a database url (DATABASE_URL or [database].url)",
            ));
        }

        for provider in &self.llm.providers {
            if provider.models.is_empty() {
                issues.push(ConfigIssue::warning(format!(
                    "provider '{}' advertises no models and will never be routed to",
                    provider.id
                )));
            }
        }
        if self.llm.max_failover_attempts == 0 {
            issues.push(ConfigIssue::warning(
                "llm.max_failover_attempts is 0; failover is disabled",
            ));
        }

        if self.supervisor.heartbeat_timeout_ms <= self.supervisor.heartbeat_interval_ms {
            issues.push(ConfigIssue::error(
                "supervisor.heartbeat_timeout_ms must exceed heartbeat_interval_ms",
            ));
        }

        issues
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_4800")]
    pub port: u16,
    #[serde(default = "d_4801")]
    pub health_port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Hard cap on concurrent client sessions; further upgrades get 1013.
    #[serde(default = "d_1024")]
    pub max_sessions: usize,
    /// Drain deadline for graceful shutdown.
    #[serde(default = "d_10000")]
    pub drain_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4800,
            health_port: 4801,
            host: "127.0.0.1".into(),
            max_sessions: 1024,
            drain_timeout_ms: 10_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Security
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Refuse to start with weak or missing secrets.
    #[serde(default)]
    pub enforce_production_hardening: bool,
    /// Auth failures tolerated per client per rolling minute.
    #[serde(default = "d_5u32")]
    pub auth_max_failures: u32,
    /// Messages tolerated per client per rolling minute.
    #[serde(default = "d_120")]
    pub client_messages_per_minute: u32,
    /// Path prefixes workers may touch (empty = policy rules only).
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Domains workers may reach (empty = policy rules only).
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allow_all_paths: bool,
    #[serde(default)]
    pub allow_all_domains: bool,
    /// Default capability token lifetime.
    #[serde(default = "d_3600_000")]
    pub capability_ttl_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforce_production_hardening: false,
            auth_max_failures: 5,
            client_messages_per_minute: 120,
            allowed_paths: Vec::new(),
            allowed_domains: Vec::new(),
            allow_all_paths: false,
            allow_all_domains: false,
            capability_ttl_ms: 3_600_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider adapters in configuration order.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Model alias map, e.g. `claude → claude-sonnet-4-5-20250929`.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Fallback models tried, in order, when every provider for the
    /// requested model fails.
    #[serde(default)]
    pub model_preferences: Vec<String>,
    #[serde(default = "d_2u32")]
    pub max_failover_attempts: u32,
    #[serde(default = "d_60000")]
    pub request_timeout_ms: u64,
    /// Stream must yield its first chunk within this window.
    #[serde(default = "d_30000")]
    pub stream_init_timeout_ms: u64,
    /// A stream stalling longer than this between chunks is aborted.
    #[serde(default = "d_30000")]
    pub stream_chunk_timeout_ms: u64,
    /// 0 disables provider health probing.
    #[serde(default = "d_30000")]
    pub health_check_interval_ms: u64,
    #[serde(default = "d_3u32")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            aliases: HashMap::new(),
            model_preferences: Vec::new(),
            max_failover_attempts: 2,
            request_timeout_ms: 60_000,
            stream_init_timeout_ms: 30_000,
            stream_chunk_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            max_retries: 3,
            budget: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    /// Adapter kind: `anthropic` or `openai-compat`.
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Models this provider serves.
    #[serde(default)]
    pub models: Vec<String>,
    /// Lower number = tried first.
    #[serde(default = "d_100u32")]
    pub priority: u32,
    #[serde(default = "d_60u32")]
    pub max_requests_per_minute: u32,
    #[serde(default = "d_100_000u32")]
    pub max_tokens_per_minute: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    OpenaiCompat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub limit_usd: f64,
    #[serde(default)]
    pub period: BudgetPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Hourly,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRuntime {
    #[default]
    Local,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub runtime: WorkerRuntime,
    /// Path to the worker binary for the local runtime.
    #[serde(default = "d_worker_bin")]
    pub worker_binary: PathBuf,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default = "d_4u32")]
    pub max_restarts: u32,
    /// First restart delay; doubles per attempt, capped at 30 s.
    #[serde(default = "d_1000")]
    pub restart_backoff_base_ms: u64,
    #[serde(default = "d_5000")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_15000")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "d_60000")]
    pub task_timeout_ms: u64,
    /// Grace between SIGTERM and SIGKILL on terminate.
    #[serde(default = "d_2000")]
    pub terminate_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime: WorkerRuntime::Local,
            worker_binary: d_worker_bin(),
            container: ContainerConfig::default(),
            max_restarts: 4,
            restart_backoff_base_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            task_timeout_ms: 60_000,
            terminate_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container runtime binary (`docker`, `podman`).
    #[serde(default = "d_docker")]
    pub binary: String,
    #[serde(default = "d_worker_image")]
    pub image: String,
    #[serde(default = "d_512u32")]
    pub memory_mb: u32,
    #[serde(default = "d_1f32")]
    pub cpus: f32,
    #[serde(default = "d_128u32")]
    pub pids_limit: u32,
    /// Network stays disabled unless explicitly opted in.
    #[serde(default)]
    pub network_enabled: bool,
    #[serde(default = "d_64u32")]
    pub tmpfs_mb: u32,
    #[serde(default = "d_true")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_opt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blkio_weight: Option<u16>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: d_docker(),
            image: d_worker_image(),
            memory_mb: 512,
            cpus: 1.0,
            pids_limit: 128,
            network_enabled: false,
            tmpfs_mb: 64,
            read_only: true,
            security_profile: None,
            storage_opt: None,
            blkio_weight: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cluster
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_node_id")]
    pub node_id: String,
    /// WebSocket URL other nodes use to reach this one.
    #[serde(default)]
    pub ws_url: String,
    #[serde(default = "d_lock_key")]
    pub leader_lock_key: String,
    #[serde(default = "d_5000")]
    pub check_interval_ms: u64,
    /// Nodes silent longer than this are pruned from the registry.
    #[serde(default = "d_30u64")]
    pub node_ttl_secs: u64,
    #[serde(default = "d_10000")]
    pub forward_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: d_node_id(),
            ws_url: String::new(),
            leader_lock_key: d_lock_key(),
            check_interval_ms: 5_000,
            node_ttl_secs: 30,
            forward_timeout_ms: 10_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Flush when this many entries are queued.
    #[serde(default = "d_256us")]
    pub buffer_size: usize,
    #[serde(default = "d_2000")]
    pub flush_interval_ms: u64,
    /// In-memory ring served by the query API.
    #[serde(default = "d_10000us")]
    pub ring_capacity: usize,
    /// Queue depth beyond which oldest entries are dropped.
    #[serde(default = "d_50000us")]
    pub high_water: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            flush_interval_ms: 2_000,
            ring_capacity: 10_000,
            high_water: 50_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// YAML policy file. When unset, `template` is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Built-in template: `strict`, `balanced`, or `permissive`.
    #[serde(default = "d_balanced")]
    pub template: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            file: None,
            template: d_balanced(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL; `None` runs with in-memory stores (dev mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "d_10u32")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Degradation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "d_10000")]
    pub check_interval_ms: u64,
    /// Unavailable services at or above this count ⇒ emergency.
    #[serde(default = "d_2us")]
    pub emergency_threshold: usize,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            emergency_threshold: 2,
        }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_4800() -> u16 {
    4800
}
fn d_4801() -> u16 {
    4801
}
fn d_1024() -> usize {
    1024
}
fn d_true() -> bool {
    true
}
fn d_5u32() -> u32 {
    5
}
fn d_120() -> u32 {
    120
}
fn d_2u32() -> u32 {
    2
}
fn d_3u32() -> u32 {
    3
}
fn d_4u32() -> u32 {
    4
}
fn d_10u32() -> u32 {
    10
}
fn d_60u32() -> u32 {
    60
}
fn d_100u32() -> u32 {
    100
}
fn d_512u32() -> u32 {
    512
}
fn d_128u32() -> u32 {
    128
}
fn d_64u32() -> u32 {
    64
}
fn d_100_000u32() -> u32 {
    100_000
}
fn d_1f32() -> f32 {
    1.0
}
fn d_30u64() -> u64 {
    30
}
fn d_1000() -> u64 {
    1_000
}
fn d_2000() -> u64 {
    2_000
}
fn d_5000() -> u64 {
    5_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_15000() -> u64 {
    15_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_60000() -> u64 {
    60_000
}
fn d_3600_000() -> u64 {
    3_600_000
}
fn d_2us() -> usize {
    2
}
fn d_256us() -> usize {
    256
}
fn d_10000us() -> usize {
    10_000
}
fn d_50000us() -> usize {
    50_000
}
fn d_worker_bin() -> PathBuf {
    PathBuf::from("aegis-worker")
}
fn d_docker() -> String {
    "docker".into()
}
fn d_worker_image() -> String {
    "aegis-worker:latest".into()
}
fn d_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}
fn d_lock_key() -> String {
    "aegis-gateway-leader".into()
}
fn d_balanced() -> String {
    "balanced".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 4800);
        assert_eq!(config.supervisor.max_restarts, 4);
        assert_eq!(config.audit.buffer_size, 256);
        assert_eq!(config.policy.template, "balanced");
    }

    #[test]
    fn allow_all_with_allowlist_is_an_error() {
        let mut config = Config::default();
        config.security.allow_all_paths = true;
        config.security.allowed_paths = vec!["/tmp".into()];
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("ALLOW_ALL_PATHS")));
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let mut config = Config::default();
        config.supervisor.heartbeat_interval_ms = 10_000;
        config.supervisor.heartbeat_timeout_ms = 5_000;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn provider_section_parses() {
        let toml = r#"
            [[llm.providers]]
            id = "anthropic"
            kind = "anthropic"
            api_key_env = "ANTHROPIC_API_KEY"
            models = ["claude-sonnet-4-5-20250929"]
            priority = 1

            [llm.aliases]
            claude = "claude-sonnet-4-5-20250929"

            [llm.budget]
            limit_usd = 5.0
            period = "daily"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.llm.providers.len(), 1);
        assert_eq!(config.llm.providers[0].kind, ProviderKind::Anthropic);
        assert_eq!(config.llm.aliases["claude"], "claude-sonnet-4-5-20250929");
        assert_eq!(config.llm.budget.unwrap().period, BudgetPeriod::Daily);
    }

    #[test]
    fn cluster_requires_database() {
        let mut config = Config::default();
        config.cluster.enabled = true;
        config.database.url = None;
        assert!(config
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("cluster")));
    }
}
