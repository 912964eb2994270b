//! The worker supervisor.
//!
//! One worker per agent, at most. Tasks are tracked in a pending map of
//! oneshot senders correlated by task id; a task timeout rejects the
//! pending entry without killing the worker, and a worker exit rejects
//! everything in flight. Crashed workers restart with
//! `min(30s, base · 2^(attempts-1))` backoff until the restart budget is
//! spent, after which the agent lands in the error state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_audit::{AuditEntry, AuditLog, AuditOutcome};
use aegis_domain::agent::{Agent, AgentState};
use aegis_domain::config::{SupervisorConfig, WorkerRuntime};
use aegis_domain::{Error, Result};
use aegis_protocol::{TaskStatus, ToolSpec, WorkerMessage};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::runtime::{container_command, local_command};
use crate::transport::{spawn_worker, StdioTransport};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emitted on every agent state transition.
#[derive(Debug, Clone)]
pub struct AgentStateChange {
    pub agent_id: String,
    pub state: AgentState,
}

/// Snapshot of one worker for introspection endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerView {
    pub agent_id: String,
    pub state: AgentState,
    pub restart_attempts: u32,
    pub pending_tasks: usize,
    pub pid: Option<u32>,
}

/// Gateway-side handler for tasks a worker sends back over the internal
/// channel (`task_request`).
#[async_trait::async_trait]
pub trait InternalTaskRouter: Send + Sync {
    async fn route_internal(
        &self,
        agent_id: &str,
        task: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingTask {
    tx: oneshot::Sender<Result<serde_json::Value>>,
}

struct WorkerState {
    agent: Agent,
    state_tx: watch::Sender<AgentState>,
    transport: RwLock<Option<Arc<StdioTransport>>>,
    tools: Mutex<Vec<ToolSpec>>,
    pending: Mutex<HashMap<String, PendingTask>>,
    restart_attempts: AtomicU32,
    shutdown_requested: AtomicBool,
    last_heartbeat: Mutex<Instant>,
}

impl WorkerState {
    fn new(agent: Agent) -> Arc<Self> {
        let (state_tx, _) = watch::channel(AgentState::Idle);
        Arc::new(Self {
            agent,
            state_tx,
            transport: RwLock::new(None),
            tools: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            restart_attempts: AtomicU32::new(0),
            shutdown_requested: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
        })
    }

    fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    fn reject_all_pending(&self, reason: &str) -> usize {
        let drained: Vec<PendingTask> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for task in drained {
            let _ = task.tx.send(Err(Error::Worker {
                agent_id: self.agent.id.clone(),
                message: reason.to_string(),
            }));
        }
        count
    }
}

/// Restart delay for attempt `n` (1-based), before jitter.
fn backoff_for(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(30_000))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    audit: Arc<AuditLog>,
    workers: Mutex<HashMap<String, Arc<WorkerState>>>,
    events: broadcast::Sender<AgentStateChange>,
    internal: RwLock<Option<Arc<dyn InternalTaskRouter>>>,
    shutdown: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig, audit: Arc<AuditLog>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            audit,
            workers: Mutex::new(HashMap::new()),
            events,
            internal: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Install the handler for worker-initiated internal tasks. Set once
    /// at bootstrap, after the task router exists.
    pub fn set_internal_router(&self, router: Arc<dyn InternalTaskRouter>) {
        *self.internal.write() = Some(router);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentStateChange> {
        self.events.subscribe()
    }

    // ── Spawn ──────────────────────────────────────────────────────

    /// Spawn a worker for `agent` and wait for its `ready`. Returns the
    /// tools the worker advertises.
    pub async fn spawn(self: &Arc<Self>, agent: Agent) -> Result<Vec<ToolSpec>> {
        let agent_id = agent.id.clone();
        let state = {
            let mut workers = self.workers.lock();
            if let Some(existing) = workers.get(&agent_id) {
                if !existing.state().is_terminal() && existing.state() != AgentState::Error {
                    return Err(Error::Validation(format!(
                        "agent '{agent_id}' already has a worker"
                    )));
                }
                // A terminated agent id is never reused.
                if existing.state().is_terminal() {
                    return Err(Error::Validation(format!(
                        "agent '{agent_id}' was terminated and cannot be reused"
                    )));
                }
                return Err(Error::Validation(format!(
                    "agent '{agent_id}' is in the error state"
                )));
            }
            let state = WorkerState::new(agent);
            workers.insert(agent_id.clone(), state.clone());
            state
        };

        self.set_state(&state, AgentState::Starting);
        self.launch(&state)?;
        metrics::gauge!("aegis_active_workers", self.active_count() as f64);

        // Wait for ready.
        let deadline = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let mut rx = state.state_tx.subscribe();
        let waited = tokio::time::timeout(deadline, async {
            loop {
                let current = *rx.borrow_and_update();
                match current {
                    AgentState::Ready => return Ok(()),
                    AgentState::Error | AgentState::Terminated => {
                        return Err(Error::Worker {
                            agent_id: agent_id.clone(),
                            message: format!("worker entered {current:?} before ready"),
                        })
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Worker {
                        agent_id: agent_id.clone(),
                        message: "worker state channel closed".into(),
                    });
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {
                self.audit.append(
                    AuditEntry::new("worker.spawn", AuditOutcome::Success)
                        .resource("agent", &agent_id),
                );
                Ok(state.tools.lock().clone())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Ready never came; the restart loop owns the worker now.
                Err(Error::Timeout(format!(
                    "worker for '{agent_id}' did not become ready within {deadline:?}"
                )))
            }
        }
    }

    /// Start (or restart) the child process and its event loop.
    fn launch(self: &Arc<Self>, state: &Arc<WorkerState>) -> Result<()> {
        let command = match self.config.runtime {
            WorkerRuntime::Local => local_command(&self.config),
            WorkerRuntime::Container => container_command(
                &self.config.container,
                &state.agent.id,
                &state.agent.limits,
            ),
        };

        let spawned = spawn_worker(&state.agent.id, command)?;
        *state.transport.write() = Some(spawned.transport.clone());
        *state.last_heartbeat.lock() = Instant::now();

        // Bootstrap the worker.
        let init = WorkerMessage::Init {
            agent_id: state.agent.id.clone(),
            agent_name: state.agent.name.clone(),
            entry_point: None,
        };
        let transport = spawned.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&init).await {
                tracing::warn!(error = %e, "failed to send init to worker");
            }
        });

        let supervisor = Arc::clone(self);
        let state = Arc::clone(state);
        let mut messages = spawned.messages;
        let mut exit = spawned.exit;
        tokio::spawn(async move {
            let heartbeat_timeout = Duration::from_millis(supervisor.config.heartbeat_timeout_ms);
            let mut check = tokio::time::interval(Duration::from_millis(
                supervisor.config.heartbeat_interval_ms,
            ));
            check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut term_sent = false;
            let mut messages_closed = false;

            loop {
                tokio::select! {
                    msg = messages.recv(), if !messages_closed => {
                        match msg {
                            Some(msg) => supervisor.handle_message(&state, msg),
                            // Stream closed; exit is imminent.
                            None => messages_closed = true,
                        }
                    }
                    exit_info = &mut exit => {
                        let code = exit_info.ok().and_then(|e| e.code);
                        supervisor.handle_exit(&state, code).await;
                        return;
                    }
                    _ = check.tick() => {
                        let stale = state.last_heartbeat.lock().elapsed() > heartbeat_timeout;
                        if stale && state.state() == AgentState::Ready
                            || stale && state.state() == AgentState::Running
                        {
                            let transport = state.transport.read().clone();
                            if let Some(transport) = transport {
                                if !term_sent {
                                    term_sent = true;
                                    tracing::warn!(agent_id = %state.agent.id, "heartbeat lost, sending SIGTERM");
                                    transport.signal_term().await;
                                    let grace = Duration::from_millis(supervisor.config.terminate_grace_ms);
                                    let transport = transport.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(grace).await;
                                        transport.kill().await;
                                    });
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    // ── Message handling ───────────────────────────────────────────

    fn handle_message(self: &Arc<Self>, state: &Arc<WorkerState>, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Ready { tools, .. } => {
                *state.tools.lock() = tools;
                *state.last_heartbeat.lock() = Instant::now();
                self.set_state(state, AgentState::Ready);
            }
            WorkerMessage::Heartbeat { .. } => {
                *state.last_heartbeat.lock() = Instant::now();
            }
            WorkerMessage::Log { level, text } => match level.as_str() {
                "error" => tracing::error!(agent_id = %state.agent.id, "worker: {text}"),
                "warn" => tracing::warn!(agent_id = %state.agent.id, "worker: {text}"),
                "debug" => tracing::debug!(agent_id = %state.agent.id, "worker: {text}"),
                _ => tracing::info!(agent_id = %state.agent.id, "worker: {text}"),
            },
            WorkerMessage::Result {
                task_id,
                status,
                result,
                error,
            } => {
                let pending = state.pending.lock().remove(&task_id);
                match pending {
                    Some(task) => {
                        let outcome = match status {
                            TaskStatus::Ok => Ok(result.unwrap_or(serde_json::Value::Null)),
                            TaskStatus::Error => Err(Error::Worker {
                                agent_id: state.agent.id.clone(),
                                message: error.unwrap_or_else(|| "task failed".into()),
                            }),
                        };
                        let _ = task.tx.send(outcome);
                    }
                    None => {
                        tracing::warn!(
                            agent_id = %state.agent.id,
                            task_id = %task_id,
                            "result for unknown task"
                        );
                    }
                }
                if state.pending.lock().is_empty() && state.state() == AgentState::Running {
                    self.set_state(state, AgentState::Ready);
                }
            }
            WorkerMessage::TaskRequest { request_id, task } => {
                let router = self.internal.read().clone();
                let transport = state.transport.read().clone();
                let agent_id = state.agent.id.clone();
                tokio::spawn(async move {
                    let response = match router {
                        Some(router) => match router.route_internal(&agent_id, task).await {
                            Ok(result) => WorkerMessage::TaskResponse {
                                request_id,
                                status: TaskStatus::Ok,
                                result: Some(result),
                                error: None,
                            },
                            Err(e) => WorkerMessage::TaskResponse {
                                request_id,
                                status: TaskStatus::Error,
                                result: None,
                                error: Some(e.client_message()),
                            },
                        },
                        None => WorkerMessage::TaskResponse {
                            request_id,
                            status: TaskStatus::Error,
                            result: None,
                            error: Some("internal channel unavailable".into()),
                        },
                    };
                    if let Some(transport) = transport {
                        let _ = transport.send(&response).await;
                    }
                });
            }
            other => {
                tracing::debug!(agent_id = %state.agent.id, ?other, "unexpected worker message");
            }
        }
    }

    async fn handle_exit(self: &Arc<Self>, state: &Arc<WorkerState>, code: Option<i32>) {
        let rejected = state.reject_all_pending("worker exited");
        *state.transport.write() = None;
        self.audit.append(
            AuditEntry::new(
                "worker.exit",
                if code == Some(0) {
                    AuditOutcome::Success
                } else {
                    AuditOutcome::Error
                },
            )
            .resource("agent", &state.agent.id)
            .details(serde_json::json!({ "code": code, "rejected_tasks": rejected })),
        );

        if state.shutdown_requested.load(Ordering::Acquire) || state.state().is_terminal() {
            self.set_state(state, AgentState::Terminated);
            metrics::gauge!("aegis_active_workers", self.active_count() as f64);
            return;
        }

        let attempts = state.restart_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        if attempts > self.config.max_restarts {
            tracing::error!(
                agent_id = %state.agent.id,
                attempts,
                "restart budget exhausted, agent in error state"
            );
            self.set_state(state, AgentState::Error);
            self.audit.append(
                AuditEntry::new("worker.error", AuditOutcome::Error)
                    .resource("agent", &state.agent.id)
                    .details(serde_json::json!({ "restart_attempts": attempts })),
            );
            metrics::gauge!("aegis_active_workers", self.active_count() as f64);
            return;
        }

        let base = backoff_for(self.config.restart_backoff_base_ms, attempts);
        // ±10% jitter keeps herd restarts from aligning.
        let jitter = {
            use rand::Rng;
            let span = (base.as_millis() as f64 * 0.1) as i64;
            if span > 0 {
                rand::thread_rng().gen_range(-span..=span)
            } else {
                0
            }
        };
        let delay = Duration::from_millis((base.as_millis() as i64 + jitter).max(0) as u64);
        tracing::warn!(
            agent_id = %state.agent.id,
            attempt = attempts,
            ?delay,
            "worker exited, restarting after backoff"
        );
        self.set_state(state, AgentState::Starting);

        let supervisor = Arc::clone(self);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = supervisor.shutdown.cancelled() => return,
            }
            if state.shutdown_requested.load(Ordering::Acquire) {
                supervisor.set_state(&state, AgentState::Terminated);
                return;
            }
            if let Err(e) = supervisor.launch(&state) {
                tracing::error!(agent_id = %state.agent.id, error = %e, "restart failed");
                supervisor.set_state(&state, AgentState::Error);
            }
        });
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Dispatch a task to an agent's worker and await the correlated
    /// result. A timeout rejects the pending entry but leaves the worker
    /// running.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        task: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.dispatch_with_id(agent_id, &uuid::Uuid::new_v4().to_string(), task, timeout)
            .await
    }

    pub(crate) async fn dispatch_with_id(
        &self,
        agent_id: &str,
        task_id: &str,
        task: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let state = self
            .workers
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}'")))?;

        let transport = state.transport.read().clone().ok_or_else(|| Error::Worker {
            agent_id: agent_id.to_string(),
            message: "worker is not running".into(),
        })?;

        let (tx, rx) = oneshot::channel();
        state
            .pending
            .lock()
            .insert(task_id.to_string(), PendingTask { tx });
        if state.state() == AgentState::Ready {
            self.set_state(&state, AgentState::Running);
        }

        let msg = WorkerMessage::Task {
            task_id: task_id.to_string(),
            task,
        };
        if let Err(e) = transport.send(&msg).await {
            state.pending.lock().remove(task_id);
            return Err(e);
        }

        let timeout = timeout.unwrap_or(Duration::from_millis(self.config.task_timeout_ms));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Worker {
                agent_id: agent_id.to_string(),
                message: "worker exited".into(),
            }),
            Err(_) => {
                state.pending.lock().remove(task_id);
                if state.pending.lock().is_empty() && state.state() == AgentState::Running {
                    self.set_state(&state, AgentState::Ready);
                }
                Err(Error::Timeout(format!(
                    "task {task_id} to '{agent_id}' timed out after {timeout:?}"
                )))
            }
        }
    }

    // ── Terminate ──────────────────────────────────────────────────

    /// Gracefully stop an agent's worker: `terminate` message, grace
    /// wait, SIGTERM, grace wait, SIGKILL.
    pub async fn terminate(&self, agent_id: &str) -> Result<()> {
        let state = self
            .workers
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}'")))?;

        state.shutdown_requested.store(true, Ordering::Release);
        let transport = state.transport.read().clone();
        let Some(transport) = transport else {
            // Never started or already gone.
            self.set_state(&state, AgentState::Terminated);
            return Ok(());
        };

        let _ = transport.send(&WorkerMessage::Terminate).await;
        let grace = Duration::from_millis(self.config.terminate_grace_ms);

        if self.wait_for_terminal(&state, grace).await {
            self.finish_terminate(&state);
            return Ok(());
        }
        transport.signal_term().await;
        if self.wait_for_terminal(&state, grace).await {
            self.finish_terminate(&state);
            return Ok(());
        }
        transport.kill().await;
        self.wait_for_terminal(&state, grace).await;
        self.finish_terminate(&state);
        Ok(())
    }

    fn finish_terminate(&self, state: &Arc<WorkerState>) {
        self.audit.append(
            AuditEntry::new("worker.terminate", AuditOutcome::Success)
                .resource("agent", &state.agent.id),
        );
        metrics::gauge!("aegis_active_workers", self.active_count() as f64);
    }

    async fn wait_for_terminal(&self, state: &Arc<WorkerState>, deadline: Duration) -> bool {
        let mut rx = state.state_tx.subscribe();
        tokio::time::timeout(deadline, async {
            loop {
                let current = *rx.borrow_and_update();
                if current == AgentState::Terminated || current == AgentState::Error {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Graceful-shutdown path: terminate every worker concurrently.
    pub async fn shutdown_all(self: &Arc<Self>) {
        self.shutdown.cancel();
        let ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        let mut joins = Vec::new();
        for id in ids {
            let supervisor = Arc::clone(self);
            joins.push(tokio::spawn(async move {
                let _ = supervisor.terminate(&id).await;
            }));
        }
        for join in joins {
            let _ = join.await;
        }
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn agent_state(&self, agent_id: &str) -> Option<AgentState> {
        self.workers.lock().get(agent_id).map(|s| s.state())
    }

    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.workers.lock().get(agent_id).map(|s| {
            let mut agent = s.agent.clone();
            agent.state = s.state();
            agent
        })
    }

    pub fn tools(&self, agent_id: &str) -> Vec<ToolSpec> {
        self.workers
            .lock()
            .get(agent_id)
            .map(|s| s.tools.lock().clone())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<WorkerView> {
        self.workers
            .lock()
            .values()
            .map(|s| WorkerView {
                agent_id: s.agent.id.clone(),
                state: s.state(),
                restart_attempts: s.restart_attempts.load(Ordering::Acquire),
                pending_tasks: s.pending.lock().len(),
                pid: s.transport.read().as_ref().and_then(|t| t.pid()),
            })
            .collect()
    }

    /// Workers whose process is currently live.
    pub fn active_count(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|s| s.transport.read().is_some())
            .count()
    }

    // ── State transitions ──────────────────────────────────────────

    fn set_state(&self, state: &Arc<WorkerState>, next: AgentState) {
        let current = state.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                agent_id = %state.agent.id,
                from = current.as_str(),
                to = next.as_str(),
                "ignoring illegal state transition"
            );
            return;
        }
        state.state_tx.send_replace(next);
        let _ = self.events.send(AgentStateChange {
            agent_id: state.agent.id.clone(),
            state: next,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_audit::MemoryAuditStore;
    use aegis_domain::agent::TrustLevel;
    use aegis_domain::config::AuditConfig;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn make_agent(id: &str) -> Agent {
        Agent {
            id: id.into(),
            name: id.into(),
            state: AgentState::Idle,
            trust_level: TrustLevel::SemiAutonomous,
            permissions: vec![],
            permission_grants: vec![],
            limits: Default::default(),
            node_id: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Write an executable fake-worker script and return its path.
    fn fake_worker(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("fake-worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn make_supervisor(worker: std::path::PathBuf, max_restarts: u32) -> Arc<WorkerSupervisor> {
        let audit = AuditLog::new(AuditConfig::default(), Arc::new(MemoryAuditStore::new()));
        WorkerSupervisor::new(
            SupervisorConfig {
                worker_binary: worker,
                max_restarts,
                restart_backoff_base_ms: 10,
                heartbeat_interval_ms: 50,
                heartbeat_timeout_ms: 5_000,
                task_timeout_ms: 2_000,
                terminate_grace_ms: 300,
                ..Default::default()
            },
            audit,
        )
    }

    const READY_THEN_RESULT: &str = r#"
read _init
echo '{"type":"ready","agent_id":"calc","tools":[{"id":"builtin:calculate","description":"math"}]}'
read _task
echo '{"type":"result","task_id":"t1","status":"ok","result":{"result":8}}'
sleep 30
"#;

    #[tokio::test]
    async fn spawn_dispatch_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_worker(&dir, READY_THEN_RESULT);
        let supervisor = make_supervisor(script, 0);

        let tools = supervisor.spawn(make_agent("calc")).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "builtin:calculate");
        assert_eq!(supervisor.agent_state("calc"), Some(AgentState::Ready));

        let result = supervisor
            .dispatch_with_id("calc", "t1", serde_json::json!({"type":"invoke_tool"}), None)
            .await
            .unwrap();
        assert_eq!(result["result"], 8);

        supervisor.terminate("calc").await.unwrap();
        assert_eq!(supervisor.agent_state("calc"), Some(AgentState::Terminated));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn one_worker_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_worker(&dir, READY_THEN_RESULT);
        let supervisor = make_supervisor(script, 0);

        supervisor.spawn(make_agent("calc")).await.unwrap();
        let err = supervisor.spawn(make_agent("calc")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        supervisor.terminate("calc").await.unwrap();
        // Terminated ids are never reused.
        let err = supervisor.spawn(make_agent("calc")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn task_timeout_rejects_entry_but_keeps_worker() {
        let dir = tempfile::tempdir().unwrap();
        // Never answers tasks.
        let script = fake_worker(
            &dir,
            r#"
read _init
echo '{"type":"ready","agent_id":"slow"}'
sleep 30
"#,
        );
        let supervisor = make_supervisor(script, 0);
        supervisor.spawn(make_agent("slow")).await.unwrap();

        let err = supervisor
            .dispatch("slow", serde_json::json!({}), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // Worker still alive, no pending leak.
        assert_eq!(supervisor.active_count(), 1);
        assert_eq!(supervisor.list()[0].pending_tasks, 0);

        supervisor.terminate("slow").await.unwrap();
    }

    #[tokio::test]
    async fn crash_restarts_until_budget_then_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_worker(&dir, "exit 1");
        let supervisor = make_supervisor(script, 2);
        let mut events = supervisor.subscribe();

        let err = supervisor.spawn(make_agent("crashy")).await;
        assert!(err.is_err());

        // Drain events until the error state lands.
        let saw_error = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(change) if change.state == AgentState::Error => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_error, "agent should end in error after restart budget");

        let view = &supervisor.list()[0];
        assert_eq!(view.state, AgentState::Error);
        assert_eq!(view.restart_attempts, 3); // initial + 2 restarts
    }

    #[tokio::test]
    async fn worker_exit_rejects_pending_tasks() {
        let dir = tempfile::tempdir().unwrap();
        // Ready, then dies shortly after receiving a task.
        let script = fake_worker(
            &dir,
            r#"
read _init
echo '{"type":"ready","agent_id":"dier"}'
read _task
exit 1
"#,
        );
        let supervisor = make_supervisor(script, 0);
        supervisor.spawn(make_agent("dier")).await.unwrap();

        let err = supervisor
            .dispatch("dier", serde_json::json!({}), Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        match err {
            Error::Worker { message, .. } => assert!(message.contains("exited")),
            other => panic!("expected Worker error, got {other}"),
        }
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(backoff_for(1_000, 1), Duration::from_secs(1));
        assert_eq!(backoff_for(1_000, 2), Duration::from_secs(2));
        assert_eq!(backoff_for(1_000, 3), Duration::from_secs(4));
        assert_eq!(backoff_for(1_000, 4), Duration::from_secs(8));
        // Capped at 30s.
        assert_eq!(backoff_for(1_000, 10), Duration::from_secs(30));
    }
}
