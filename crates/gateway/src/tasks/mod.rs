//! The task router: validates typed tasks, enforces approval and
//! capability rules, and dispatches to the LLM router, the worker
//! supervisor, or the memory collaborator.

mod types;

pub use types::{AgentTask, Approval};

use std::sync::Arc;

use aegis_audit::{AuditEntry, AuditLog, AuditOutcome};
use aegis_capability::{CapabilityManager, GrantRequest, Permission};
use aegis_domain::agent::{Agent, AgentState};
use aegis_domain::manifest::AgentManifest;
use aegis_domain::{Error, Result};
use aegis_policy::{Decision, FileOp, PolicyEngine, PolicyRequest};
use aegis_protocol::{ClientFrame, FrameType, SpawnPayload, TaskPayload};
use aegis_providers::{ChatMessage, ChatRequest, LlmRouter};
use aegis_supervisor::{InternalTaskRouter, WorkerSupervisor};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::api::auth::TokenGuard;
use crate::cluster::ClusterCoordinator;
use crate::degradation::{DegradationLevel, DegradationManager};
use crate::memory::MemoryRecall;
use crate::sessions::ClientConnection;
use crate::storage::{AgentRecord, AgentStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the session layer should send back for a handled task.
#[derive(Debug, Clone)]
pub struct TaskReply {
    pub frame_type: FrameType,
    pub payload: serde_json::Value,
}

impl TaskReply {
    fn result(payload: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::Result,
            payload,
        }
    }
}

pub struct TaskRouter {
    policy: Arc<PolicyEngine>,
    capabilities: Arc<CapabilityManager>,
    audit: Arc<AuditLog>,
    supervisor: Arc<WorkerSupervisor>,
    llm: Arc<LlmRouter>,
    memory: Arc<dyn MemoryRecall>,
    degradation: Arc<DegradationManager>,
    cluster: Option<Arc<ClusterCoordinator>>,
    agents: Arc<dyn AgentStore>,
    internal_guard: Option<Arc<TokenGuard>>,
    /// HMAC secret for manifest signatures (PERMISSION_SECRET).
    manifest_secret: Option<Vec<u8>>,
    node_id: String,
    capability_ttl_ms: u64,
}

impl TaskRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Arc<PolicyEngine>,
        capabilities: Arc<CapabilityManager>,
        audit: Arc<AuditLog>,
        supervisor: Arc<WorkerSupervisor>,
        llm: Arc<LlmRouter>,
        memory: Arc<dyn MemoryRecall>,
        degradation: Arc<DegradationManager>,
        cluster: Option<Arc<ClusterCoordinator>>,
        agents: Arc<dyn AgentStore>,
        internal_guard: Option<Arc<TokenGuard>>,
        manifest_secret: Option<Vec<u8>>,
        node_id: String,
        capability_ttl_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy,
            capabilities,
            audit,
            supervisor,
            llm,
            memory,
            degradation,
            cluster,
            agents,
            internal_guard,
            manifest_secret,
            node_id,
            capability_ttl_ms,
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Spawn / terminate
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn spawn_agent(&self, payload: SpawnPayload) -> Result<TaskReply> {
        if self.degradation.level() == DegradationLevel::Emergency {
            return Err(Error::RateLimited(
                "server is shedding load, agent spawns are refused".into(),
            ));
        }

        let manifest = self.load_manifest(payload)?;
        if manifest.signature.is_some() {
            let secret = self.manifest_secret.as_deref().ok_or_else(|| {
                Error::PermissionDenied("no manifest verification key configured".into())
            })?;
            manifest.verify_signature(secret)?;
        }

        // An agent id is reserved forever, deleted or not.
        if self.agents.get(&manifest.id).await?.is_some() {
            return Err(Error::Validation(format!(
                "agent id '{}' is already taken",
                manifest.id
            )));
        }

        let agent = Agent {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            state: AgentState::Idle,
            trust_level: manifest.trust_level.unwrap_or_default(),
            permissions: manifest.permissions.clone(),
            permission_grants: manifest.permission_grants.clone(),
            limits: manifest.limits.clone(),
            node_id: Some(self.node_id.clone()),
            created_at: Utc::now(),
        };
        self.agents
            .upsert(AgentRecord {
                id: agent.id.clone(),
                name: agent.name.clone(),
                state: agent.state,
                node_id: agent.node_id.clone(),
                metadata: serde_json::to_value(&manifest)?,
                total_input_tokens: 0,
                total_output_tokens: 0,
                created_at: agent.created_at,
                deleted_at: None,
            })
            .await?;

        // Materialize manifest permissions as capability tokens so the
        // capability layer, not just the grant list, backs later checks.
        let permissions = permissions_from_strings(&manifest.permissions);
        if !permissions.is_empty() {
            self.capabilities.grant(
                GrantRequest {
                    agent_id: agent.id.clone(),
                    permissions,
                    duration_ms: Some(self.capability_ttl_ms),
                    purpose: Some("manifest".into()),
                    delegatable: false,
                },
                "gateway",
            )?;
        }

        let tools = self.supervisor.spawn(agent.clone()).await?;
        self.audit.append(
            AuditEntry::new("agent.spawn", AuditOutcome::Success)
                .resource("agent", &agent.id)
                .details(serde_json::json!({ "trust_level": agent.trust_level })),
        );

        Ok(TaskReply::result(serde_json::json!({
            "agentId": agent.id,
            "state": "ready",
            "tools": tools,
        })))
    }

    pub async fn terminate_agent(&self, agent_id: &str) -> Result<TaskReply> {
        self.supervisor.terminate(agent_id).await?;
        self.agents.set_state(agent_id, AgentState::Terminated).await?;
        self.agents.mark_deleted(agent_id).await?;
        let revoked = self.capabilities.revoke_all(agent_id);
        self.audit.append(
            AuditEntry::new("agent.terminate", AuditOutcome::Success)
                .resource("agent", agent_id)
                .details(serde_json::json!({ "revoked_tokens": revoked })),
        );
        Ok(TaskReply::result(serde_json::json!({
            "agentId": agent_id,
            "state": "terminated",
        })))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Task dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle an `agent.task` frame from a client connection.
    pub async fn handle_task(
        &self,
        payload: TaskPayload,
        client: Option<&Arc<ClientConnection>>,
        frame_id: Option<String>,
    ) -> Result<TaskReply> {
        if payload.internal {
            let guard = self
                .internal_guard
                .as_ref()
                .ok_or_else(|| Error::Auth("internal channel is not configured".into()))?;
            let token = payload.internal_token.as_deref().unwrap_or("");
            if !guard.verify(token) {
                return Err(Error::Auth("invalid internal token".into()));
            }
        }

        // Cross-node: hand the whole frame to the owning node.
        if let Some(record) = self.agents.get(&payload.agent_id).await? {
            if let (Some(owner), Some(cluster)) = (&record.node_id, &self.cluster) {
                if owner != &self.node_id {
                    let frame = ClientFrame::new(FrameType::AgentTask)
                        .with_id(frame_id.clone().unwrap_or_default())
                        .with_payload(serde_json::to_value(&payload)?);
                    let response = cluster.forward(owner, frame).await?;
                    return Ok(TaskReply {
                        frame_type: response.frame_type,
                        payload: response.payload.unwrap_or(serde_json::Value::Null),
                    });
                }
            }
        }

        let task: AgentTask = serde_json::from_value(payload.task.clone())
            .map_err(|e| Error::Validation(format!("task: {e}")))?;

        match task {
            AgentTask::Chat {
                message,
                model,
                stream,
            } => {
                self.chat(Some(&payload.agent_id), message, model, stream, client, frame_id)
                    .await
            }
            AgentTask::InvokeTool {
                tool_id,
                arguments,
                approval,
            } => {
                self.invoke_tool(&payload.agent_id, &tool_id, arguments, approval, payload.task)
                    .await
            }
            AgentTask::SearchMemory { query, limit } => {
                let hits = self
                    .memory
                    .search(&payload.agent_id, &query, limit.unwrap_or(10))
                    .await?;
                Ok(TaskReply::result(serde_json::json!({ "results": hits })))
            }
            AgentTask::StoreFact { fact } => {
                self.memory.store_fact(&payload.agent_id, &fact).await?;
                Ok(TaskReply::result(serde_json::json!({ "stored": true })))
            }
            AgentTask::RecordEpisode { episode } => {
                self.memory.record_episode(&payload.agent_id, episode).await?;
                Ok(TaskReply::result(serde_json::json!({ "stored": true })))
            }
            AgentTask::LearnProcedure { name, steps } => {
                self.memory
                    .learn_procedure(&payload.agent_id, &name, steps)
                    .await?;
                Ok(TaskReply::result(serde_json::json!({ "stored": true })))
            }
            AgentTask::ListTools => self.list_tools(&payload.agent_id),
        }
    }

    // ── Chat ───────────────────────────────────────────────────────

    /// Route a chat request, optionally attributed to an agent, and
    /// optionally streamed back to the client as `chat_stream` frames.
    pub async fn chat(
        &self,
        agent_id: Option<&str>,
        message: String,
        model: Option<String>,
        stream: bool,
        client: Option<&Arc<ClientConnection>>,
        frame_id: Option<String>,
    ) -> Result<TaskReply> {
        let mut request = ChatRequest {
            model: model.unwrap_or_else(|| "claude".into()),
            messages: vec![ChatMessage::user(message)],
            stream,
            agent_id: agent_id.map(String::from),
            ..Default::default()
        };

        if let Some(agent_id) = agent_id {
            if let Some(agent) = self.supervisor.agent(agent_id) {
                request.max_tokens = agent.limits.max_tokens_per_request;
            }
        }

        if stream {
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
            let forward = client.cloned().zip(Some(frame_id.clone())).map(|(client, id)| {
                tokio::spawn(async move {
                    while let Some(text) = chunk_rx.recv().await {
                        let mut frame = ClientFrame::new(FrameType::ChatStream)
                            .with_payload(serde_json::json!({ "delta": text }));
                        frame.id = id.clone();
                        if !client.send(frame) {
                            break;
                        }
                    }
                })
            });

            let (result, meta) = self.llm.route_stream(&request, Some(chunk_tx)).await?;
            if let Some(handle) = forward {
                let _ = handle.await;
            }
            self.record_agent_usage(agent_id, result.usage.as_ref().map(|u| (u.input_tokens, u.output_tokens)))
                .await;
            return Ok(TaskReply {
                frame_type: FrameType::ChatStreamEnd,
                payload: serde_json::json!({
                    "content": result.content,
                    "model": result.model,
                    "usage": result.usage,
                    "chunkCount": result.chunk_count,
                    "timeToFirstChunkMs": result.time_to_first_chunk_ms,
                    "totalDurationMs": result.total_duration_ms,
                    "meta": meta,
                }),
            });
        }

        let (response, meta) = self.llm.route(&request).await?;
        self.record_agent_usage(
            agent_id,
            response.usage.as_ref().map(|u| (u.input_tokens, u.output_tokens)),
        )
        .await;
        Ok(TaskReply::result(serde_json::json!({
            "content": response.content,
            "model": response.model,
            "usage": response.usage,
            "meta": meta,
        })))
    }

    async fn record_agent_usage(&self, agent_id: Option<&str>, usage: Option<(u32, u32)>) {
        let (Some(agent_id), Some((input, output))) = (agent_id, usage) else {
            return;
        };
        if let Err(e) = self
            .agents
            .add_usage(agent_id, input as i64, output as i64)
            .await
        {
            tracing::warn!(agent_id = %agent_id, error = %e, "failed to record usage");
        }
    }

    // ── Tool invocation ────────────────────────────────────────────

    async fn invoke_tool(
        &self,
        agent_id: &str,
        tool_id: &str,
        arguments: serde_json::Value,
        approval: Option<Approval>,
        raw_task: serde_json::Value,
    ) -> Result<TaskReply> {
        let agent = self
            .supervisor
            .agent(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}'")))?;

        // 1. Policy.
        let mut approval_required = agent.trust_level.always_requires_approval();
        if let Some(request) = tool_policy_request(tool_id, &arguments) {
            let evaluation = self.policy.evaluate(&request, Some(agent_id));
            match evaluation.decision {
                Decision::Block => {
                    metrics::counter!("aegis_tool_calls_blocked_total", 1);
                    let reason = evaluation
                        .reason
                        .unwrap_or_else(|| format!("blocked by policy rule '{}'", evaluation.rule_id));
                    return Err(Error::PermissionDenied(reason));
                }
                Decision::Approve => approval_required = true,
                Decision::Allow => {}
            }
        }

        // 2. Approval (trust level, tool flag, or policy decision).
        if !approval_required {
            approval_required = self
                .supervisor
                .tools(agent_id)
                .iter()
                .any(|t| t.id == tool_id && t.requires_confirmation);
        }
        if approval_required {
            match &approval {
                Some(approval) if !approval.approved_by.trim().is_empty() => {
                    self.audit.append(
                        AuditEntry::new("task.approved", AuditOutcome::Success)
                            .resource("tool", tool_id)
                            .actor(agent_id)
                            .details(serde_json::json!({
                                "approved_by": approval.approved_by,
                                "reason": approval.reason,
                            })),
                    );
                }
                _ => {
                    self.audit.append(
                        AuditEntry::new("task.approval_missing", AuditOutcome::Denied)
                            .resource("tool", tool_id)
                            .actor(agent_id),
                    );
                    return Err(Error::PermissionDenied("approval required".into()));
                }
            }
        }

        // 3. Capability: explicit grants first, live tokens second.
        let (category, action, resource) = tool_capability(tool_id, &arguments);
        let granted = agent.has_permission(&category, &action)
            || self
                .capabilities
                .check(agent_id, &category, &action, resource.as_deref())
                .is_some();
        if !granted {
            self.audit.append(
                AuditEntry::new("task.capability_missing", AuditOutcome::Denied)
                    .resource("tool", tool_id)
                    .actor(agent_id)
                    .details(serde_json::json!({ "category": category, "action": action })),
            );
            return Err(Error::PermissionDenied(format!(
                "agent lacks {category}.{action}"
            )));
        }

        // 4. Dispatch to the worker.
        let result = self.supervisor.dispatch(agent_id, raw_task, None).await?;
        Ok(TaskReply::result(serde_json::json!({ "content": result })))
    }

    fn list_tools(&self, agent_id: &str) -> Result<TaskReply> {
        let agent = self
            .supervisor
            .agent(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent '{agent_id}'")))?;
        let tools: Vec<_> = self
            .supervisor
            .tools(agent_id)
            .into_iter()
            .filter(|_| agent.has_permission("tools", "execute"))
            .collect();
        Ok(TaskReply::result(serde_json::json!({ "tools": tools })))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn load_manifest(&self, payload: SpawnPayload) -> Result<AgentManifest> {
        match (payload.manifest, payload.manifest_path) {
            (Some(value), _) => AgentManifest::parse(&value.to_string()),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Validation(format!("manifest path {path}: {e}")))?;
                AgentManifest::parse(&raw)
            }
            (None, None) => Err(Error::Validation(
                "spawn needs a manifest or manifestPath".into(),
            )),
        }
    }
}

/// Workers re-enter the router over IPC; the transport itself is the
/// authentication, so the internal-token check is skipped.
#[async_trait::async_trait]
impl InternalTaskRouter for TaskRouter {
    async fn route_internal(
        &self,
        agent_id: &str,
        task: serde_json::Value,
    ) -> Result<serde_json::Value> {
        // A worker may address another agent; default to itself.
        let target = task["agentId"]
            .as_str()
            .unwrap_or(agent_id)
            .to_string();
        let reply = self
            .handle_task(
                TaskPayload {
                    agent_id: target,
                    task,
                    internal: false,
                    internal_token: None,
                },
                None,
                None,
            )
            .await?;
        Ok(reply.payload)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool → policy/capability mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which policy surface a tool call touches, if any.
fn tool_policy_request(tool_id: &str, args: &serde_json::Value) -> Option<PolicyRequest> {
    let path = || args["path"].as_str().unwrap_or_default().to_string();
    match tool_id {
        "builtin:file_read" => Some(PolicyRequest::File {
            path: path(),
            op: FileOp::Read,
        }),
        "builtin:file_write" => Some(PolicyRequest::File {
            path: path(),
            op: FileOp::Write,
        }),
        "builtin:file_delete" => Some(PolicyRequest::File {
            path: path(),
            op: FileOp::Delete,
        }),
        "builtin:file_list" => Some(PolicyRequest::File {
            path: path(),
            op: FileOp::List,
        }),
        "builtin:shell" => Some(PolicyRequest::Shell {
            command: args["command"].as_str().unwrap_or_default().to_string(),
            args: args["args"].as_array().map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            }),
        }),
        "builtin:http_fetch" => Some(PolicyRequest::Network {
            host: args["host"].as_str().unwrap_or_default().to_string(),
            port: args["port"].as_u64().map(|p| p as u16),
            protocol: args["protocol"].as_str().map(String::from),
        }),
        "builtin:secret_get" => Some(PolicyRequest::Secret {
            name: args["name"].as_str().unwrap_or_default().to_string(),
        }),
        _ => None,
    }
}

/// Capability (category, action, resource) a tool call consumes.
fn tool_capability(
    tool_id: &str,
    args: &serde_json::Value,
) -> (String, String, Option<String>) {
    let path = args["path"].as_str().map(String::from);
    match tool_id {
        "builtin:file_read" | "builtin:file_list" => ("filesystem".into(), "read".into(), path),
        "builtin:file_write" => ("filesystem".into(), "write".into(), path),
        "builtin:file_delete" => ("filesystem".into(), "delete".into(), path),
        "builtin:shell" => (
            "shell".into(),
            "execute".into(),
            args["command"].as_str().map(String::from),
        ),
        "builtin:http_fetch" => (
            "network".into(),
            "connect".into(),
            args["host"].as_str().map(String::from),
        ),
        "builtin:secret_get" => (
            "secrets".into(),
            "read".into(),
            args["name"].as_str().map(String::from),
        ),
        other => ("tools".into(), "execute".into(), Some(other.to_string())),
    }
}

/// Parse declared permission strings (`"filesystem.read:/tmp"`) into
/// capability permissions.
fn permissions_from_strings(raw: &[String]) -> Vec<Permission> {
    let mut permissions = Vec::new();
    for entry in raw {
        let (base, resource) = match entry.split_once(':') {
            Some((base, resource)) => (base, Some(resource.to_string())),
            None => (entry.as_str(), None),
        };
        let (category, action) = match base.split_once('.') {
            Some((category, action)) => (category, action),
            None => (base, "*"),
        };
        if category.is_empty() {
            continue;
        }
        let mut permission = Permission::new(category, vec![action.to_string()]);
        if let Some(resource) = resource {
            permission = permission.with_resource(resource);
        }
        permissions.push(permission);
    }
    permissions
}
