//! End-to-end tests over the real WebSocket protocol: an in-process
//! server with in-memory stores, mock LLM providers, and a scripted
//! worker process.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use aegis_audit::{AuditLog, AuditOutcome, AuditQuery, MemoryAuditStore};
use aegis_capability::CapabilityManager;
use aegis_domain::config::Config;
use aegis_policy::PolicyEngine;
use aegis_protocol::{ClientFrame, FrameType};
use aegis_providers::mock::{replying, MockProvider};
use aegis_providers::{LlmProvider, LlmRouter, ProviderRegistry};
use aegis_reliability::{BreakerConfig, BreakerRegistry, RateLimiter, TokenTracker};
use aegis_supervisor::WorkerSupervisor;

use aegis_gateway::api;
use aegis_gateway::api::auth::TokenGuard;
use aegis_gateway::cluster::{ClusterCoordinator, MemoryNodeDirectory};
use aegis_gateway::degradation::DegradationManager;
use aegis_gateway::memory::InMemoryRecall;
use aegis_gateway::scheduler::{LocalJobLock, Scheduler};
use aegis_gateway::sessions::ClientRegistry;
use aegis_gateway::state::AppState;
use aegis_gateway::storage::MemoryAgentStore;
use aegis_gateway::tasks::TaskRouter;

const MODEL: &str = "claude-sonnet-4-5-20250929";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A worker stand-in that answers any task with `{"result": 8}` and
/// honors `terminate`.
fn fake_worker(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("fake-worker.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(
        file,
        r#"#!/bin/sh
read _init
aid=$(printf '%s' "$_init" | sed -n 's/.*"agent_id":"\([^"]*\)".*/\1/p')
printf '{{"type":"ready","agent_id":"%s","tools":[{{"id":"builtin:calculate","description":"math"}}]}}\n' "$aid"
while read line; do
  case "$line" in
    *'"terminate"'*) exit 0 ;;
  esac
  tid=$(printf '%s' "$line" | sed -n 's/.*"task_id":"\([^"]*\)".*/\1/p')
  if [ -n "$tid" ]; then
    printf '{{"type":"result","task_id":"%s","status":"ok","result":{{"result":8}}}}\n' "$tid"
  fi
done
"#
    )
    .unwrap();
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    static HANDLE: std::sync::OnceLock<metrics_exporter_prometheus::PrometheusHandle> =
        std::sync::OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder")
        })
        .clone()
}

struct Harness {
    state: AppState,
    addr: std::net::SocketAddr,
    _dir: tempfile::TempDir,
}

async fn start_gateway(providers: Vec<(Arc<dyn LlmProvider>, u32)>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let worker = fake_worker(&dir);

    let mut config = Config::default();
    config.supervisor.worker_binary = worker;
    config.supervisor.heartbeat_timeout_ms = 60_000;
    config.supervisor.terminate_grace_ms = 500;
    config.llm.max_retries = 0;
    config.llm.aliases.insert("claude".into(), MODEL.into());
    let config = Arc::new(config);

    let audit = AuditLog::new(config.audit.clone(), Arc::new(MemoryAuditStore::new()));
    let policy = Arc::new(
        aegis_policy::template("balanced", audit.clone())
            .unwrap()
            .with_allowlists(&config.security),
    );
    let capabilities = Arc::new(CapabilityManager::new(
        b"0123456789abcdef0123456789abcdef".to_vec(),
        3_600_000,
        audit.clone(),
    ));

    let registry = Arc::new(ProviderRegistry::from_providers(providers));
    registry.set_alias("claude", MODEL);
    let llm = Arc::new(LlmRouter::new(
        registry,
        config.llm.clone(),
        Arc::new(BreakerRegistry::new(BreakerConfig::default())),
        Arc::new(RateLimiter::new()),
        Arc::new(TokenTracker::new(config.llm.budget.clone())),
    ));

    let supervisor = WorkerSupervisor::new(config.supervisor.clone(), audit.clone());
    let agents = Arc::new(MemoryAgentStore::new());
    let degradation = DegradationManager::new(config.degradation.clone());
    let cluster = ClusterCoordinator::new(
        config.cluster.clone(),
        None,
        Arc::new(MemoryNodeDirectory::new()),
        None,
    );
    let clients = ClientRegistry::new(config.server.max_sessions);
    let scheduler = Scheduler::new(Arc::new(LocalJobLock::new()), Arc::new(|| true));

    let tasks = TaskRouter::new(
        policy.clone(),
        capabilities.clone(),
        audit.clone(),
        supervisor.clone(),
        llm.clone(),
        Arc::new(InMemoryRecall::new()),
        degradation.clone(),
        Some(cluster.clone()),
        agents.clone(),
        None,
        Some(b"0123456789abcdef0123456789abcdef".to_vec()),
        config.cluster.node_id.clone(),
        3_600_000,
    );
    supervisor.set_internal_router(tasks.clone());

    let state = AppState {
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
        cluster: Some(cluster),
        leader: None,
        pool: None,
        auth_guard: Some(Arc::new(TokenGuard::new(&"a".repeat(32)))),
        internal_guard: None,
        metrics: metrics_handle(),
        started_at: Instant::now(),
        shutdown: tokio_util::sync::CancellationToken::new(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = api::gateway_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Harness {
        state,
        addr,
        _dir: dir,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: std::net::SocketAddr) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut WsClient, frame: ClientFrame) {
    let json = serde_json::to_string(&frame).unwrap();
    socket.send(Message::Text(json.into())).await.unwrap();
}

/// Receive frames until one matches `pred` (skipping broadcasts etc.).
async fn recv_until<F>(socket: &mut WsClient, pred: F) -> ClientFrame
where
    F: Fn(&ClientFrame) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                        if pred(&frame) {
                            return frame;
                        }
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn authenticate(socket: &mut WsClient, token: &str) -> ClientFrame {
    recv_until(socket, |f| f.frame_type == FrameType::AuthRequired).await;
    send(
        socket,
        ClientFrame::new(FrameType::Auth)
            .with_payload(serde_json::json!({ "token": token })),
    )
    .await;
    recv_until(socket, |f| {
        matches!(f.frame_type, FrameType::AuthSuccess | FrameType::AuthFailed)
    })
    .await
}

async fn spawn_agent(socket: &mut WsClient, manifest: serde_json::Value) -> ClientFrame {
    send(
        socket,
        ClientFrame::new(FrameType::AgentSpawn)
            .with_id("spawn-1")
            .with_payload(serde_json::json!({ "manifest": manifest })),
    )
    .await;
    recv_until(socket, |f| f.id.as_deref() == Some("spawn-1")).await
}

fn calc_manifest(id: &str, trust: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": "Calc",
        "permissions": ["tools.execute"],
        "trustLevel": trust,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn spawn_task_terminate() {
    let harness = start_gateway(vec![]).await;
    let mut socket = connect(harness.addr).await;

    let auth = authenticate(&mut socket, &"a".repeat(32)).await;
    assert_eq!(auth.frame_type, FrameType::AuthSuccess);

    let reply = spawn_agent(&mut socket, calc_manifest("calc", "semi-autonomous")).await;
    assert_eq!(reply.frame_type, FrameType::Result, "spawn reply: {reply:?}");
    let payload = reply.payload.unwrap();
    assert_eq!(payload["agentId"], "calc");
    assert_eq!(payload["state"], "ready");

    // Task round-trip through the worker.
    send(
        &mut socket,
        ClientFrame::new(FrameType::AgentTask)
            .with_id("task-1")
            .with_payload(serde_json::json!({
                "agentId": "calc",
                "task": {
                    "type": "invoke_tool",
                    "toolId": "builtin:calculate",
                    "arguments": { "expression": "2+2*3" },
                },
            })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("task-1")).await;
    assert_eq!(reply.frame_type, FrameType::Result, "task reply: {reply:?}");
    assert_eq!(reply.payload.unwrap()["content"]["result"], 8);

    // Terminate; the worker must exit within the grace window.
    let started = Instant::now();
    send(
        &mut socket,
        ClientFrame::new(FrameType::AgentTerminate)
            .with_id("term-1")
            .with_payload(serde_json::json!({ "agentId": "calc" })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("term-1")).await;
    assert_eq!(reply.frame_type, FrameType::Result);
    assert_eq!(reply.payload.unwrap()["state"], "terminated");
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        harness.state.supervisor.agent_state("calc"),
        Some(aegis_domain::agent::AgentState::Terminated)
    );
}

#[tokio::test]
async fn supervised_trust_requires_approval() {
    let harness = start_gateway(vec![]).await;
    let mut socket = connect(harness.addr).await;
    authenticate(&mut socket, &"a".repeat(32)).await;

    let reply = spawn_agent(&mut socket, calc_manifest("super", "supervised")).await;
    assert_eq!(reply.frame_type, FrameType::Result);

    let task = serde_json::json!({
        "type": "invoke_tool",
        "toolId": "builtin:calculate",
        "arguments": { "expression": "1+1" },
    });

    // Without approval: PERMISSION_DENIED, approval required.
    send(
        &mut socket,
        ClientFrame::new(FrameType::AgentTask)
            .with_id("t1")
            .with_payload(serde_json::json!({ "agentId": "super", "task": task })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("t1")).await;
    assert_eq!(reply.frame_type, FrameType::Error);
    let payload = reply.payload.unwrap();
    assert_eq!(payload["code"], "PERMISSION_DENIED");
    assert!(payload["message"].as_str().unwrap().contains("approval required"));

    // Same call with approval succeeds.
    let mut approved = task;
    approved["approval"] = serde_json::json!({ "approvedBy": "admin" });
    send(
        &mut socket,
        ClientFrame::new(FrameType::AgentTask)
            .with_id("t2")
            .with_payload(serde_json::json!({ "agentId": "super", "task": approved })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("t2")).await;
    assert_eq!(reply.frame_type, FrameType::Result, "approved call: {reply:?}");
}

#[tokio::test]
async fn policy_blocks_credential_theft() {
    let harness = start_gateway(vec![]).await;
    let mut socket = connect(harness.addr).await;
    authenticate(&mut socket, &"a".repeat(32)).await;

    let manifest = serde_json::json!({
        "id": "reader",
        "name": "Reader",
        "permissions": ["tools.execute", "filesystem.read"],
        "trustLevel": "semi-autonomous",
    });
    let reply = spawn_agent(&mut socket, manifest).await;
    assert_eq!(reply.frame_type, FrameType::Result);

    send(
        &mut socket,
        ClientFrame::new(FrameType::AgentTask)
            .with_id("steal")
            .with_payload(serde_json::json!({
                "agentId": "reader",
                "task": {
                    "type": "invoke_tool",
                    "toolId": "builtin:file_read",
                    "arguments": { "path": "/home/u/.ssh/id_rsa" },
                },
            })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("steal")).await;
    assert_eq!(reply.frame_type, FrameType::Error);
    assert_eq!(reply.payload.unwrap()["code"], "PERMISSION_DENIED");

    // Audit carries the blocked outcome and the matched rule id.
    let entries = harness.state.audit.query(&AuditQuery {
        action: Some("policy.file".into()),
        outcome: Some(AuditOutcome::Blocked),
        ..Default::default()
    });
    assert!(!entries.is_empty());
    assert_eq!(entries[0].details["rule"], "ssh-keys");
}

#[tokio::test]
async fn auth_rate_limit_rejects_sixth_attempt() {
    let harness = start_gateway(vec![]).await;
    let mut socket = connect(harness.addr).await;
    recv_until(&mut socket, |f| f.frame_type == FrameType::AuthRequired).await;

    for _ in 0..5 {
        send(
            &mut socket,
            ClientFrame::new(FrameType::Auth)
                .with_payload(serde_json::json!({ "token": "wrong" })),
        )
        .await;
        let reply = recv_until(&mut socket, |f| f.frame_type == FrameType::AuthFailed).await;
        assert_eq!(reply.frame_type, FrameType::AuthFailed);
    }

    // Sixth attempt with the CORRECT token is still rejected.
    send(
        &mut socket,
        ClientFrame::new(FrameType::Auth)
            .with_payload(serde_json::json!({ "token": "a".repeat(32) })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| {
        matches!(f.frame_type, FrameType::AuthSuccess | FrameType::AuthFailed)
    })
    .await;
    assert_eq!(reply.frame_type, FrameType::AuthFailed);
    drop(harness);
}

#[tokio::test]
async fn chat_fails_over_to_second_provider() {
    let failing = Arc::new(MockProvider::always_failing("a", &[MODEL])) as Arc<dyn LlmProvider>;
    let working = replying("b", &[MODEL], "hello from b") as Arc<dyn LlmProvider>;
    let harness = start_gateway(vec![(failing, 1), (working, 2)]).await;

    let mut socket = connect(harness.addr).await;
    authenticate(&mut socket, &"a".repeat(32)).await;

    send(
        &mut socket,
        ClientFrame::new(FrameType::Chat)
            .with_id("chat-1")
            .with_payload(serde_json::json!({ "message": "hi", "model": "claude" })),
    )
    .await;
    let reply = recv_until(&mut socket, |f| f.id.as_deref() == Some("chat-1")).await;
    assert_eq!(reply.frame_type, FrameType::Result, "chat reply: {reply:?}");
    let payload = reply.payload.unwrap();
    assert_eq!(payload["content"], "hello from b");
    assert_eq!(payload["meta"]["failoverCount"], 1);
    assert_eq!(payload["meta"]["providerId"], "b");
}

#[tokio::test]
async fn chat_streams_chunks_then_end() {
    let provider = replying("s", &[MODEL], "alpha beta gamma") as Arc<dyn LlmProvider>;
    let harness = start_gateway(vec![(provider, 1)]).await;

    let mut socket = connect(harness.addr).await;
    authenticate(&mut socket, &"a".repeat(32)).await;

    send(
        &mut socket,
        ClientFrame::new(FrameType::Chat)
            .with_id("stream-1")
            .with_payload(serde_json::json!({
                "message": "hi",
                "model": MODEL,
                "stream": true,
            })),
    )
    .await;

    let mut chunks = String::new();
    let end = loop {
        let frame = recv_until(&mut socket, |f| {
            matches!(f.frame_type, FrameType::ChatStream | FrameType::ChatStreamEnd)
        })
        .await;
        match frame.frame_type {
            FrameType::ChatStream => {
                chunks.push_str(
                    frame.payload.as_ref().unwrap()["delta"].as_str().unwrap(),
                );
            }
            FrameType::ChatStreamEnd => break frame,
            _ => unreachable!(),
        }
    };
    assert_eq!(chunks, "alpha beta gamma");
    let payload = end.payload.unwrap();
    assert_eq!(payload["content"], "alpha beta gamma");
    assert!(payload["chunkCount"].as_u64().unwrap() >= 3);
    drop(harness);
}

#[tokio::test]
async fn unauthenticated_frames_close_the_socket() {
    let harness = start_gateway(vec![]).await;
    let mut socket = connect(harness.addr).await;
    recv_until(&mut socket, |f| f.frame_type == FrameType::AuthRequired).await;

    send(
        &mut socket,
        ClientFrame::new(FrameType::Chat)
            .with_payload(serde_json::json!({ "message": "hi" })),
    )
    .await;

    // Server replies with AUTH_ERROR and then closes.
    let saw_close = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(_)) => return true,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(saw_close);
    drop(harness);
}
