//! Worker process transport: newline-delimited JSON over stdin/stdout,
//! stderr routed to the logger.
//!
//! The child process is owned by a manager task; the transport handle
//! only sends control commands to it, so writes, kills, and the exit
//! watcher never contend for the `Child`.

use std::process::Stdio;

use aegis_domain::{Error, Result};
use aegis_protocol::{WorkerMessage, MAX_IPC_FRAME_BYTES};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

enum Control {
    /// Graceful stop signal (SIGTERM on unix).
    Term,
    /// Hard kill.
    Kill,
}

/// A spawned worker: the send/kill handle plus the inbound message
/// stream and the exit notification.
pub struct SpawnedWorker {
    pub transport: std::sync::Arc<StdioTransport>,
    pub messages: mpsc::Receiver<WorkerMessage>,
    pub exit: oneshot::Receiver<WorkerExit>,
}

/// Send/kill handle for a worker child process.
pub struct StdioTransport {
    agent_id: String,
    stdin: Mutex<ChildStdin>,
    control: mpsc::Sender<Control>,
    pid: Option<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn `command` with piped stdio and wire up the NDJSON protocol.
pub fn spawn_worker(agent_id: &str, mut command: Command) -> Result<SpawnedWorker> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::Worker {
            agent_id: agent_id.to_string(),
            message: format!("spawn failed: {e}"),
        })?;

    let stdin = child.stdin.take().ok_or_else(|| Error::Worker {
        agent_id: agent_id.to_string(),
        message: "child stdin unavailable".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| Error::Worker {
        agent_id: agent_id.to_string(),
        message: "child stdout unavailable".into(),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| Error::Worker {
        agent_id: agent_id.to_string(),
        message: "child stderr unavailable".into(),
    })?;

    let pid = child.id();
    let (msg_tx, msg_rx) = mpsc::channel::<WorkerMessage>(64);
    let (exit_tx, exit_rx) = oneshot::channel::<WorkerExit>();
    let (control_tx, control_rx) = mpsc::channel::<Control>(4);

    // Reader: NDJSON frames from the worker's stdout.
    let reader_agent = agent_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line.len() > MAX_IPC_FRAME_BYTES {
                        tracing::warn!(agent_id = %reader_agent, bytes = line.len(), "oversized IPC frame dropped");
                        continue;
                    }
                    match serde_json::from_str::<WorkerMessage>(line) {
                        Ok(msg) => {
                            if msg_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(agent_id = %reader_agent, error = %e, "unparseable worker frame");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(agent_id = %reader_agent, error = %e, "worker stdout read error");
                    break;
                }
            }
        }
    });

    // Stderr lines go to the gateway logger at warn.
    let stderr_agent = agent_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(agent_id = %stderr_agent, "worker stderr: {line}");
        }
    });

    // Manager: owns the child; serializes wait vs. kill.
    let manager_agent = agent_id.to_string();
    tokio::spawn(async move {
        let exit = child_manager(child, control_rx, &manager_agent).await;
        let _ = exit_tx.send(exit);
    });

    Ok(SpawnedWorker {
        transport: std::sync::Arc::new(StdioTransport {
            agent_id: agent_id.to_string(),
            stdin: Mutex::new(stdin),
            control: control_tx,
            pid,
        }),
        messages: msg_rx,
        exit: exit_rx,
    })
}

async fn child_manager(
    mut child: Child,
    mut control: mpsc::Receiver<Control>,
    agent_id: &str,
) -> WorkerExit {
    loop {
        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                tracing::info!(agent_id = %agent_id, ?code, "worker exited");
                return WorkerExit { code };
            }
            cmd = control.recv() => match cmd {
                Some(Control::Term) => {
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGTERM,
                        );
                    }
                    #[cfg(not(unix))]
                    let _ = child.start_kill();
                }
                Some(Control::Kill) | None => {
                    let _ = child.start_kill();
                }
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl StdioTransport {
    /// Serialize and write one NDJSON frame to the worker.
    pub async fn send(&self, msg: &WorkerMessage) -> Result<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Worker {
                agent_id: self.agent_id.clone(),
                message: format!("IPC write failed: {e}"),
            })?;
        stdin.flush().await.map_err(|e| Error::Worker {
            agent_id: self.agent_id.clone(),
            message: format!("IPC flush failed: {e}"),
        })
    }

    /// Ask the manager to deliver SIGTERM.
    pub async fn signal_term(&self) {
        let _ = self.control.send(Control::Term).await;
    }

    /// Ask the manager to hard-kill the child.
    pub async fn kill(&self) {
        let _ = self.control.send(Control::Kill).await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}
