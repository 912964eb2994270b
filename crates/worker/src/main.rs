//! The per-agent worker process.
//!
//! Speaks newline-delimited JSON over stdio with the supervisor:
//! 1. Receives `init`, answers `ready` with the builtin tool catalogue.
//! 2. Executes `task` frames concurrently and answers `result`.
//! 3. Emits `heartbeat` on an interval; logs go to stderr so stdout
//!    stays protocol-clean.

mod calc;
mod runtime;
mod tools;

use std::time::Duration;

use aegis_protocol::WorkerMessage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::runtime::WorkerRuntime;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Protocol owns stdout; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = WorkerRuntime::start();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Heartbeats start immediately; the supervisor tolerates beats
    // before ready.
    {
        let outbound = runtime.outbound();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tick.tick().await;
                let beat = WorkerMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                if outbound.send(beat).await.is_err() {
                    break;
                }
            }
        });
    }

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg: WorkerMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable frame from supervisor");
                continue;
            }
        };

        match msg {
            WorkerMessage::Init {
                agent_id,
                agent_name,
                ..
            } => {
                tracing::info!(agent_id = %agent_id, name = %agent_name, "worker initialized");
                runtime
                    .send(WorkerMessage::Ready {
                        agent_id,
                        tools: tools::catalogue(),
                    })
                    .await;
            }
            WorkerMessage::Task { task_id, task } => {
                runtime.spawn_task(task_id, task);
            }
            WorkerMessage::TaskResponse {
                request_id,
                status,
                result,
                error,
            } => {
                runtime.complete_internal(&request_id, status, result, error);
            }
            WorkerMessage::Terminate => {
                tracing::info!("terminate received, exiting");
                break;
            }
            other => {
                tracing::debug!(?other, "unexpected frame from supervisor");
            }
        }
    }

    Ok(())
}
