//! Worker-side runtime plumbing: the single stdout writer, concurrent
//! task execution, and the internal request channel back to the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use aegis_protocol::{TaskStatus, WorkerMessage};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Shared worker runtime. Cheap to clone via `Arc`.
pub struct WorkerRuntime {
    outbound: mpsc::Sender<WorkerMessage>,
    /// Pending `task_request` calls awaiting a `task_response`.
    internal_pending:
        Mutex<HashMap<String, oneshot::Sender<Result<serde_json::Value, String>>>>,
}

impl WorkerRuntime {
    /// Start the stdout writer task and return the runtime handle.
    pub fn start() -> Arc<Self> {
        let (outbound, mut rx) = mpsc::channel::<WorkerMessage>(64);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(msg) = rx.recv().await {
                let mut line = match serde_json::to_string(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize outbound frame");
                        continue;
                    }
                };
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdout.flush().await;
            }
        });

        Arc::new(Self {
            outbound,
            internal_pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn outbound(&self) -> mpsc::Sender<WorkerMessage> {
        self.outbound.clone()
    }

    pub async fn send(&self, msg: WorkerMessage) {
        if self.outbound.send(msg).await.is_err() {
            tracing::error!("outbound channel closed");
        }
    }

    /// Run one task concurrently and answer with `result`.
    pub fn spawn_task(self: &Arc<Self>, task_id: String, task: serde_json::Value) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let reply = match crate::tools::execute(&runtime, &task).await {
                Ok(result) => WorkerMessage::Result {
                    task_id,
                    status: TaskStatus::Ok,
                    result: Some(result),
                    error: None,
                },
                Err(message) => WorkerMessage::Result {
                    task_id,
                    status: TaskStatus::Error,
                    result: None,
                    error: Some(message),
                },
            };
            runtime.send(reply).await;
        });
    }

    // ── Internal channel ───────────────────────────────────────────

    /// Send a task back into the gateway and await the response.
    pub async fn request_task(
        &self,
        task: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.internal_pending.lock().insert(request_id.clone(), tx);

        self.send(WorkerMessage::TaskRequest {
            request_id: request_id.clone(),
            task,
        })
        .await;

        match tokio::time::timeout(std::time::Duration::from_secs(60), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("internal channel closed".into()),
            Err(_) => {
                self.internal_pending.lock().remove(&request_id);
                Err("internal request timed out".into())
            }
        }
    }

    /// Resolve a pending internal request from a `task_response` frame.
    pub fn complete_internal(
        &self,
        request_id: &str,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let Some(tx) = self.internal_pending.lock().remove(request_id) else {
            tracing::warn!(request_id = %request_id, "task_response for unknown request");
            return;
        };
        let outcome = match status {
            TaskStatus::Ok => Ok(result.unwrap_or(serde_json::Value::Null)),
            TaskStatus::Error => Err(error.unwrap_or_else(|| "internal task failed".into())),
        };
        let _ = tx.send(outcome);
    }
}
