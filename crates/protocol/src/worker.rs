//! Worker IPC message types.
//!
//! Flow:
//! 1. Supervisor spawns the worker and sends `init`.
//! 2. Worker answers `ready`, advertising the tools it serves.
//! 3. Supervisor sends `task`; worker answers `result` correlated by
//!    `task_id`. Heartbeats flow worker → supervisor throughout.
//! 4. A worker may re-enter the gateway with `task_request` (internal
//!    channel); the supervisor answers with `task_response`.

use serde::{Deserialize, Serialize};

/// Max serialized IPC frame size (4 MB). Workers truncate oversized
/// results and flag them.
pub const MAX_IPC_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Result status of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ok,
    Error,
}

/// A tool the worker advertises in `ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    /// Whether invoking this tool needs human approval at non-supervised
    /// trust levels.
    #[serde(default)]
    pub requires_confirmation: bool,
}

/// IPC message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Supervisor → worker: bootstrap.
    #[serde(rename = "init")]
    Init {
        agent_id: String,
        agent_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        entry_point: Option<String>,
    },

    /// Worker → supervisor: bootstrap complete.
    #[serde(rename = "ready")]
    Ready {
        agent_id: String,
        #[serde(default)]
        tools: Vec<ToolSpec>,
    },

    /// Worker → supervisor: liveness.
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: i64 },

    /// Worker → supervisor: log line routed to the gateway logger.
    #[serde(rename = "log")]
    Log { level: String, text: String },

    /// Supervisor → worker: execute a task.
    #[serde(rename = "task")]
    Task {
        task_id: String,
        task: serde_json::Value,
    },

    /// Worker → supervisor: task outcome.
    #[serde(rename = "result")]
    Result {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Worker → supervisor: re-enter the task router (internal channel).
    #[serde(rename = "task_request")]
    TaskRequest {
        request_id: String,
        task: serde_json::Value,
    },

    /// Supervisor → worker: reply to a `task_request`.
    #[serde(rename = "task_response")]
    TaskResponse {
        request_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Supervisor → worker: shut down cleanly.
    #[serde(rename = "terminate")]
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_tagged_json() {
        let msg = WorkerMessage::Result {
            task_id: "t1".into(),
            status: TaskStatus::Ok,
            result: Some(serde_json::json!({ "result": 8 })),
            error: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"result\""));
        assert!(json.contains("\"status\":\"ok\""));
        assert!(!json.contains("error"));

        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        match back {
            WorkerMessage::Result { task_id, status, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(status, TaskStatus::Ok);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ready_tools_default_empty() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"ready","agent_id":"calc"}"#).unwrap();
        match msg {
            WorkerMessage::Ready { agent_id, tools } => {
                assert_eq!(agent_id, "calc");
                assert!(tools.is_empty());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails() {
        assert!(serde_json::from_str::<WorkerMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
