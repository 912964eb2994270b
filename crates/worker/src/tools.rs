//! Builtin tools served by the worker.
//!
//! The gateway gates every invocation through policy and capabilities
//! before it reaches this process; tools here execute assuming the call
//! was authorized.

use std::sync::Arc;

use aegis_protocol::ToolSpec;

use crate::calc;
use crate::runtime::WorkerRuntime;

/// The tool catalogue advertised in `ready`.
pub fn catalogue() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            id: "builtin:calculate".into(),
            description: "Evaluate an arithmetic expression".into(),
            requires_confirmation: false,
        },
        ToolSpec {
            id: "builtin:echo".into(),
            description: "Echo the arguments back".into(),
            requires_confirmation: false,
        },
        ToolSpec {
            id: "builtin:file_read".into(),
            description: "Read a file as UTF-8 text".into(),
            requires_confirmation: false,
        },
        ToolSpec {
            id: "builtin:file_write".into(),
            description: "Write UTF-8 text to a file".into(),
            requires_confirmation: true,
        },
        ToolSpec {
            id: "builtin:shell".into(),
            description: "Run a shell command".into(),
            requires_confirmation: true,
        },
        ToolSpec {
            id: "builtin:agent_call".into(),
            description: "Send a task to another agent via the gateway".into(),
            requires_confirmation: false,
        },
    ]
}

/// Execute one task frame: `{type: "invoke_tool", toolId, arguments}`.
pub async fn execute(
    runtime: &Arc<WorkerRuntime>,
    task: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    let task_type = task["type"].as_str().unwrap_or("");
    if task_type != "invoke_tool" {
        return Err(format!("unsupported task type '{task_type}'"));
    }
    let tool_id = task["toolId"]
        .as_str()
        .or_else(|| task["tool_id"].as_str())
        .ok_or("missing toolId")?;
    let args = &task["arguments"];

    match tool_id {
        "builtin:calculate" => {
            let expression = args["expression"].as_str().ok_or("missing expression")?;
            let value = calc::evaluate(expression)?;
            Ok(serde_json::json!({ "result": calc::to_json(value) }))
        }
        "builtin:echo" => Ok(serde_json::json!({ "echo": args.clone() })),
        "builtin:file_read" => {
            let path = args["path"].as_str().ok_or("missing path")?;
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| format!("read {path}: {e}"))?;
            Ok(serde_json::json!({ "path": path, "content": content }))
        }
        "builtin:file_write" => {
            let path = args["path"].as_str().ok_or("missing path")?;
            let content = args["content"].as_str().ok_or("missing content")?;
            tokio::fs::write(path, content)
                .await
                .map_err(|e| format!("write {path}: {e}"))?;
            Ok(serde_json::json!({ "path": path, "bytes": content.len() }))
        }
        "builtin:shell" => {
            let command = args["command"].as_str().ok_or("missing command")?;
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()
                .await
                .map_err(|e| format!("exec: {e}"))?;
            Ok(serde_json::json!({
                "exit_code": output.status.code(),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }))
        }
        "builtin:agent_call" => {
            let inner = args["task"].clone();
            if inner.is_null() {
                return Err("missing task".into());
            }
            runtime.request_task(inner).await
        }
        other => Err(format!("unknown tool '{other}'")),
    }
}
