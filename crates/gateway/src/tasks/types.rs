//! Typed task payloads. Validation happens here at the boundary;
//! handlers never inspect raw JSON shapes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Human approval attached to a tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct Approval {
    #[serde(rename = "approvedBy")]
    pub approved_by: String,
    #[serde(default, rename = "approvedAt")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A task addressed to an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AgentTask {
    #[serde(rename = "chat")]
    Chat {
        message: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        stream: bool,
    },

    #[serde(rename = "invoke_tool", alias = "invokeTool")]
    InvokeTool {
        #[serde(rename = "toolId", alias = "tool_id")]
        tool_id: String,
        #[serde(default)]
        arguments: serde_json::Value,
        #[serde(default)]
        approval: Option<Approval>,
    },

    #[serde(rename = "search_memory", alias = "searchMemory")]
    SearchMemory {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
    },

    #[serde(rename = "store_fact", alias = "storeFact")]
    StoreFact { fact: String },

    #[serde(rename = "record_episode", alias = "recordEpisode")]
    RecordEpisode { episode: serde_json::Value },

    #[serde(rename = "learn_procedure", alias = "learnProcedure")]
    LearnProcedure {
        name: String,
        steps: serde_json::Value,
    },

    #[serde(rename = "list_tools", alias = "listTools")]
    ListTools,
}
