//! Client WebSocket wire protocol.
//!
//! Every frame is `{type, id?, payload?, timestamp?}`. Payload shapes are
//! validated at the boundary with the typed structs below; handlers never
//! poke at untyped JSON.

use aegis_domain::ErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Close code for auth/rate-limit violations.
pub const CLOSE_POLICY: u16 = 1008;
/// Close code when the server is shedding load.
pub const CLOSE_OVERLOAD: u16 = 1013;
/// Close code on orderly shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "auth_required")]
    AuthRequired,
    #[serde(rename = "auth_success")]
    AuthSuccess,
    #[serde(rename = "auth_failed")]
    AuthFailed,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "chat_stream")]
    ChatStream,
    #[serde(rename = "chat_stream_end")]
    ChatStreamEnd,
    #[serde(rename = "agent.spawn")]
    AgentSpawn,
    #[serde(rename = "agent.terminate")]
    AgentTerminate,
    #[serde(rename = "agent.task")]
    AgentTask,
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "result")]
    Result,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "system")]
    System,
}

/// The frame envelope shared by every client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ClientFrame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            id: None,
            payload: None,
            timestamp: Some(Utc::now()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// An error frame echoing the request id when present.
    pub fn error(code: ErrorCode, message: impl Into<String>, id: Option<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            id,
            payload: Some(serde_json::json!({
                "code": code.as_str(),
                "message": message.into(),
            })),
            timestamp: Some(Utc::now()),
        }
    }

    /// A system event frame (subscriptions, broadcasts).
    pub fn system(event: &str, payload: serde_json::Value) -> Self {
        Self {
            frame_type: FrameType::System,
            id: None,
            payload: Some(serde_json::json!({ "event": event, "data": payload })),
            timestamp: Some(Utc::now()),
        }
    }

    /// Parse and validate a typed payload out of the frame.
    pub fn parse_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        let payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(payload).map_err(|e| e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// `agent.spawn` payload: inline manifest or a path the gateway reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
    #[serde(default, rename = "manifestPath", skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
}

/// `agent.task` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPayload {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub task: serde_json::Value,
    /// Set when the task arrives over the worker-internal channel.
    #[serde(default)]
    pub internal: bool,
    #[serde(default, rename = "internalToken", skip_serializing_if = "Option::is_none")]
    pub internal_token: Option<String>,
}

/// `subscribe` / `unsubscribe` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscribePayload {
    pub channels: Vec<String>,
}
