//! Anthropic-native adapter (Messages API).
//!
//! System messages go in the top-level `system` field; everything else
//! maps straight onto the messages array.

use aegis_domain::config::ProviderConfig;
use aegis_domain::{Error, Result};
use serde_json::Value;

use crate::sse::sse_response_stream;
use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, Usage,
};
use crate::util::{resolve_api_key, truncate};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(cfg)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            models: cfg.models.clone(),
            client,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            if msg.role == "system" {
                system_parts.push(&msg.content);
            } else {
                api_messages.push(serde_json::json!({
                    "role": msg.role,
                    "content": msg.content,
                }));
            }
        }

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": api_messages,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .authed_post(&self.messages_url())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)),
            });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn is_available(&self) -> bool {
        // HEAD-style probe; any HTTP answer (even 4xx) means reachable.
        self.client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        let response = self.send(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let content = json["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: json["model"].as_str().unwrap_or(&req.model).to_string(),
            usage: parse_usage(&json["usage"]),
            finish_reason: json["stop_reason"].as_str().map(String::from),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req, true);
        let response = self.send(&body).await?;

        let mut usage: Option<Usage> = None;
        Ok(sse_response_stream(response, move |data| {
            let Ok(json) = serde_json::from_str::<Value>(data) else {
                return vec![];
            };
            match json["type"].as_str() {
                Some("content_block_delta") => {
                    match json["delta"]["text"].as_str() {
                        Some(text) => vec![Ok(StreamEvent::Chunk { text: text.into() })],
                        None => vec![],
                    }
                }
                Some("message_start") => {
                    usage = parse_usage(&json["message"]["usage"]);
                    vec![]
                }
                Some("message_delta") => {
                    // Output tokens arrive incrementally on message_delta.
                    if let Some(out) = json["usage"]["output_tokens"].as_u64() {
                        let input = usage.map(|u| u.input_tokens).unwrap_or(0);
                        usage = Some(Usage {
                            input_tokens: input,
                            output_tokens: out as u32,
                        });
                    }
                    vec![]
                }
                Some("message_stop") => vec![Ok(StreamEvent::Done {
                    usage,
                    finish_reason: Some("stop".into()),
                })],
                Some("error") => vec![Ok(StreamEvent::Error {
                    message: json["error"]["message"]
                        .as_str()
                        .unwrap_or("stream error")
                        .to_string(),
                })],
                _ => vec![],
            }
        }))
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: value["input_tokens"].as_u64()? as u32,
        output_tokens: value["output_tokens"].as_u64().unwrap_or(0) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ChatMessage;

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            id: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: "test-key".into(),
            models: vec!["claude-sonnet-4-5-20250929".into()],
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn system_messages_lift_to_top_level() {
        let req = ChatRequest {
            model: "claude-sonnet-4-5-20250929".into(),
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hello"),
            ],
            max_tokens: Some(100),
            ..Default::default()
        };
        let body = provider().build_body(&req, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn usage_parses() {
        let json = serde_json::json!({ "input_tokens": 12, "output_tokens": 34 });
        let usage = parse_usage(&json).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
        assert!(parse_usage(&serde_json::json!({})).is_none());
    }
}
