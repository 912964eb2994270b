//! OpenAI-compatible adapter (chat/completions wire format).
//!
//! Covers OpenAI itself and the many gateways that speak its API.

use aegis_domain::config::ProviderConfig;
use aegis_domain::{Error, Result};
use serde_json::Value;

use crate::sse::sse_response_stream;
use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, Usage,
};
use crate::util::{resolve_api_key, truncate};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
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

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
impl LlmProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "OpenAI-compatible"
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
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

        let choice = &json["choices"][0];
        Ok(ChatResponse {
            content: choice["message"]["content"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            model: json["model"].as_str().unwrap_or(&req.model).to_string(),
            usage: parse_usage(&json["usage"]),
            finish_reason: choice["finish_reason"].as_str().map(String::from),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(req, true);
        let response = self.send(&body).await?;

        let mut usage: Option<Usage> = None;
        let mut finish: Option<String> = None;
        Ok(sse_response_stream(response, move |data| {
            let Ok(json) = serde_json::from_str::<Value>(data) else {
                return vec![];
            };
            if let Some(u) = parse_usage(&json["usage"]) {
                usage = Some(u);
            }

            let choice = &json["choices"][0];
            if let Some(reason) = choice["finish_reason"].as_str() {
                finish = Some(reason.to_string());
                return vec![Ok(StreamEvent::Done {
                    usage,
                    finish_reason: finish.clone(),
                })];
            }
            match choice["delta"]["content"].as_str() {
                Some(text) if !text.is_empty() => {
                    vec![Ok(StreamEvent::Chunk { text: text.into() })]
                }
                _ => vec![],
            }
        }))
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: value["prompt_tokens"].as_u64()? as u32,
        output_tokens: value["completion_tokens"].as_u64().unwrap_or(0) as u32,
    })
}
