//! Scriptable in-process provider for router and gateway tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use aegis_domain::{Error, Result};
use parking_lot::Mutex;

use crate::traits::{
    BoxStream, ChatRequest, ChatResponse, LlmProvider, StreamEvent, Usage,
};

/// What the mock does for one call.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Succeed with this content.
    Reply(String),
    /// Fail with a provider error carrying this message.
    Fail(String),
}

/// A provider whose responses are scripted per call. Once the script is
/// exhausted the last behavior repeats.
pub struct MockProvider {
    id: String,
    models: Vec<String>,
    script: Mutex<Vec<MockBehavior>>,
    cursor: AtomicUsize,
    calls: AtomicU32,
    usage: Mutex<Usage>,
    available: std::sync::atomic::AtomicBool,
}

impl MockProvider {
    pub fn new(id: &str, models: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            script: Mutex::new(vec![MockBehavior::Reply("ok".into())]),
            cursor: AtomicUsize::new(0),
            calls: AtomicU32::new(0),
            usage: Mutex::new(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn scripted(id: &str, models: &[&str], script: Vec<MockBehavior>) -> Self {
        let provider = Self::new(id, models);
        *provider.script.lock() = script;
        provider
    }

    pub fn always_failing(id: &str, models: &[&str]) -> Self {
        Self::scripted(id, models, vec![MockBehavior::Fail("HTTP 500 boom".into())])
    }

    pub fn with_usage(&self, usage: Usage) -> &Self {
        *self.usage.lock() = usage;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        let script = self.script.lock();
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        script
            .get(idx)
            .or_else(|| script.last())
            .cloned()
            .unwrap_or(MockBehavior::Reply("ok".into()))
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            MockBehavior::Reply(content) => Ok(ChatResponse {
                content,
                model: req.model.clone(),
                usage: Some(*self.usage.lock()),
                finish_reason: Some("stop".into()),
            }),
            MockBehavior::Fail(message) => Err(Error::Provider {
                provider: self.id.clone(),
                message,
            }),
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_behavior() {
            MockBehavior::Reply(content) => {
                let usage = *self.usage.lock();
                let words: Vec<String> = content
                    .split_inclusive(' ')
                    .map(String::from)
                    .collect();
                Ok(Box::pin(async_stream::stream! {
                    for word in words {
                        yield Ok(StreamEvent::Chunk { text: word });
                    }
                    yield Ok(StreamEvent::Done {
                        usage: Some(usage),
                        finish_reason: Some("stop".into()),
                    });
                }))
            }
            MockBehavior::Fail(message) => Err(Error::Provider {
                provider: self.id.clone(),
                message,
            }),
        }
    }
}

/// Convenience: an `Arc`'d mock that always replies with `content`.
pub fn replying(id: &str, models: &[&str], content: &str) -> Arc<MockProvider> {
    Arc::new(MockProvider::scripted(
        id,
        models,
        vec![MockBehavior::Reply(content.into())],
    ))
}
