//! The provider-aware LLM router.
//!
//! Route algorithm:
//! 1. Resolve the model alias against the registry's alias map.
//! 2. Enumerate healthy providers advertising the resolved model, in
//!    priority order.
//! 3. For each provider (up to `max_failover_attempts`): acquire rate
//!    capacity, execute under the per-provider circuit breaker with
//!    retry, record usage on success.
//! 4. When every matching provider fails, try one fallback model from
//!    `model_preferences` served by a healthy provider.
//! 5. Reject up front when the spend budget is exhausted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_domain::config::LlmConfig;
use aegis_domain::{Error, Result};
use aegis_reliability::{
    is_retryable, retry, BreakerRegistry, RateLimiter, RetryPolicy, TokenTracker,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::registry::ProviderRegistry;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider, StreamEvent, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routing metadata attached to every successful response.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMeta {
    pub request_id: String,
    pub provider_id: String,
    pub model: String,
    pub latency_ms: u64,
    pub retry_count: u32,
    pub failover_count: u32,
}

/// A fully-collected streaming response.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResult {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub time_to_first_chunk_ms: u64,
    pub total_duration_ms: u64,
    pub chunk_count: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LlmRouter {
    registry: Arc<ProviderRegistry>,
    config: LlmConfig,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<TokenTracker>,
}

impl LlmRouter {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: LlmConfig,
        breakers: Arc<BreakerRegistry>,
        limiter: Arc<RateLimiter>,
        tracker: Arc<TokenTracker>,
    ) -> Self {
        for pc in &config.providers {
            limiter.configure(
                &pc.id,
                aegis_reliability::RateLimits {
                    requests_per_minute: pc.max_requests_per_minute,
                    tokens_per_minute: pc.max_tokens_per_minute,
                },
            );
        }
        Self {
            registry,
            config,
            breakers,
            limiter,
            tracker,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<TokenTracker> {
        &self.tracker
    }

    // ── Non-streaming ──────────────────────────────────────────────

    /// Route a chat request to completion.
    pub async fn route(&self, req: &ChatRequest) -> Result<(ChatResponse, RouteMeta)> {
        self.check_budget()?;
        metrics::counter!("aegis_requests_total", 1);

        let model = self.registry.resolve_alias(&req.model);
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        let mut failover_count = 0u32;
        let mut last_err: Option<Error> = None;

        let providers = self.candidates(&model);
        if providers.is_empty() {
            tracing::warn!(model = %model, "no healthy provider serves model");
        }

        for provider in providers {
            match self.attempt(&provider, &model, req).await {
                Ok((response, retry_count)) => {
                    let meta = RouteMeta {
                        request_id,
                        provider_id: provider.id().to_string(),
                        model: model.clone(),
                        latency_ms: started.elapsed().as_millis() as u64,
                        retry_count,
                        failover_count,
                    };
                    return Ok((response, meta));
                }
                Err(err) => {
                    self.note_failure(&provider, &err);
                    last_err = Some(err);
                    failover_count += 1;
                    metrics::counter!("aegis_llm_failovers_total", 1);
                }
            }
        }

        // Fallback model, one shot.
        if self.config.max_failover_attempts > 0 {
            if let Some((fallback_model, provider)) = self.pick_fallback(&model) {
                tracing::info!(
                    from_model = %model,
                    to_model = %fallback_model,
                    provider = %provider.id(),
                    "failing over to fallback model"
                );
                let mut fb_req = req.clone();
                fb_req.model = fallback_model.clone();
                match self.attempt(&provider, &fallback_model, &fb_req).await {
                    Ok((response, retry_count)) => {
                        let meta = RouteMeta {
                            request_id,
                            provider_id: provider.id().to_string(),
                            model: fallback_model,
                            latency_ms: started.elapsed().as_millis() as u64,
                            retry_count,
                            failover_count,
                        };
                        return Ok((response, meta));
                    }
                    Err(err) => {
                        self.note_failure(&provider, &err);
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "router".into(),
            message: format!("no provider available for model '{model}'"),
        }))
    }

    /// One provider attempt: rate limit, then breaker-wrapped retries.
    async fn attempt(
        &self,
        provider: &Arc<dyn LlmProvider>,
        model: &str,
        req: &ChatRequest,
    ) -> Result<(ChatResponse, u32)> {
        let estimated = estimate_tokens(req);
        if !self.limiter.acquire(provider.id(), estimated) {
            return Err(Error::RateLimited(format!(
                "provider '{}' is at its rate limit",
                provider.id()
            )));
        }

        let mut attempt_req = req.clone();
        attempt_req.model = model.to_string();

        let breaker = self.breakers.get(provider.id());
        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let result = retry(self.retry_policy(), retryable_for_routing, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let breaker = breaker.clone();
            let provider = provider.clone();
            let req = attempt_req.clone();
            async move { breaker.call(|| async move { provider.chat(&req).await }).await }
        })
        .await;

        let elapsed = started.elapsed();
        metrics::histogram!(
            "aegis_request_duration_seconds",
            elapsed.as_secs_f64(),
            "provider" => provider.id().to_string(),
            "model" => model.to_string(),
        );

        match result {
            Ok(response) => {
                let usage = response.usage.unwrap_or(Usage {
                    input_tokens: estimated,
                    output_tokens: 0,
                });
                self.limiter
                    .report_usage(provider.id(), estimated, usage.total());
                self.tracker.record(
                    provider.id(),
                    model,
                    req.agent_id.as_deref(),
                    usage.input_tokens,
                    usage.output_tokens,
                    estimate_cost(model, usage),
                );
                let retry_count = attempts.load(Ordering::SeqCst).saturating_sub(1);
                Ok((response, retry_count))
            }
            Err(err) => Err(err),
        }
    }

    // ── Streaming ──────────────────────────────────────────────────

    /// Route a streaming chat request, forwarding each text chunk into
    /// `chunk_tx` (when given) and collecting the whole stream.
    ///
    /// The stream must produce its first event within the configured
    /// init timeout; a stall past the per-chunk timeout aborts the
    /// underlying transport (the response body is dropped).
    pub async fn route_stream(
        &self,
        req: &ChatRequest,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<(StreamResult, RouteMeta)> {
        self.check_budget()?;
        metrics::counter!("aegis_requests_total", 1);

        let model = self.registry.resolve_alias(&req.model);
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let init_timeout = Duration::from_millis(self.config.stream_init_timeout_ms);
        let chunk_timeout = Duration::from_millis(self.config.stream_chunk_timeout_ms);

        let mut failover_count = 0u32;
        let mut last_err: Option<Error> = None;

        for provider in self.candidates(&model) {
            if !provider.supports_streaming() {
                continue;
            }
            let estimated = estimate_tokens(req);
            if !self.limiter.acquire(provider.id(), estimated) {
                last_err = Some(Error::RateLimited(format!(
                    "provider '{}' is at its rate limit",
                    provider.id()
                )));
                continue;
            }

            let mut stream_req = req.clone();
            stream_req.model = model.clone();

            // Breaker accounts for stream initialization; consumption
            // happens outside so long generations aren't cut short.
            let breaker = self.breakers.get(provider.id());
            let init = breaker
                .call(|| async {
                    match tokio::time::timeout(init_timeout, provider.chat_stream(&stream_req))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "stream from '{}' failed to initialize within {:?}",
                            provider.id(),
                            init_timeout
                        ))),
                    }
                })
                .await;

            let stream = match init {
                Ok(stream) => stream,
                Err(err) => {
                    self.note_failure(&provider, &err);
                    last_err = Some(err);
                    failover_count += 1;
                    metrics::counter!("aegis_llm_failovers_total", 1);
                    continue;
                }
            };

            match self
                .collect_stream(stream, chunk_timeout, chunk_tx.clone(), &model)
                .await
            {
                Ok(mut result) => {
                    let usage = result.usage.unwrap_or(Usage {
                        input_tokens: estimated,
                        output_tokens: 0,
                    });
                    self.limiter
                        .report_usage(provider.id(), estimated, usage.total());
                    self.tracker.record(
                        provider.id(),
                        &model,
                        req.agent_id.as_deref(),
                        usage.input_tokens,
                        usage.output_tokens,
                        estimate_cost(&model, usage),
                    );
                    result.total_duration_ms = started.elapsed().as_millis() as u64;
                    let meta = RouteMeta {
                        request_id,
                        provider_id: provider.id().to_string(),
                        model: model.clone(),
                        latency_ms: result.total_duration_ms,
                        retry_count: 0,
                        failover_count,
                    };
                    return Ok((result, meta));
                }
                Err(err) => {
                    // A stream that died mid-flight is not retried on
                    // another provider; partial output may have reached
                    // the client already.
                    self.note_failure(&provider, &err);
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Provider {
            provider: "router".into(),
            message: format!("no streaming provider available for model '{model}'"),
        }))
    }

    async fn collect_stream(
        &self,
        mut stream: crate::traits::BoxStream<'static, Result<StreamEvent>>,
        chunk_timeout: Duration,
        chunk_tx: Option<mpsc::Sender<String>>,
        model: &str,
    ) -> Result<StreamResult> {
        let started = Instant::now();
        let mut content = String::new();
        let mut chunk_count = 0u32;
        let mut first_chunk_ms: Option<u64> = None;
        let mut usage = None;

        loop {
            let event = match tokio::time::timeout(chunk_timeout, stream.next()).await {
                Ok(event) => event,
                // Dropping the stream aborts the underlying transport.
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "stream stalled past {chunk_timeout:?}"
                    )))
                }
            };

            match event {
                Some(Ok(StreamEvent::Chunk { text })) => {
                    if first_chunk_ms.is_none() {
                        first_chunk_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    chunk_count += 1;
                    content.push_str(&text);
                    if let Some(tx) = &chunk_tx {
                        // A gone receiver just means the client left.
                        let _ = tx.send(text).await;
                    }
                }
                Some(Ok(StreamEvent::Done { usage: u, .. })) => {
                    usage = u;
                    break;
                }
                Some(Ok(StreamEvent::Error { message })) => {
                    return Err(Error::Provider {
                        provider: "stream".into(),
                        message,
                    });
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }

        Ok(StreamResult {
            content,
            model: model.to_string(),
            usage,
            time_to_first_chunk_ms: first_chunk_ms.unwrap_or(0),
            total_duration_ms: started.elapsed().as_millis() as u64,
            chunk_count,
        })
    }

    // ── Selection helpers ──────────────────────────────────────────

    fn candidates(&self, model: &str) -> Vec<Arc<dyn LlmProvider>> {
        self.registry
            .providers_for_model(model)
            .into_iter()
            .take(self.config.max_failover_attempts.max(1) as usize)
            .collect()
    }

    fn pick_fallback(&self, failed_model: &str) -> Option<(String, Arc<dyn LlmProvider>)> {
        for preference in &self.config.model_preferences {
            if preference == failed_model {
                continue;
            }
            if let Some(provider) = self.registry.providers_for_model(preference).first() {
                return Some((preference.clone(), provider.clone()));
            }
        }
        None
    }

    fn check_budget(&self) -> Result<()> {
        if !self.tracker.is_under_budget() {
            let limit = self.tracker.budget().map(|b| b.limit_usd).unwrap_or(0.0);
            return Err(Error::BudgetExceeded {
                spent_usd: self.tracker.window_spend(),
                limit_usd: limit,
            });
        }
        Ok(())
    }

    fn note_failure(&self, provider: &Arc<dyn LlmProvider>, err: &Error) {
        tracing::warn!(provider = %provider.id(), error = %err, "provider attempt failed");
        // Permanent provider errors (auth, unknown model) gate the
        // provider out of routing until the health prober clears it.
        if matches!(err, Error::Provider { .. }) && !is_retryable(err) {
            self.registry.set_health(provider.id(), false);
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.max_retries,
            ..RetryPolicy::default()
        }
    }
}

/// Retry classifier for routed calls: an open circuit means the provider
/// is being rested, so it is not retried here.
fn retryable_for_routing(err: &Error) -> bool {
    !matches!(err, Error::CircuitOpen { .. }) && is_retryable(err)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rough request-size estimate for rate limiting: ~4 chars per token
/// plus the response allowance.
fn estimate_tokens(req: &ChatRequest) -> u32 {
    let prompt_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
    (prompt_chars / 4) as u32 + req.max_tokens.unwrap_or(1024)
}

/// Per-model USD cost for recorded usage. Prices are per million tokens
/// (input, output); unknown models use a conservative default.
fn estimate_cost(model: &str, usage: Usage) -> f64 {
    let (input_per_m, output_per_m) = if model.contains("opus") {
        (15.0, 75.0)
    } else if model.contains("sonnet") {
        (3.0, 15.0)
    } else if model.contains("haiku") {
        (0.8, 4.0)
    } else if model.starts_with("gpt-4") {
        (2.5, 10.0)
    } else {
        (1.0, 5.0)
    };
    usage.input_tokens as f64 / 1e6 * input_per_m
        + usage.output_tokens as f64 / 1e6 * output_per_m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{replying, MockBehavior, MockProvider};
    use aegis_domain::config::{BudgetConfig, BudgetPeriod};
    use aegis_reliability::BreakerConfig;

    const MODEL: &str = "claude-sonnet-4-5-20250929";

    fn make_router(
        providers: Vec<(Arc<dyn LlmProvider>, u32)>,
        config: LlmConfig,
        budget: Option<BudgetConfig>,
    ) -> LlmRouter {
        let registry = Arc::new(ProviderRegistry::from_providers(providers));
        for (alias, target) in &config.aliases {
            registry.set_alias(alias, target);
        }
        LlmRouter::new(
            registry,
            config,
            Arc::new(BreakerRegistry::new(BreakerConfig {
                failure_threshold: 10,
                reset_timeout: Duration::from_millis(50),
                op_timeout: Duration::from_secs(5),
            })),
            Arc::new(RateLimiter::new()),
            Arc::new(TokenTracker::new(budget)),
        )
    }

    fn fast_config() -> LlmConfig {
        LlmConfig {
            max_retries: 0,
            ..LlmConfig::default()
        }
    }

    fn req(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![crate::traits::ChatMessage::user("hello")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn routes_to_single_provider() {
        let provider = replying("a", &[MODEL], "hi there");
        let router = make_router(vec![(provider, 1)], fast_config(), None);

        let (response, meta) = router.route(&req(MODEL)).await.unwrap();
        assert_eq!(response.content, "hi there");
        assert_eq!(meta.provider_id, "a");
        assert_eq!(meta.failover_count, 0);
        assert_eq!(meta.retry_count, 0);
    }

    #[tokio::test]
    async fn alias_resolution_applies() {
        let provider = replying("a", &[MODEL], "ok");
        let mut config = fast_config();
        config.aliases.insert("claude".into(), MODEL.into());
        let router = make_router(vec![(provider, 1)], config, None);

        let (_, meta) = router.route(&req("claude")).await.unwrap();
        assert_eq!(meta.model, MODEL);
    }

    #[tokio::test]
    async fn failover_to_lower_priority_provider() {
        let a = Arc::new(MockProvider::always_failing("a", &[MODEL])) as Arc<dyn LlmProvider>;
        let b = replying("b", &[MODEL], "from b");
        let router = make_router(vec![(a, 1), (b, 2)], fast_config(), None);

        let (response, meta) = router.route(&req(MODEL)).await.unwrap();
        assert_eq!(response.content, "from b");
        assert_eq!(meta.provider_id, "b");
        assert_eq!(meta.failover_count, 1);
    }

    #[tokio::test]
    async fn fallback_model_after_all_providers_fail() {
        let a = Arc::new(MockProvider::always_failing("a", &[MODEL])) as Arc<dyn LlmProvider>;
        let fb = replying("fb", &["fallback-model"], "fallback reply");
        let mut config = fast_config();
        config.model_preferences = vec!["fallback-model".into()];
        let router = make_router(vec![(a, 1), (fb, 2)], config, None);

        let (response, meta) = router.route(&req(MODEL)).await.unwrap();
        assert_eq!(response.content, "fallback reply");
        assert_eq!(meta.model, "fallback-model");
        assert!(meta.failover_count >= 1);
    }

    #[tokio::test]
    async fn budget_exceeded_rejected_up_front() {
        let provider = replying("a", &[MODEL], "ok");
        provider.with_usage(Usage {
            input_tokens: 1_000_000,
            output_tokens: 10,
        });
        let router = make_router(
            vec![(provider as Arc<dyn LlmProvider>, 1)],
            fast_config(),
            Some(BudgetConfig {
                limit_usd: 0.0001,
                period: BudgetPeriod::Daily,
            }),
        );

        // First call succeeds and blows the budget.
        router.route(&req(MODEL)).await.unwrap();
        let err = router.route(&req(MODEL)).await.unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn retries_transient_errors_and_reports_count() {
        let provider = Arc::new(MockProvider::scripted(
            "a",
            &[MODEL],
            vec![
                MockBehavior::Fail("HTTP 503 unavailable".into()),
                MockBehavior::Fail("HTTP 503 unavailable".into()),
                MockBehavior::Reply("third time lucky".into()),
            ],
        ));
        let mut config = fast_config();
        config.max_retries = 3;
        let router = make_router(vec![(provider.clone(), 1)], config, None);

        let (response, meta) = router.route(&req(MODEL)).await.unwrap();
        assert_eq!(response.content, "third time lucky");
        assert_eq!(meta.retry_count, 2);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_error_marks_provider_unhealthy() {
        let a = Arc::new(MockProvider::scripted(
            "a",
            &[MODEL],
            vec![MockBehavior::Fail("HTTP 401 bad key".into())],
        )) as Arc<dyn LlmProvider>;
        let router = make_router(vec![(a, 1)], fast_config(), None);

        assert!(router.route(&req(MODEL)).await.is_err());
        assert!(!router.registry().is_healthy("a"));
    }

    #[tokio::test]
    async fn rate_limited_provider_skipped() {
        let a = replying("a", &[MODEL], "from a");
        let b = replying("b", &[MODEL], "from b");
        let router = make_router(vec![(a, 1), (b, 2)], fast_config(), None);
        router.limiter.configure(
            "a",
            aegis_reliability::RateLimits {
                requests_per_minute: 60,
                tokens_per_minute: 1, // too small for any request
            },
        );

        let (response, _) = router.route(&req(MODEL)).await.unwrap();
        assert_eq!(response.content, "from b");
    }

    #[tokio::test]
    async fn stream_collects_chunks_and_forwards() {
        let provider = replying("a", &[MODEL], "alpha beta gamma");
        let router = make_router(vec![(provider, 1)], fast_config(), None);

        let (tx, mut rx) = mpsc::channel(16);
        let (result, meta) = router
            .route_stream(&req(MODEL), Some(tx))
            .await
            .unwrap();

        assert_eq!(result.content, "alpha beta gamma");
        assert!(result.chunk_count >= 3);
        assert_eq!(meta.provider_id, "a");

        let mut forwarded = String::new();
        while let Ok(chunk) = rx.try_recv() {
            forwarded.push_str(&chunk);
        }
        assert_eq!(forwarded, "alpha beta gamma");
    }

    #[tokio::test]
    async fn stream_failover_on_init_failure() {
        let a = Arc::new(MockProvider::always_failing("a", &[MODEL])) as Arc<dyn LlmProvider>;
        let b = replying("b", &[MODEL], "streamed");
        let router = make_router(vec![(a, 1), (b, 2)], fast_config(), None);

        let (result, meta) = router.route_stream(&req(MODEL), None).await.unwrap();
        assert_eq!(result.content, "streamed");
        assert_eq!(meta.failover_count, 1);
    }

    #[test]
    fn cost_model_orders_sensibly() {
        let usage = Usage {
            input_tokens: 1000,
            output_tokens: 1000,
        };
        let opus = estimate_cost("claude-opus-4", usage);
        let sonnet = estimate_cost("claude-sonnet-4-5-20250929", usage);
        let haiku = estimate_cost("claude-haiku-4", usage);
        assert!(opus > sonnet && sonnet > haiku);
        assert!(estimate_cost("unknown-model", usage) > 0.0);
    }
}
