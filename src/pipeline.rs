//! Per-request orchestration: auth, coalescing, cache, upstream, events
//!
//! The pipeline is a value owning handles to every collaborator; there are
//! no process-wide singletons. Each request walks
//! authenticate -> fingerprint -> coalesce -> cache lookup -> upstream ->
//! cache populate -> event, with a single deadline bounding the whole walk.
//! Cache population and event emission are best-effort and can never fail
//! the response.

use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::coalesce::{canonicalize_messages, fingerprint, CoalesceSnapshot, RequestCoalescer};
use crate::credentials::{CredentialResolver, CredentialSource};
use crate::error::GatewayError;
use crate::events::{EventEmitter, EventStatus, EventType, NormalizedEvent};
use crate::metrics::GatewayMetrics;
use crate::pricing::{model_family, PriceTable, UNKNOWN_MODEL_TAG};
use crate::project_store::{Project, ProjectStore};
use crate::sanitize::Sanitizer;
use crate::semantic_cache::{CacheDecision, CacheOutcome, CachedPayload, SemanticCache};
use crate::upstream::{
    provider_for_model, ChatRequest, ChatResponse, CompletionRequest, CompletionResponse,
    EmbeddingsRequest, Provider, Upstream,
};
use crate::validation::{validate_chat, validate_completion, validate_embeddings};

/// Result shared by every request attached to one coalesce slot.
#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    /// Response body; chat and completion callers decode their own shape.
    pub response: serde_json::Value,
    pub decision: CacheDecision,
    pub similarity: Option<f32>,
    pub source: CredentialSource,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

pub struct ProxyPipeline {
    store: Arc<dyn ProjectStore>,
    resolver: CredentialResolver,
    cache: SemanticCache,
    coalescer: RequestCoalescer<DispatchOutcome>,
    upstream: Arc<dyn Upstream>,
    emitter: EventEmitter,
    pricing: PriceTable,
    sanitizer: Sanitizer,
    metrics: Arc<GatewayMetrics>,
    deadline: Duration,
    provider_overrides: std::collections::HashMap<String, Provider>,
}

impl ProxyPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ProjectStore>,
        resolver: CredentialResolver,
        cache: SemanticCache,
        upstream: Arc<dyn Upstream>,
        emitter: EventEmitter,
        metrics: Arc<GatewayMetrics>,
        deadline: Duration,
        truncate_len: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            cache,
            coalescer: RequestCoalescer::new(),
            upstream,
            emitter,
            pricing: PriceTable::new(),
            sanitizer: Sanitizer::new(truncate_len),
            metrics,
            deadline,
            provider_overrides: std::collections::HashMap::new(),
        }
    }

    pub fn pricing(&self) -> &PriceTable {
        &self.pricing
    }

    pub fn coalesce_snapshot(&self) -> CoalesceSnapshot {
        self.coalescer.snapshot()
    }

    pub async fn authenticate(&self, api_key: &str) -> Result<Project, GatewayError> {
        self.store.authenticate(api_key).await
    }

    /// Non-streaming chat entry point.
    pub async fn chat(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        validate_chat(&request, &self.pricing)?;

        let start = Instant::now();
        let project = self.store.authenticate(api_key).await?;
        let provider = provider_for_model(&request.model, &self.provider_overrides);
        let resolved = self.resolver.resolve(&project, provider, &request.model).await?;
        let source = resolved.source;

        let canonical = canonicalize_messages(&request.messages);
        let fp = fingerprint(&project.id, provider.as_str(), &request.model, &canonical, false);

        let produced = Arc::new(AtomicBool::new(false));
        let producer_flag = produced.clone();
        let deadline = self.deadline;
        let prompt = request.prompt_text();

        let work = {
            let project = project.clone();
            let request = request.clone();
            let prompt = prompt.clone();
            async move {
                producer_flag.store(true, Ordering::SeqCst);
                self.dispatch_chat(&project, provider, &resolved.secret, source, &request, &prompt)
                    .await
            }
        };

        // The deadline is applied inside the producer so expiry resolves the
        // slot with a timeout every waiter observes; each waiter carries the
        // same bound independently.
        let producer = async {
            match timeout(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            }
        };

        // The waiter-side bound sits above the producer's so the slot
        // resolves with Timeout before any waiter gives up on its own.
        let result = match timeout(
            deadline + Duration::from_secs(1),
            self.coalescer.coalesce(fp, producer),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        let was_producer = produced.load(Ordering::SeqCst);
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                let response: ChatResponse = serde_json::from_value(outcome.response.clone())
                    .map_err(GatewayError::internal)?;
                self.emit_success(
                    &project, &request.model, &prompt, response.content(), &outcome,
                    was_producer, latency_ms,
                );
                self.metrics
                    .requests_total
                    .with_label_values(&["chat", "200"])
                    .inc();
                Ok(response)
            }
            Err(err) => {
                self.emit_failure(&project, &request.model, &prompt, &err, source, latency_ms);
                self.metrics
                    .requests_total
                    .with_label_values(&["chat", "error"])
                    .inc();
                Err(err)
            }
        }
    }

    /// Cache lookup plus upstream dispatch; runs once per coalesce slot.
    async fn dispatch_chat(
        &self,
        project: &Project,
        provider: Provider,
        secret: &secrecy::SecretString,
        source: CredentialSource,
        request: &ChatRequest,
        prompt: &str,
    ) -> Result<DispatchOutcome, GatewayError> {
        let lookup = self
            .cache
            .lookup(&project.id, "chat", &request.model, prompt, project.cache_threshold)
            .await;

        if let CacheOutcome::Hit { payload, similarity, decision } = lookup {
            self.metrics
                .cache_decisions
                .with_label_values(&[decision.as_str()])
                .inc();
            return Ok(DispatchOutcome {
                response: payload.response,
                decision,
                similarity: Some(similarity),
                source,
                tokens_in: payload.tokens_in,
                tokens_out: payload.tokens_out,
            });
        }

        self.metrics.cache_decisions.with_label_values(&["miss"]).inc();

        let upstream_start = Instant::now();
        let response = self.upstream.chat(provider, secret, request).await?;
        self.metrics
            .upstream_latency_seconds
            .observe(upstream_start.elapsed().as_secs_f64());

        let tokens_in = response.usage.prompt_tokens;
        let tokens_out = response.usage.completion_tokens;
        let value = serde_json::to_value(&response).map_err(GatewayError::internal)?;

        // Best-effort population; a failure here must not fail the response.
        self.cache
            .store(
                &project.id,
                "chat",
                &request.model,
                prompt,
                CachedPayload {
                    response: value.clone(),
                    model: request.model.clone(),
                    tokens_in,
                    tokens_out,
                },
            )
            .await;

        Ok(DispatchOutcome {
            response: value,
            decision: CacheDecision::Miss,
            similarity: None,
            source,
            tokens_in,
            tokens_out,
        })
    }

    /// Legacy text completions, OpenAI-style providers only. Cached under
    /// its own partition; not coalesced.
    pub async fn completion(
        &self,
        api_key: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        validate_completion(&request, &self.pricing)?;

        let start = Instant::now();
        let project = self.store.authenticate(api_key).await?;
        let provider = provider_for_model(&request.model, &self.provider_overrides);
        let resolved = self.resolver.resolve(&project, provider, &request.model).await?;
        let source = resolved.source;

        let work = async {
            let lookup = self
                .cache
                .lookup(
                    &project.id,
                    "completion",
                    &request.model,
                    &request.prompt,
                    project.cache_threshold,
                )
                .await;

            if let CacheOutcome::Hit { payload, similarity, decision } = lookup {
                return Ok(DispatchOutcome {
                    response: payload.response,
                    decision,
                    similarity: Some(similarity),
                    source,
                    tokens_in: payload.tokens_in,
                    tokens_out: payload.tokens_out,
                });
            }

            let response = self.upstream.completion(provider, &resolved.secret, &request).await?;
            let tokens_in = response.usage.prompt_tokens;
            let tokens_out = response.usage.completion_tokens;
            let value = serde_json::to_value(&response).map_err(GatewayError::internal)?;

            self.cache
                .store(
                    &project.id,
                    "completion",
                    &request.model,
                    &request.prompt,
                    CachedPayload {
                        response: value.clone(),
                        model: request.model.clone(),
                        tokens_in,
                        tokens_out,
                    },
                )
                .await;

            Ok(DispatchOutcome {
                response: value,
                decision: CacheDecision::Miss,
                similarity: None,
                source,
                tokens_in,
                tokens_out,
            })
        };

        let result = match timeout(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                let response: CompletionResponse =
                    serde_json::from_value(outcome.response.clone())
                        .map_err(GatewayError::internal)?;
                let text = response
                    .choices
                    .first()
                    .map(|c| c.text.clone())
                    .unwrap_or_default();
                self.emit_success(
                    &project, &request.model, &request.prompt, &text, &outcome, true, latency_ms,
                );
                self.metrics
                    .requests_total
                    .with_label_values(&["completion", "200"])
                    .inc();
                Ok(response)
            }
            Err(err) => {
                self.emit_failure(
                    &project, &request.model, &request.prompt, &err, source, latency_ms,
                );
                self.metrics
                    .requests_total
                    .with_label_values(&["completion", "error"])
                    .inc();
                Err(err)
            }
        }
    }

    /// Embeddings passthrough. No caching, no coalescing.
    pub async fn embeddings(
        &self,
        api_key: &str,
        request: EmbeddingsRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        validate_embeddings(&request)?;

        let project = self.store.authenticate(api_key).await?;
        let provider = provider_for_model(&request.model, &self.provider_overrides);
        let resolved = self.resolver.resolve(&project, provider, &request.model).await?;

        match timeout(
            self.deadline,
            self.upstream.embeddings(provider, &resolved.secret, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Streaming chat. Streaming requests never share a slot with
    /// non-streaming ones and each runs its own upstream call; the SSE body
    /// is relayed as-is.
    pub async fn chat_stream(
        &self,
        api_key: &str,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, GatewayError>>, GatewayError> {
        validate_chat(&request, &self.pricing)?;

        let start = Instant::now();
        let project = self.store.authenticate(api_key).await?;
        let provider = provider_for_model(&request.model, &self.provider_overrides);
        let resolved = self.resolver.resolve(&project, provider, &request.model).await?;

        let stream = match timeout(
            self.deadline,
            self.upstream.chat_stream(provider, &resolved.secret, &request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(GatewayError::Timeout),
        };

        // Token usage is unknown for a relayed stream; the event records the
        // dispatch itself.
        let mut event = self.base_event(&project.id, &request.model, &request.prompt_text());
        event.latency_ms = start.elapsed().as_millis() as u64;
        event.tags.push("streaming".to_string());
        event.tags.push(resolved.source.as_str().to_string());
        self.emitter.emit(event);
        self.metrics
            .requests_total
            .with_label_values(&["chat_stream", "200"])
            .inc();

        Ok(stream)
    }

    fn base_event(&self, project_id: &str, model: &str, prompt: &str) -> NormalizedEvent {
        let mut event = NormalizedEvent::new(project_id, EventType::PromptCall);
        event.model = model.to_string();
        event.prompt = self.sanitizer.sanitize_raw(prompt).0;
        event.tags.push(model_family(model).to_string());
        if !self.pricing.is_known_model(model) {
            event.tags.push(UNKNOWN_MODEL_TAG.to_string());
        }
        event
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_success(
        &self,
        project: &Project,
        model: &str,
        prompt: &str,
        response_text: &str,
        outcome: &DispatchOutcome,
        was_producer: bool,
        latency_ms: u64,
    ) {
        let potential = self
            .pricing
            .estimate(model, outcome.tokens_in, outcome.tokens_out);
        // Only the producer of a miss actually paid for an upstream call.
        let cost = if outcome.decision != CacheDecision::Miss || !was_producer {
            0.0
        } else {
            potential
        };

        let mut event = self.base_event(&project.id, model, prompt);
        event.response = self.sanitizer.sanitize_raw(response_text).0;
        event.tokens_in = outcome.tokens_in;
        event.tokens_out = outcome.tokens_out;
        event.cost_usd = cost;
        event.potential_cost_usd = potential;
        event.latency_ms = latency_ms;
        event.cache_decision = outcome.decision;
        event.cache_similarity = outcome.similarity;
        event.tags.push(format!("cache_decision:{}", outcome.decision.as_str()));
        event.tags.push(outcome.source.as_str().to_string());
        if !was_producer {
            event.tags.push("coalesced".to_string());
        }

        debug!(
            project_id = %project.id,
            model,
            decision = outcome.decision.as_str(),
            cost_usd = cost,
            "request completed"
        );
        self.emitter.emit(event);
    }

    fn emit_failure(
        &self,
        project: &Project,
        model: &str,
        prompt: &str,
        err: &GatewayError,
        source: CredentialSource,
        latency_ms: u64,
    ) {
        let mut event = self.base_event(&project.id, model, prompt);
        event.event_type = EventType::Error;
        event.status = match err {
            GatewayError::Timeout => EventStatus::Timeout,
            _ => EventStatus::Error,
        };
        event.error_message = Some(self.sanitizer.sanitize_text(&err.to_string()));
        event.latency_ms = latency_ms;
        event.tags.push(source.as_str().to_string());

        warn!(project_id = %project.id, model, error = %err, "request failed");
        self.emitter.emit(event);
    }
}
