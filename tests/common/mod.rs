//! Shared fixtures for the integration suites
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llm_gateway::analytics::MemoryEventSink;
use llm_gateway::config::PoolKeys;
use llm_gateway::credentials::{CredentialCipher, CredentialResolver};
use llm_gateway::embedding::Embedder;
use llm_gateway::error::GatewayError;
use llm_gateway::events::EventEmitter;
use llm_gateway::metrics::GatewayMetrics;
use llm_gateway::pipeline::ProxyPipeline;
use llm_gateway::project_store::{MemoryProjectStore, Project, ProjectStore, ProviderCredential};
use llm_gateway::semantic_cache::SemanticCache;
use llm_gateway::upstream::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, CompletionChoice, CompletionRequest,
    CompletionResponse, EmbeddingsRequest, Provider, Upstream, Usage,
};
use llm_gateway::vector_store::MemoryVectorStore;

pub const TEST_PASSPHRASE: &str = "integration-test-passphrase";

/// Upstream double that counts invocations and answers with a fixed body
/// after an optional delay.
pub struct MockUpstream {
    calls: AtomicU64,
    delay: Duration,
    content: String,
    fail_status: Option<u16>,
}

impl MockUpstream {
    pub fn new(content: &str) -> Self {
        Self {
            calls: AtomicU64::new(0),
            delay: Duration::ZERO,
            content: content.to_string(),
            fail_status: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn chat(
        &self,
        _provider: Provider,
        _secret: &SecretString,
        request: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if let Some(status) = self.fail_status {
            return Err(GatewayError::Upstream { status, body: "mock upstream failure".to_string() });
        }

        Ok(ChatResponse {
            id: format!("mock-{call}"),
            object: "chat.completion".to_string(),
            created: 1_750_000_000,
            model: request.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: self.content.clone(),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage { prompt_tokens: 100, completion_tokens: 50, total_tokens: 150 },
        })
    }

    async fn chat_stream(
        &self,
        _provider: Provider,
        _secret: &SecretString,
        _request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, GatewayError>>, GatewayError> {
        Err(GatewayError::StreamingNotSupported("mock".to_string()))
    }

    async fn completion(
        &self,
        _provider: Provider,
        _secret: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        Ok(CompletionResponse {
            id: format!("mock-completion-{call}"),
            object: "text_completion".to_string(),
            created: 1_750_000_000,
            model: request.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                text: self.content.clone(),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Usage { prompt_tokens: 20, completion_tokens: 10, total_tokens: 30 },
        })
    }

    async fn embeddings(
        &self,
        _provider: Provider,
        _secret: &SecretString,
        _request: &EmbeddingsRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "data": [{ "embedding": [0.0, 1.0] }] }))
    }
}

pub struct TestHarness {
    pub pipeline: Arc<ProxyPipeline>,
    pub store: Arc<MemoryProjectStore>,
    pub sink: Arc<MemoryEventSink>,
    pub upstream: Arc<MockUpstream>,
}

/// Build a pipeline over in-memory collaborators and the given upstream
/// mock. Must run inside a tokio runtime (the emitter spawns its drain
/// task).
pub fn harness(
    embedder: Arc<dyn Embedder>,
    upstream: Arc<MockUpstream>,
    pool: PoolKeys,
    deadline: Duration,
) -> TestHarness {
    let store = Arc::new(MemoryProjectStore::new());
    let sink = Arc::new(MemoryEventSink::new());
    let metrics = Arc::new(GatewayMetrics::new().expect("metrics registry"));
    let emitter = EventEmitter::new(sink.clone(), 256);

    let resolver = CredentialResolver::new(
        store.clone(),
        CredentialCipher::from_passphrase(TEST_PASSPHRASE),
        pool,
    );
    let cache = SemanticCache::new(
        embedder,
        Arc::new(MemoryVectorStore::new()),
        10_000,
        Duration::from_secs(3600),
        2000,
    );

    let pipeline = Arc::new(ProxyPipeline::new(
        store.clone() as Arc<dyn ProjectStore>,
        resolver,
        cache,
        upstream.clone(),
        emitter,
        metrics,
        deadline,
        2000,
    ));

    TestHarness { pipeline, store, sink, upstream }
}

/// Register a project and return its API key.
pub fn add_project(store: &MemoryProjectStore, project_id: &str) -> String {
    let api_key = format!("sk-test-{project_id}");
    store.add_project(api_key.clone(), Project::new(project_id));
    api_key
}

/// Attach a decryptable BYOK credential to a project.
pub fn add_byok(store: &MemoryProjectStore, project_id: &str, provider: Provider, secret: &str) {
    let cipher = CredentialCipher::from_passphrase(TEST_PASSPHRASE);
    let (ciphertext, iv) = cipher.encrypt(secret).expect("encrypt");
    store.add_credential(
        project_id,
        ProviderCredential {
            provider,
            priority: 1,
            ciphertext,
            iv,
            active: true,
            last_used_at: None,
        },
    );
}

pub fn chat_request(model: &str, prompt: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage { role: "user".to_string(), content: prompt.to_string() }],
        temperature: Some(1.0),
        max_tokens: Some(256),
        stop: None,
        stream: None,
        tools: None,
    }
}
