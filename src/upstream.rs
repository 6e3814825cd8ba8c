//! Upstream provider routing and wire translation
//!
//! The gateway speaks one normalized (OpenAI-shaped) request format on its
//! own surface. This module picks the provider for a model, translates the
//! normalized request to the provider's wire shape, and maps the response
//! back. Groq and OpenRouter are OpenAI-compatible on the wire; Anthropic
//! needs its own translation and does not support streaming through the
//! gateway.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::GatewayError;

/// Maximum upstream error body carried back to the client.
const ERROR_BODY_LIMIT: usize = 2048;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Supported upstream providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Groq,
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Groq => "groq",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    /// Providers whose wire format is already OpenAI-compatible can stream
    /// straight through.
    pub fn openai_compatible(&self) -> bool {
        !matches!(self, Self::Anthropic)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Normalized wire types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Stop sequences accept both the single-string and list forms.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(list) => list.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Concatenated user-visible prompt text, used for cache keys and
    /// embeddings.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    One(String),
    Many(Vec<String>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingsInput,
}

// ---------------------------------------------------------------------------
// Provider selection
// ---------------------------------------------------------------------------

/// Pick the provider for a model: the explicit map first, then prefix rules.
/// Slash-containing model names route to the aggregator.
pub fn provider_for_model(model: &str, overrides: &HashMap<String, Provider>) -> Provider {
    if let Some(provider) = overrides.get(model) {
        return *provider;
    }
    if model.contains('/') {
        return Provider::OpenRouter;
    }
    if model.starts_with("gpt-") || model.starts_with("o1") {
        return Provider::OpenAi;
    }
    if model.starts_with("claude-") {
        return Provider::Anthropic;
    }
    if model.starts_with("llama") || model.starts_with("mixtral") || model.starts_with("gemma") {
        return Provider::Groq;
    }
    Provider::OpenAi
}

// ---------------------------------------------------------------------------
// Upstream client
// ---------------------------------------------------------------------------

/// Dispatch interface the pipeline depends on; the concrete router below is
/// the production implementation, tests substitute counting mocks.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn chat(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError>;

    async fn chat_stream(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, GatewayError>>, GatewayError>;

    async fn completion(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError>;

    async fn embeddings(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &EmbeddingsRequest,
    ) -> Result<serde_json::Value, GatewayError>;
}

/// Stateless HTTP client for all four providers. Transient network errors
/// are not retried here.
pub struct UpstreamRouter {
    client: reqwest::Client,
    base_urls: HashMap<Provider, String>,
}

impl UpstreamRouter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, base_urls: HashMap::new() }
    }

    /// Override a provider's base URL, mainly for tests pointing at a local
    /// mock server.
    pub fn with_base_url(mut self, provider: Provider, url: impl Into<String>) -> Self {
        self.base_urls.insert(provider, url.into());
        self
    }

    fn base_url(&self, provider: Provider) -> String {
        self.base_urls
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| provider.base_url().to_string())
    }

    async fn error_from_response(response: reqwest::Response) -> GatewayError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        GatewayError::Upstream { status, body: excerpt }
    }

    fn anthropic_body(request: &ChatRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(1024),
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.join("\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = serde_json::json!(stop.to_vec());
        }
        body
    }

    fn chat_response_from_anthropic(value: serde_json::Value) -> Result<ChatResponse, GatewayError> {
        let content = value["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b["type"] == "text")
                    .and_then(|b| b["text"].as_str())
            })
            .unwrap_or_default()
            .to_string();

        let prompt_tokens = value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        let finish_reason = value["stop_reason"].as_str().map(|reason| {
            match reason {
                "end_turn" => "stop",
                "max_tokens" => "length",
                other => other,
            }
            .to_string()
        });

        Ok(ChatResponse {
            id: value["id"].as_str().unwrap_or_default().to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: value["model"].as_str().unwrap_or_default().to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage { role: "assistant".to_string(), content },
                finish_reason,
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}

#[async_trait]
impl Upstream for UpstreamRouter {
    async fn chat(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &ChatRequest,
    ) -> Result<ChatResponse, GatewayError> {
        debug!(provider = %provider, model = %request.model, "dispatching chat request");

        if provider == Provider::Anthropic {
            let response = self
                .client
                .post(format!("{}/messages", self.base_url(provider)))
                .header("x-api-key", secret.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&Self::anthropic_body(request))
                .send()
                .await
                .map_err(GatewayError::internal)?;

            if !response.status().is_success() {
                return Err(Self::error_from_response(response).await);
            }
            let value: serde_json::Value =
                response.json().await.map_err(GatewayError::internal)?;
            return Self::chat_response_from_anthropic(value);
        }

        let mut body = request.clone();
        body.stream = None;
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url(provider)))
            .bearer_auth(secret.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::internal)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        response.json().await.map_err(GatewayError::internal)
    }

    async fn chat_stream(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<Bytes, GatewayError>>, GatewayError> {
        if !provider.openai_compatible() {
            return Err(GatewayError::StreamingNotSupported(provider.to_string()));
        }

        let mut body = request.clone();
        body.stream = Some(true);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url(provider)))
            .bearer_auth(secret.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::internal)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        // The provider already emits OpenAI-shaped SSE frames; relay the
        // bytes without reframing.
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::internal));
        Ok(stream.boxed())
    }

    async fn completion(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, GatewayError> {
        if !provider.openai_compatible() {
            return Err(GatewayError::Validation(format!(
                "legacy completions are not supported for provider {provider}"
            )));
        }

        let response = self
            .client
            .post(format!("{}/completions", self.base_url(provider)))
            .bearer_auth(secret.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(GatewayError::internal)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        response.json().await.map_err(GatewayError::internal)
    }

    async fn embeddings(
        &self,
        provider: Provider,
        secret: &SecretString,
        request: &EmbeddingsRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        if !provider.openai_compatible() {
            return Err(GatewayError::Validation(format!(
                "embeddings are not supported for provider {provider}"
            )));
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url(provider)))
            .bearer_auth(secret.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(GatewayError::internal)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        response.json().await.map_err(GatewayError::internal)
    }
}
