//! Request validation applied before any I/O
//!
//! Limits:
//! - body size capped at 1 MB (enforced as a body-limit layer and re-checked
//!   here for embedded payloads)
//! - 1..=100 messages, each content up to 100,000 chars
//! - roles restricted to the known set
//! - temperature in [0, 2], max_tokens in [1, 128000]
//! - up to 10 stop sequences, up to 50 tools

use thiserror::Error;

use crate::error::GatewayError;
use crate::pricing::{is_free_model, PriceTable};
use crate::upstream::{ChatRequest, CompletionRequest, EmbeddingsInput, EmbeddingsRequest};

/// Maximum request body size (1 MB).
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

pub const MAX_MESSAGES: usize = 100;
pub const MAX_CONTENT_CHARS: usize = 100_000;
pub const MAX_STOP_SEQUENCES: usize = 10;
pub const MAX_TOOLS: usize = 50;
pub const MAX_OUTPUT_TOKENS: u32 = 128_000;

const ALLOWED_ROLES: &[&str] = &["system", "user", "assistant", "function", "tool"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("model must be a non-empty string")]
    EmptyModel,

    #[error("model \"{0}\" is not in the allowed model list")]
    UnknownModel(String),

    #[error("messages must contain between 1 and {MAX_MESSAGES} entries")]
    MessageCount,

    #[error("message content exceeds {MAX_CONTENT_CHARS} characters")]
    ContentTooLong,

    #[error("invalid message role: {0}")]
    InvalidRole(String),

    #[error("temperature must be between 0 and 2")]
    Temperature,

    #[error("max_tokens must be between 1 and {MAX_OUTPUT_TOKENS}")]
    MaxTokens,

    #[error("stop accepts at most {MAX_STOP_SEQUENCES} sequences")]
    StopSequences,

    #[error("tools accepts at most {MAX_TOOLS} entries")]
    Tools,

    #[error("input must not be empty")]
    EmptyInput,
}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        GatewayError::Validation(err.to_string())
    }
}

fn validate_model(model: &str, table: &PriceTable) -> Result<(), ValidationError> {
    if model.trim().is_empty() {
        return Err(ValidationError::EmptyModel);
    }
    if !table.is_known_model(model) && !is_free_model(model) {
        return Err(ValidationError::UnknownModel(model.to_string()));
    }
    Ok(())
}

fn validate_sampling(
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> Result<(), ValidationError> {
    if let Some(t) = temperature {
        if !(0.0..=2.0).contains(&t) || t.is_nan() {
            return Err(ValidationError::Temperature);
        }
    }
    if let Some(m) = max_tokens {
        if !(1..=MAX_OUTPUT_TOKENS).contains(&m) {
            return Err(ValidationError::MaxTokens);
        }
    }
    Ok(())
}

pub fn validate_chat(request: &ChatRequest, table: &PriceTable) -> Result<(), ValidationError> {
    validate_model(&request.model, table)?;

    if request.messages.is_empty() || request.messages.len() > MAX_MESSAGES {
        return Err(ValidationError::MessageCount);
    }
    for message in &request.messages {
        if message.content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ValidationError::ContentTooLong);
        }
        if !ALLOWED_ROLES.contains(&message.role.as_str()) {
            return Err(ValidationError::InvalidRole(message.role.clone()));
        }
    }

    validate_sampling(request.temperature, request.max_tokens)?;

    if let Some(stop) = &request.stop {
        if stop.len() > MAX_STOP_SEQUENCES {
            return Err(ValidationError::StopSequences);
        }
    }
    if let Some(tools) = &request.tools {
        if tools.len() > MAX_TOOLS {
            return Err(ValidationError::Tools);
        }
    }
    Ok(())
}

pub fn validate_completion(
    request: &CompletionRequest,
    table: &PriceTable,
) -> Result<(), ValidationError> {
    validate_model(&request.model, table)?;
    if request.prompt.is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if request.prompt.chars().count() > MAX_CONTENT_CHARS {
        return Err(ValidationError::ContentTooLong);
    }
    validate_sampling(request.temperature, request.max_tokens)?;
    if let Some(stop) = &request.stop {
        if stop.len() > MAX_STOP_SEQUENCES {
            return Err(ValidationError::StopSequences);
        }
    }
    Ok(())
}

pub fn validate_embeddings(request: &EmbeddingsRequest) -> Result<(), ValidationError> {
    if request.model.trim().is_empty() {
        return Err(ValidationError::EmptyModel);
    }
    match &request.input {
        EmbeddingsInput::One(s) if s.is_empty() => Err(ValidationError::EmptyInput),
        EmbeddingsInput::Many(list) if list.is_empty() => Err(ValidationError::EmptyInput),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{ChatMessage, StopSequences};

    fn chat_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            temperature: Some(1.0),
            max_tokens: Some(256),
            stop: None,
            stream: None,
            tools: None,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_chat(&chat_request(), &PriceTable::new()).is_ok());
    }

    #[test]
    fn test_empty_and_unknown_model() {
        let table = PriceTable::new();
        let mut request = chat_request();
        request.model = "  ".to_string();
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::EmptyModel)
        ));

        request.model = "not-a-model".to_string();
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_free_suffix_models_pass_the_allowlist() {
        let mut request = chat_request();
        request.model = "mistralai/mistral-7b-instruct:free".to_string();
        assert!(validate_chat(&request, &PriceTable::new()).is_ok());
    }

    #[test]
    fn test_message_count_bounds() {
        let table = PriceTable::new();
        let mut request = chat_request();
        request.messages.clear();
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::MessageCount)
        ));

        let message = ChatMessage { role: "user".to_string(), content: "x".to_string() };
        request.messages = vec![message; MAX_MESSAGES + 1];
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::MessageCount)
        ));
    }

    #[test]
    fn test_role_and_content_limits() {
        let table = PriceTable::new();
        let mut request = chat_request();
        request.messages[0].role = "wizard".to_string();
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::InvalidRole(_))
        ));

        let mut request = chat_request();
        request.messages[0].content = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::ContentTooLong)
        ));
    }

    #[test]
    fn test_sampling_ranges() {
        let table = PriceTable::new();
        let mut request = chat_request();
        request.temperature = Some(2.5);
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::Temperature)
        ));

        let mut request = chat_request();
        request.max_tokens = Some(0);
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::MaxTokens)
        ));

        let mut request = chat_request();
        request.max_tokens = Some(MAX_OUTPUT_TOKENS + 1);
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::MaxTokens)
        ));
    }

    #[test]
    fn test_stop_and_tools_caps() {
        let table = PriceTable::new();
        let mut request = chat_request();
        request.stop = Some(StopSequences::Many(vec!["s".to_string(); 11]));
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::StopSequences)
        ));

        let mut request = chat_request();
        request.tools = Some(vec![serde_json::json!({}); MAX_TOOLS + 1]);
        assert!(matches!(
            validate_chat(&request, &table),
            Err(ValidationError::Tools)
        ));
    }

    #[test]
    fn test_embeddings_input() {
        let ok = EmbeddingsRequest {
            model: "text-embedding-3-small".to_string(),
            input: EmbeddingsInput::One("hello".to_string()),
        };
        assert!(validate_embeddings(&ok).is_ok());

        let empty = EmbeddingsRequest {
            model: "text-embedding-3-small".to_string(),
            input: EmbeddingsInput::Many(vec![]),
        };
        assert!(matches!(
            validate_embeddings(&empty),
            Err(ValidationError::EmptyInput)
        ));
    }
}
