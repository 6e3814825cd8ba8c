//! Gateway error types and the single JSON error envelope
//!
//! Every failure leaving the HTTP surface is rendered as
//! `{"error": "<message>"}` with the matching status code. Internal causes
//! are logged and never returned to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

/// Errors produced anywhere in the request pipeline.
///
/// The enum is `Clone` so a coalesced producer failure can fan out to every
/// waiter unchanged.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("BYOK Required: The model \"{model}\" is a paid model. Add a provider credential for your project to use it.")]
    PaidModelRequiresByok { model: String },

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("streaming is not supported for {0}")]
    StreamingNotSupported(String),

    #[error("internal server error")]
    Internal(String),
}

impl GatewayError {
    /// Wrap an unexpected failure, keeping the cause for the log only.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PaidModelRequiresByok { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::StreamingNotSupported(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // The internal cause goes to the log, the client gets a generic line.
        let message = match &self {
            Self::Internal(cause) => {
                error!(cause = %cause, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Unauthorized("no key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("wrong project".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(GatewayError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let err = GatewayError::Upstream {
            status: 429,
            body: "rate limited".into(),
        };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_byok_message_names_model() {
        let err = GatewayError::PaidModelRequiresByok {
            model: "gpt-4o".into(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("BYOK Required"));
        assert!(msg.contains("\"gpt-4o\""));
    }
}
