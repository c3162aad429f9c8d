//! Error types for llm-router.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::providers::ProviderKind;

/// Result type alias for llm-router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for llm-router.
///
/// Every variant is scoped to the single request that produced it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid request: unsupported message role '{role}'")]
    UnsupportedRole { role: String },

    #[error("Provider '{provider}' is not configured (model '{model}')")]
    ProviderNotFound { provider: ProviderKind, model: String },

    #[error("Upstream {provider} request for model '{model}' failed{}: {message}", status_suffix(.status))]
    Upstream {
        provider: ProviderKind,
        model: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{provider} stream failed: {message}")]
    StreamProtocol {
        provider: ProviderKind,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request cancelled or deadline exceeded")]
    Cancelled,

    #[error("Request for model '{model}' failed: {source}")]
    Request {
        model: String,
        #[source]
        source: Box<Error>,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {}", s)).unwrap_or_default()
}

impl Error {
    /// Attach the requested model to an error without changing its kind.
    pub fn for_model(self, model: &str) -> Self {
        match self {
            // Already carries request context.
            Error::Request { .. } => self,
            other => Error::Request {
                model: model.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any [`Error::Request`] context peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::Request { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status the transport reports for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            Error::Validation(_) | Error::UnsupportedRole { .. } => StatusCode::BAD_REQUEST,
            Error::ProviderNotFound { .. } => StatusCode::BAD_REQUEST,
            Error::Upstream { .. } | Error::StreamProtocol { .. } => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error type for the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Validation(_) | Error::UnsupportedRole { .. } => "invalid_request_error",
            Error::ProviderNotFound { .. } => "provider_not_found",
            Error::Upstream { .. } => "upstream_error",
            Error::StreamProtocol { .. } => "stream_error",
            Error::Serialization(_) => "serialization_error",
            Error::Cancelled => "cancelled",
            Error::Request { .. } => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Return OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
