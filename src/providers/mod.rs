//! Provider abstraction.
//!
//! Each upstream vendor is an adapter that implements [`ChatProvider`]. The
//! set of adapters is closed: [`Provider`] is the tagged union the registry
//! hands out, and it delegates to the adapter it wraps.

pub mod anthropic;
pub mod openai;
mod registry;
pub mod stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{ChatRequest, ChatResponse};

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;
pub use stream::ChatStream;

/// The provider families this router can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::OpenAi, ProviderKind::Anthropic];

    /// Configuration name of this provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Parse a configuration name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            _ => None,
        }
    }

    /// Pick the provider family for a model identifier by prefix.
    ///
    /// `gpt*` goes to OpenAI and `claude*` to Anthropic. Anything else falls
    /// back to OpenAI, so an unrecognized prefix never fails here; a missing
    /// credential for the chosen family is reported by the registry instead.
    pub fn for_model(model: &str) -> Self {
        let model = model.to_lowercase();
        if model.starts_with("gpt") {
            ProviderKind::OpenAi
        } else if model.starts_with("claude") {
            ProviderKind::Anthropic
        } else {
            ProviderKind::OpenAi
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability every provider adapter satisfies.
///
/// Implementations hold no per-request state and are shared between
/// concurrent requests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Which provider family this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Run a blocking completion.
    ///
    /// Message roles are checked before any network call. Cancelling `ctx`
    /// abandons the upstream call with [`crate::Error::Cancelled`].
    async fn complete(&self, ctx: &CancellationToken, request: &ChatRequest)
        -> Result<ChatResponse>;

    /// Start a streaming completion.
    ///
    /// Returns as soon as the request has been checked; the upstream call and
    /// event translation run on a spawned task that stops when `ctx` is
    /// cancelled or the returned stream is dropped.
    fn complete_stream(&self, ctx: CancellationToken, request: &ChatRequest) -> Result<ChatStream>;
}

/// A configured provider adapter.
#[derive(Debug, Clone)]
pub enum Provider {
    OpenAi(OpenAiProvider),
    Anthropic(AnthropicProvider),
}

#[async_trait]
impl ChatProvider for Provider {
    fn kind(&self) -> ProviderKind {
        match self {
            Provider::OpenAi(p) => p.kind(),
            Provider::Anthropic(p) => p.kind(),
        }
    }

    async fn complete(
        &self,
        ctx: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        match self {
            Provider::OpenAi(p) => p.complete(ctx, request).await,
            Provider::Anthropic(p) => p.complete(ctx, request).await,
        }
    }

    fn complete_stream(&self, ctx: CancellationToken, request: &ChatRequest) -> Result<ChatStream> {
        match self {
            Provider::OpenAi(p) => p.complete_stream(ctx, request),
            Provider::Anthropic(p) => p.complete_stream(ctx, request),
        }
    }
}

/// Map an HTTP failure from `reqwest` into an upstream error.
pub(crate) fn upstream_error(provider: ProviderKind, model: &str, err: reqwest::Error) -> crate::Error {
    crate::Error::Upstream {
        provider,
        model: model.to_string(),
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Reject a non-2xx response, capturing its status and body.
pub(crate) async fn check_status(
    provider: ProviderKind,
    model: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(
        provider = %provider,
        model = %model,
        status = %status,
        body = %body,
        "Provider returned error"
    );
    Err(crate::Error::Upstream {
        provider,
        model: model.to_string(),
        status: Some(status.as_u16()),
        message: body,
    })
}
