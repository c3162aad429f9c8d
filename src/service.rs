//! Orchestration facade used by the transport layer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::{ChatProvider, ChatStream, ProviderKind, ProviderRegistry};

/// Validates a request, resolves its provider and delegates to it.
///
/// Errors from resolution or the provider are wrapped with the requested
/// model but keep their kind. Normalization lives in the adapters.
#[derive(Debug, Clone)]
pub struct ChatService {
    registry: Arc<ProviderRegistry>,
}

impl ChatService {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Provider kinds that have a credential.
    pub fn providers(&self) -> Vec<ProviderKind> {
        self.registry.kinds()
    }

    /// Blocking completion.
    pub async fn complete(
        &self,
        ctx: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        request.validate()?;
        let model = request.model.as_str();
        let provider = self.registry.resolve(model).map_err(|e| e.for_model(model))?;

        tracing::debug!(model = %model, provider = %provider.kind(), "Dispatching completion");
        provider
            .complete(ctx, request)
            .await
            .map_err(|e| e.for_model(model))
    }

    /// Streaming completion. Chunks and the terminal error arrive on the
    /// returned [`ChatStream`]; `ctx` stops the producer when cancelled.
    pub fn complete_stream(
        &self,
        ctx: CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatStream> {
        request.validate()?;
        let model = request.model.as_str();
        let provider = self.registry.resolve(model).map_err(|e| e.for_model(model))?;

        tracing::debug!(model = %model, provider = %provider.kind(), "Dispatching stream");
        provider
            .complete_stream(ctx, request)
            .map_err(|e| e.for_model(model))
    }
}
