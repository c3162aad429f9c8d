//! Model-to-provider resolution.

use std::collections::HashMap;

use super::{AnthropicProvider, ChatProvider, OpenAiProvider, Provider, ProviderKind};
use crate::config::{ApiKey, ProviderConfig, ProvidersConfig};
use crate::error::{Error, Result};

/// Immutable set of configured provider adapters, built once at startup.
///
/// Lookups take `&self` only, so a registry behind an `Arc` is shared by all
/// requests without locking.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Provider>,
}

impl ProviderRegistry {
    /// Build from a provider name -> credential mapping.
    ///
    /// Providers without a credential are simply not registered. Unknown
    /// names are ignored with a warning.
    pub fn from_credentials<I, K>(credentials: I) -> Self
    where
        I: IntoIterator<Item = (K, ApiKey)>,
        K: AsRef<str>,
    {
        let mut registry = Self::default();
        for (name, api_key) in credentials {
            match ProviderKind::from_name(name.as_ref()) {
                Some(kind) => registry.insert(build(kind, api_key, None, reqwest::Client::new())),
                None => tracing::warn!(provider = %name.as_ref(), "Ignoring unknown provider"),
            }
        }
        registry
    }

    /// Build from configuration, sharing one HTTP client between adapters.
    pub fn from_config(config: &ProvidersConfig, client: reqwest::Client) -> Self {
        let mut registry = Self::default();
        for kind in ProviderKind::ALL {
            let settings = config.get(kind);
            match &settings.api_key {
                Some(api_key) => {
                    registry.insert(build(kind, api_key.clone(), Some(settings), client.clone()))
                }
                None => tracing::info!(
                    provider = %kind,
                    "No API key configured - provider not registered"
                ),
            }
        }
        registry
    }

    /// Register an adapter, replacing any existing one of the same kind.
    pub fn insert(&mut self, provider: Provider) {
        let kind = provider.kind();
        tracing::info!(provider = %kind, "Registered provider");
        self.providers.insert(kind, provider);
    }

    /// Resolve the adapter for a model.
    ///
    /// The provider family comes from [`ProviderKind::for_model`], including
    /// its fall-back to OpenAI for unrecognized prefixes. Fails with
    /// [`Error::ProviderNotFound`] when that family has no credential.
    pub fn resolve(&self, model: &str) -> Result<&Provider> {
        let kind = ProviderKind::for_model(model);
        self.providers.get(&kind).ok_or_else(|| Error::ProviderNotFound {
            provider: kind,
            model: model.to_string(),
        })
    }

    /// Registered provider kinds, in a stable order.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|kind| self.providers.contains_key(kind))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build(
    kind: ProviderKind,
    api_key: ApiKey,
    settings: Option<&ProviderConfig>,
    client: reqwest::Client,
) -> Provider {
    let base_url = settings.and_then(|s| s.base_url.clone());
    let max_tokens = settings.and_then(|s| s.default_max_tokens);
    match kind {
        ProviderKind::OpenAi => Provider::OpenAi(
            OpenAiProvider::new(api_key, base_url)
                .with_default_max_tokens(max_tokens)
                .with_client(client),
        ),
        ProviderKind::Anthropic => Provider::Anthropic(
            AnthropicProvider::new(api_key, base_url)
                .with_default_max_tokens(max_tokens)
                .with_client(client),
        ),
    }
}
