//! Configuration parsing and validation for llm-router.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

use crate::providers::ProviderKind;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline for one request, streaming included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, which keeps every use grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a provider's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Per-provider settings. Only `openai` and `anthropic` are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        }
    }

    fn get_mut(&mut self, kind: ProviderKind) -> &mut ProviderConfig {
        match kind {
            ProviderKind::OpenAi => &mut self.openai,
            ProviderKind::Anthropic => &mut self.anthropic,
        }
    }
}

/// Provider configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    /// API key; the provider is not registered without one
    pub api_key: Option<ApiKey>,
    /// Override for the provider's API base URL (e.g., "https://api.openai.com/v1")
    pub base_url: Option<String>,
    /// `max_tokens` to send when a request omits it
    pub default_max_tokens: Option<u32>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level, used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string. Keys are taken literally.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "server.request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        for kind in ProviderKind::ALL {
            let provider = self.providers.get(kind);
            if let Some(url) = &provider.base_url {
                if url.trim().is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "Provider '{}' has empty base_url",
                        kind
                    )));
                }
            }
            if provider.default_max_tokens == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has default_max_tokens = 0",
                    kind
                )));
            }
        }

        if ProviderKind::ALL
            .iter()
            .all(|kind| self.providers.get(*kind).api_key.is_none())
        {
            tracing::warn!("No provider API keys configured - router will reject all requests");
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for provider '{provider}': {message}")]
    EnvVar {
        var: String,
        provider: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Debug, Default, Deserialize)]
pub struct RawProviderConfig {
    api_key: Option<String>,
    base_url: Option<String>,
    default_max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawProvidersConfig {
    #[serde(default)]
    openai: RawProviderConfig,
    #[serde(default)]
    anthropic: RawProviderConfig,
}

/// Raw configuration deserialized directly from TOML.
/// Provider api_key values may contain `${VAR}` references not yet expanded.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    providers: RawProvidersConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    provider_name: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            provider: provider_name.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                provider: provider_name.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            provider: provider_name.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in provider '{}')",
                var_name, provider_name
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a provider.
///
/// - openai -> "OPENAI_API_KEY"
/// - anthropic -> "ANTHROPIC_API_KEY"
pub fn convention_env_var_name(kind: ProviderKind) -> String {
    format!("{}_API_KEY", kind.as_str().to_uppercase())
}

/// Resolve one provider's key from its raw config value.
///
/// - `${VAR}` references are expanded, source = `EnvExpanded`
/// - a literal string is wrapped directly, source = `Literal`
/// - an absent key falls back to the convention variable, source =
///   `Convention(var_name)`, or `KeySource::None` when that is unset too
/// - a key that is empty, literally or after expansion, counts as absent
fn resolve_key<F>(
    kind: ProviderKind,
    raw_key: Option<&str>,
    lookup: F,
) -> Result<(Option<ApiKey>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match raw_key {
        Some(raw) if raw.contains("${") => {
            let expanded = expand_env_vars_with(raw, kind.as_str(), &lookup)?;
            if expanded.is_empty() {
                return Ok((None, KeySource::None));
            }
            Ok((Some(ApiKey::from(expanded)), KeySource::EnvExpanded))
        }
        Some("") => Ok((None, KeySource::None)),
        Some(raw) => Ok((Some(ApiKey::from(raw)), KeySource::Literal)),
        None => {
            let var_name = convention_env_var_name(kind);
            match lookup(&var_name).filter(|v| !v.is_empty()) {
                Some(value) => Ok((Some(ApiKey::from(value)), KeySource::Convention(var_name))),
                None => Ok((None, KeySource::None)),
            }
        }
    }
}

impl Config {
    /// Convert raw (deserialized) config to final config, resolving keys with `lookup`.
    fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(ProviderKind, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut providers = ProvidersConfig::default();
        let mut key_sources = Vec::with_capacity(ProviderKind::ALL.len());

        let RawProvidersConfig { openai, anthropic } = raw.providers;
        for (kind, rp) in [(ProviderKind::OpenAi, openai), (ProviderKind::Anthropic, anthropic)] {
            let (api_key, source) = resolve_key(kind, rp.api_key.as_deref(), &lookup)?;
            key_sources.push((kind, source));
            *providers.get_mut(kind) = ProviderConfig {
                api_key,
                base_url: rp.base_url,
                default_max_tokens: rp.default_max_tokens,
            };
        }

        let config = Config {
            server: raw.server,
            providers,
            logging: raw.logging,
        };
        config.validate()?;

        Ok((config, key_sources))
    }

    /// Convert raw config using real environment variables.
    pub fn from_raw(
        raw: RawConfig,
    ) -> Result<(Self, Vec<(ProviderKind, KeySource)>), ConfigError> {
        Self::from_raw_with(raw, |name| std::env::var(name).ok())
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(ProviderKind, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        Self::from_raw(raw)
    }

    /// Defaults plus keys from the convention environment variables.
    pub fn from_env() -> Result<(Self, Vec<(ProviderKind, KeySource)>), ConfigError> {
        Self::from_raw(RawConfig::default())
    }

    /// Load from `path` when given, otherwise from the environment alone.
    pub fn load(
        path: Option<impl AsRef<Path>>,
    ) -> Result<(Self, Vec<(ProviderKind, KeySource)>), ConfigError> {
        match path {
            Some(path) => Self::from_file_with_env(path),
            None => Self::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.request_timeout_secs, 120);
        assert!(config.providers.openai.api_key.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:8080"
            request_timeout_secs = 30

            [providers.openai]
            api_key = "sk-openai"
            base_url = "https://proxy.example.com/v1"

            [providers.anthropic]
            api_key = "sk-ant"
            default_max_tokens = 2048

            [logging]
            level = "debug"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.request_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.providers.openai.base_url.as_deref(),
            Some("https://proxy.example.com/v1")
        );
        assert_eq!(config.providers.anthropic.default_max_tokens, Some(2048));
        assert_eq!(
            config.providers.get(ProviderKind::Anthropic).api_key.as_ref().unwrap().expose_secret(),
            "sk-ant"
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml = r#"
            [providers.cohere]
            api_key = "x"
        "#;
        assert!(matches!(Config::parse_str(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let toml = r#"
            [server]
            request_timeout_secs = 0
        "#;
        let err = Config::parse_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let toml = r#"
            [providers.openai]
            base_url = ""
        "#;
        let err = Config::parse_str(toml).unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_api_key_debug_redaction() {
        let key = ApiKey::from("super-secret-token");
        let debug_output = format!("{:?}", key);
        assert_eq!(debug_output, "[REDACTED]");
        assert!(!debug_output.contains("super-secret"));
    }

    #[test]
    fn test_api_key_display_and_serialize_redaction() {
        let key = ApiKey::from("real-secret-value");
        assert_eq!(format!("{}", key), "[REDACTED]");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "real-secret-value");
    }

    #[test]
    fn test_provider_config_debug_redaction() {
        let toml = r#"
            [providers.openai]
            api_key = "sk-live-1234secret"
        "#;
        let config = Config::parse_str(toml).unwrap();
        let debug = format!("{:?}", config.providers.openai);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-live-1234secret"));
    }

    // ── Expansion tests (using expand_env_vars_with, no global env state) ──

    #[test]
    fn test_expand_single_var() {
        let lookup = |name: &str| match name {
            "MY_KEY" => Some("sk-abc".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${MY_KEY}", "openai", lookup).unwrap();
        assert_eq!(result, "sk-abc");
    }

    #[test]
    fn test_expand_mixed_literal_and_var() {
        let lookup = |name: &str| match name {
            "KEY" => Some("resolved".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("prefix-${KEY}-suffix", "openai", lookup).unwrap();
        assert_eq!(result, "prefix-resolved-suffix");
    }

    #[test]
    fn test_expand_missing_var_fails() {
        let result = expand_env_vars_with("${MISSING}", "anthropic", no_env);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("MISSING"), "Error should name the variable");
        assert!(err.contains("anthropic"), "Error should name the provider");
    }

    #[test]
    fn test_expand_unclosed_brace_fails() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let err = expand_env_vars_with("${UNCLOSED", "openai", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn test_expand_empty_var_name_fails() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let err = expand_env_vars_with("${}", "openai", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_convention_env_var_names() {
        assert_eq!(convention_env_var_name(ProviderKind::OpenAi), "OPENAI_API_KEY");
        assert_eq!(
            convention_env_var_name(ProviderKind::Anthropic),
            "ANTHROPIC_API_KEY"
        );
    }

    // ── from_raw_with tests ──

    fn raw_with_keys(openai: Option<&str>, anthropic: Option<&str>) -> RawConfig {
        RawConfig {
            providers: RawProvidersConfig {
                openai: RawProviderConfig {
                    api_key: openai.map(str::to_string),
                    ..Default::default()
                },
                anthropic: RawProviderConfig {
                    api_key: anthropic.map(str::to_string),
                    ..Default::default()
                },
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_from_raw_key_sources() {
        let lookup = |name: &str| match name {
            "OPENAI_KEY_FOR_TEST" => Some("sk-expanded".to_string()),
            _ => None,
        };
        let raw = raw_with_keys(Some("${OPENAI_KEY_FOR_TEST}"), Some("sk-ant-literal"));
        let (config, sources) = Config::from_raw_with(raw, lookup).unwrap();

        assert_eq!(
            sources,
            vec![
                (ProviderKind::OpenAi, KeySource::EnvExpanded),
                (ProviderKind::Anthropic, KeySource::Literal),
            ]
        );
        assert_eq!(
            config.providers.openai.api_key.as_ref().unwrap().expose_secret(),
            "sk-expanded"
        );
        assert_eq!(
            config.providers.anthropic.api_key.as_ref().unwrap().expose_secret(),
            "sk-ant-literal"
        );
    }

    #[test]
    fn test_from_raw_convention_and_none() {
        let lookup = |name: &str| match name {
            "ANTHROPIC_API_KEY" => Some("sk-ant-env".to_string()),
            _ => None,
        };
        let (config, sources) = Config::from_raw_with(raw_with_keys(None, None), lookup).unwrap();

        assert_eq!(sources[0], (ProviderKind::OpenAi, KeySource::None));
        assert_eq!(
            sources[1],
            (
                ProviderKind::Anthropic,
                KeySource::Convention("ANTHROPIC_API_KEY".to_string())
            )
        );
        assert!(config.providers.openai.api_key.is_none());
        assert_eq!(
            config.providers.anthropic.api_key.as_ref().unwrap().expose_secret(),
            "sk-ant-env"
        );
    }

    #[test]
    fn test_from_raw_empty_convention_var_is_none() {
        let lookup = |_: &str| Some(String::new());
        let (_, sources) = Config::from_raw_with(raw_with_keys(None, None), lookup).unwrap();
        assert!(sources.iter().all(|(_, s)| *s == KeySource::None));
    }

    #[test]
    fn test_from_raw_empty_expansion_is_none() {
        let lookup = |name: &str| match name {
            "OPENAI_KEY_EMPTY_FOR_TEST" => Some(String::new()),
            _ => None,
        };
        let raw = raw_with_keys(Some("${OPENAI_KEY_EMPTY_FOR_TEST}"), None);
        let (config, sources) = Config::from_raw_with(raw, lookup).unwrap();

        assert_eq!(sources[0], (ProviderKind::OpenAi, KeySource::None));
        assert!(config.providers.openai.api_key.is_none());
    }

    #[test]
    fn test_from_raw_empty_literal_is_none() {
        let (config, sources) = Config::from_raw_with(raw_with_keys(None, Some("")), no_env).unwrap();

        assert_eq!(sources[1], (ProviderKind::Anthropic, KeySource::None));
        assert!(config.providers.anthropic.api_key.is_none());

        let registry = crate::providers::ProviderRegistry::from_config(
            &config.providers,
            reqwest::Client::new(),
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_raw_missing_env_var_fails() {
        let raw = raw_with_keys(Some("${DEFINITELY_MISSING_FOR_TEST}"), None);
        let err = Config::from_raw_with(raw, no_env).unwrap_err().to_string();
        assert!(err.contains("DEFINITELY_MISSING_FOR_TEST"), "{}", err);
        assert!(err.contains("openai"), "{}", err);
    }
}
