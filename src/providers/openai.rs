//! OpenAI-style provider adapter.
//!
//! Talks to `POST {base_url}/chat/completions`. The streaming protocol is a
//! sequence of self-describing chunk objects, each already carrying its choice
//! deltas and (on the last one per choice) a finish reason, terminated by
//! `data: [DONE]`. Translation is a near 1:1 field remap.

use async_trait::async_trait;
use eventsource_stream::Event;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::stream::{spawn_bridge, sse_events, ChatStream, Step};
use super::{check_status, upstream_error, ChatProvider, ProviderKind};
use crate::config::ApiKey;
use crate::error::{Error, Result};
use crate::models::{
    unix_now, ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta, ResponseMessage,
    Role, Usage, CHAT_COMPLETION_OBJECT, DEFAULT_FINISH_REASON,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const KIND: ProviderKind = ProviderKind::OpenAi;

// ============================================================================
// Native wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct NativeRequest {
    model: String,
    messages: Vec<NativeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct NativeMessage {
    role: Role,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NativeResponse {
    id: String,
    model: String,
    #[serde(default)]
    choices: Vec<NativeChoice>,
    usage: Option<NativeUsage>,
}

#[derive(Debug, Deserialize)]
struct NativeChoice {
    #[serde(default)]
    index: u32,
    message: NativeResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NativeResponseMessage {
    role: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NativeUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct NativeChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<NativeChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct NativeChunkChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: NativeResponseMessage,
    finish_reason: Option<String>,
}

/// One decoded item of the upstream event stream.
#[derive(Debug)]
enum StreamEvent {
    Chunk(NativeChunk),
    Done,
}

// ============================================================================
// Translation
// ============================================================================

fn normalize_response(native: NativeResponse) -> ChatResponse {
    let choices = native
        .choices
        .into_iter()
        .map(|c| Choice {
            index: c.index,
            message: ResponseMessage {
                role: c.message.role.unwrap_or_else(|| Role::Assistant.to_string()),
                content: c.message.content.unwrap_or_default(),
            },
            finish_reason: c
                .finish_reason
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
        })
        .collect();

    let usage = native
        .usage
        .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    ChatResponse {
        id: native.id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: unix_now(),
        model: native.model,
        choices,
        usage,
        error: None,
    }
}

fn normalize_chunk(native: NativeChunk) -> ChatChunk {
    let choices = native
        .choices
        .into_iter()
        .map(|c| ChunkChoice {
            index: c.index,
            delta: Delta {
                role: c.delta.role.filter(|r| !r.is_empty()),
                content: c.delta.content,
            },
            finish_reason: c.finish_reason.filter(|r| !r.is_empty()),
        })
        .collect();
    ChatChunk::new(native.id, native.model, choices)
}

fn decode_event(event: Event) -> Result<StreamEvent> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| Error::StreamProtocol {
        provider: KIND,
        message: format!("undecodable chunk: {}", e),
    })?;

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::StreamProtocol {
            provider: KIND,
            message,
        });
    }

    serde_json::from_value(value)
        .map(StreamEvent::Chunk)
        .map_err(|e| Error::StreamProtocol {
            provider: KIND,
            message: format!("undecodable chunk: {}", e),
        })
}

fn reduce(event: StreamEvent) -> Step {
    match event {
        StreamEvent::Chunk(chunk) => Step::Emit(normalize_chunk(chunk)),
        StreamEvent::Done => Step::Finish,
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Adapter for OpenAI-compatible chat completion APIs.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    api_key: ApiKey,
    base_url: String,
    default_max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Create a new adapter.
    ///
    /// # Arguments
    /// * `api_key` - Bearer token for the API
    /// * `base_url` - Optional custom base URL (defaults to OpenAI's API)
    pub fn new(api_key: ApiKey, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_max_tokens: None,
            client: reqwest::Client::new(),
        }
    }

    /// `max_tokens` to send when the request has none. `None` leaves it to the API.
    pub fn with_default_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.default_max_tokens = max_tokens;
        self
    }

    /// Use a shared HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> Result<NativeRequest> {
        let messages = request
            .messages
            .iter()
            .map(|m| {
                Ok(NativeMessage {
                    role: Role::parse(&m.role)?,
                    content: m.content.clone(),
                    name: m.name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(NativeRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.or(self.default_max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.clone(),
            stream,
            user: request.user.clone(),
        })
    }

    async fn send(&self, body: &NativeRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, provider = %KIND, "Failed to reach provider");
                upstream_error(KIND, &body.model, e)
            })?;

        check_status(KIND, &body.model, response).await
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    async fn complete(
        &self,
        ctx: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let body = self.build_request(request, false)?;
        tracing::debug!(
            provider = %KIND,
            model = %body.model,
            messages = body.messages.len(),
            "Sending chat completion"
        );

        let call = async {
            let response = self.send(&body).await?;
            let native: NativeResponse = response
                .json()
                .await
                .map_err(|e| upstream_error(KIND, &body.model, e))?;
            Ok::<_, Error>(normalize_response(native))
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            result = call => result,
        }
    }

    fn complete_stream(&self, ctx: CancellationToken, request: &ChatRequest) -> Result<ChatStream> {
        let body = self.build_request(request, true)?;
        tracing::debug!(
            provider = %KIND,
            model = %body.model,
            messages = body.messages.len(),
            "Starting chat completion stream"
        );

        let provider = self.clone();
        let upstream = stream::once(async move {
            let response = provider.send(&body).await?;
            Ok::<_, Error>(
                sse_events(KIND, response.bytes_stream()).map(|event| event.and_then(decode_event)),
            )
        })
        .try_flatten();

        let (stream, _producer) = spawn_bridge(KIND, ctx, upstream, reduce);
        Ok(stream)
    }
}
