//! Anthropic-style provider adapter.
//!
//! Talks to `POST {base_url}/messages`. The streaming protocol is a sequence
//! of typed lifecycle events that [`AnthropicBridge`] reassembles into
//! canonical chunks:
//!
//! - `message_start` carries the message id and model, cached until needed
//! - `content_block_delta` carries text, emitted at once as one chunk
//! - `message_delta` carries the stop reason, emitted as the terminal chunk
//! - `message_stop` ends the stream without emitting anything
//! - `error` fails the stream
//!
//! `ping`, `content_block_start` and `content_block_stop` carry nothing the
//! canonical model needs and are skipped.

use async_trait::async_trait;
use eventsource_stream::Event;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::stream::{spawn_bridge, sse_events, ChatStream, Step};
use super::{check_status, upstream_error, ChatProvider, ProviderKind};
use crate::config::ApiKey;
use crate::error::{Error, Result};
use crate::models::{
    unix_now, ChatChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta, ResponseMessage,
    Role, Usage, CHAT_COMPLETION_OBJECT, DEFAULT_FINISH_REASON,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const API_VERSION: &str = "2023-06-01";
/// `max_tokens` is mandatory for this API; used when the request has none.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

const KIND: ProviderKind = ProviderKind::Anthropic;

// ============================================================================
// Native wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct NativeRequest {
    model: String,
    messages: Vec<NativeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<NativeMetadata>,
}

#[derive(Debug, Clone, Serialize)]
struct NativeMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct NativeMetadata {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct NativeResponse {
    id: String,
    model: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Vec<NativeContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: NativeUsage,
}

#[derive(Debug, Deserialize)]
struct NativeContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NativeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// A typed upstream streaming event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: u32,
        delta: ContentDelta,
    },
    MessageDelta {
        delta: MessageDelta,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    /// Events that carry nothing the canonical model needs.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl StreamEvent {
    pub fn start(id: &str, model: &str) -> Self {
        StreamEvent::MessageStart {
            message: MessageStart {
                id: id.to_string(),
                model: model.to_string(),
            },
        }
    }

    pub fn text(text: &str) -> Self {
        StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    pub fn stop_reason(reason: &str) -> Self {
        StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(reason.to_string()),
            },
        }
    }

    pub fn error(kind: &str, message: &str) -> Self {
        StreamEvent::Error {
            error: StreamError {
                kind: kind.to_string(),
                message: message.to_string(),
            },
        }
    }
}

fn decode_event(event: Event) -> Result<StreamEvent> {
    let data = event.data.trim();
    if data.is_empty() {
        return Ok(StreamEvent::Other);
    }
    serde_json::from_str(data).map_err(|e| Error::StreamProtocol {
        provider: KIND,
        message: format!("undecodable {} event: {}", event.event, e),
    })
}

// ============================================================================
// Stream bridge
// ============================================================================

/// Lifecycle of one streamed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Started,
    Streaming,
    Finished,
    Failed,
}

/// Reducer from upstream lifecycle events to canonical chunks.
///
/// One instance per stream; it owns the id and model captured from
/// `message_start` and stamps them on every chunk it emits.
#[derive(Debug)]
pub struct AnthropicBridge {
    state: BridgeState,
    id: String,
    model: String,
}

impl Default for AnthropicBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicBridge {
    pub fn new() -> Self {
        Self {
            state: BridgeState::Idle,
            id: String::new(),
            model: String::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, BridgeState::Finished | BridgeState::Failed)
    }

    fn chunk(&self, content: String, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk::new(
            self.id.clone(),
            self.model.clone(),
            vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content),
                },
                finish_reason,
            }],
        )
    }

    /// Advance on one upstream event.
    pub fn step(&mut self, event: StreamEvent) -> Step {
        match event {
            StreamEvent::Error { error } => {
                self.state = BridgeState::Failed;
                Step::Fail(Error::StreamProtocol {
                    provider: KIND,
                    message: format!("{}: {}", error.kind, error.message),
                })
            }
            _ if self.is_terminal() => match event {
                StreamEvent::MessageStop => Step::Finish,
                _ => Step::Skip,
            },
            StreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.state = BridgeState::Started;
                Step::Skip
            }
            StreamEvent::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text },
                ..
            } => {
                if text.is_empty() {
                    return Step::Skip;
                }
                self.state = BridgeState::Streaming;
                Step::Emit(self.chunk(text, None))
            }
            StreamEvent::MessageDelta { delta } => match delta.stop_reason.filter(|r| !r.is_empty())
            {
                Some(reason) => {
                    self.state = BridgeState::Finished;
                    Step::Emit(self.chunk(String::new(), Some(reason)))
                }
                None => Step::Skip,
            },
            StreamEvent::MessageStop => {
                self.state = BridgeState::Finished;
                Step::Finish
            }
            StreamEvent::ContentBlockDelta { .. } | StreamEvent::Other => Step::Skip,
        }
    }
}

/// Run a sequence of upstream events through a fresh [`AnthropicBridge`].
pub fn spawn_event_bridge<S>(ctx: CancellationToken, events: S) -> (ChatStream, JoinHandle<()>)
where
    S: Stream<Item = Result<StreamEvent>> + Send + 'static,
{
    let mut bridge = AnthropicBridge::new();
    spawn_bridge(KIND, ctx, events, move |event| bridge.step(event))
}

// ============================================================================
// Translation
// ============================================================================

fn normalize_response(native: NativeResponse) -> ChatResponse {
    let content: String = native
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    ChatResponse {
        id: native.id,
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: unix_now(),
        model: native.model,
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: native
                    .role
                    .unwrap_or_else(|| Role::Assistant.to_string()),
                content,
            },
            finish_reason: native
                .stop_reason
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
        }],
        usage: Usage::new(native.usage.input_tokens, native.usage.output_tokens),
        error: None,
    }
}

// ============================================================================
// Provider Implementation
// ============================================================================

/// Adapter for the Anthropic Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_key: ApiKey,
    base_url: String,
    default_max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new adapter.
    ///
    /// # Arguments
    /// * `api_key` - API key sent as `x-api-key`
    /// * `base_url` - Optional custom base URL (defaults to Anthropic's API)
    pub fn new(api_key: ApiKey, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_max_tokens: DEFAULT_MAX_TOKENS,
            client: reqwest::Client::new(),
        }
    }

    /// `max_tokens` to send when the request has none.
    pub fn with_default_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.default_max_tokens = max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        self
    }

    /// Use a shared HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Map the canonical request. System messages move to the top-level
    /// `system` field, joined by a blank line when there are several.
    fn build_request(&self, request: &ChatRequest, stream: bool) -> Result<NativeRequest> {
        let mut system: Vec<&str> = Vec::new();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            match Role::parse(&message.role)? {
                Role::System => system.push(&message.content),
                role => messages.push(NativeMessage {
                    role,
                    content: message.content.clone(),
                }),
            }
        }

        Ok(NativeRequest {
            model: request.model.clone(),
            messages,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            max_tokens: request.max_tokens.unwrap_or(self.default_max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream,
            metadata: request.user.clone().map(|user_id| NativeMetadata { user_id }),
        })
    }

    async fn send(&self, body: &NativeRequest) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
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
impl ChatProvider for AnthropicProvider {
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
            max_tokens = body.max_tokens,
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
            max_tokens = body.max_tokens,
            "Starting chat completion stream"
        );

        let provider = self.clone();
        let events = stream::once(async move {
            let response = provider.send(&body).await?;
            Ok::<_, Error>(
                sse_events(KIND, response.bytes_stream()).map(|event| event.and_then(decode_event)),
            )
        })
        .try_flatten();

        let (stream, _producer) = spawn_event_bridge(ctx, events);
        Ok(stream)
    }
}
