//! Canonical, provider-agnostic request and response types.
//!
//! Every adapter translates its provider's native schema to and from these
//! shapes. The wire format is OpenAI-compatible so the transport layer can
//! serialize them directly.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// `object` literal for blocking responses.
pub const CHAT_COMPLETION_OBJECT: &str = "chat.completion";
/// `object` literal for streaming chunks.
pub const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";
/// Finish reason used when a provider reports none.
pub const DEFAULT_FINISH_REASON: &str = "stop";

/// Chat completion request as received from the transport.
///
/// `model` and `messages` default to empty so that missing fields reach
/// [`ChatRequest::validate`] instead of failing deserialization.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A chat message. `role` stays a string until an adapter maps it, so an
/// unknown role surfaces as [`Error::UnsupportedRole`] rather than a parse error.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
        }
    }
}

/// The three roles every provider understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(role: &str) -> Result<Self> {
        match role {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::UnsupportedRole {
                role: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ChatRequest {
    /// Check the fields every provider needs before any upstream call.
    ///
    /// Fails on an empty `model`, an empty `messages` list, or the first
    /// message whose role is not `system`, `user` or `assistant`.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Validation("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(Error::Validation("messages cannot be empty".to_string()));
        }
        for message in &self.messages {
            Role::parse(&message.role)?;
        }
        Ok(())
    }
}

/// Completed chat response returned by a blocking call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// A completion choice.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

/// Message body of a completed choice.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

/// Provider-reported error details embedded in a response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

/// Token usage. `total_tokens` is always `prompt_tokens + completion_tokens`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

/// A streaming choice delta. `finish_reason` is only set on the terminal
/// chunk for its index.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Partial message carried by a chunk.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatChunk {
    /// Build a chunk stamped with the canonical object literal and the current time.
    pub fn new(id: impl Into<String>, model: impl Into<String>, choices: Vec<ChunkChoice>) -> Self {
        Self {
            id: id.into(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: unix_now(),
            model: model.into(),
            choices,
        }
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
