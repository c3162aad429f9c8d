//! llm-router - provider-agnostic chat completion routing
//!
//! This library normalizes chat requests into one canonical model, routes
//! them by model name to an OpenAI- or Anthropic-style provider, and
//! bridges each provider's streaming protocol into a cancelable sequence
//! of canonical chunks.

pub mod config;
pub mod error;
pub mod models;
pub mod providers;
pub mod proxy;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use service::ChatService;
