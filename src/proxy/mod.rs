//! HTTP transport.
//!
//! Exposes an OpenAI-compatible chat completions endpoint backed by
//! [`ChatService`](crate::service::ChatService), with SSE framing for
//! streaming requests.

mod handlers;
mod server;

pub use handlers::DONE_MARKER;
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
