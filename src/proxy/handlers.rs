//! HTTP request handlers.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::server::{AppState, RequestId};
use crate::error::Error;
use crate::models::{ChatChunk, ChatRequest};
use crate::providers::ChatStream;

/// Final SSE payload marking a clean end of stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let start = Instant::now();
    let Json(request) = payload.map_err(|rejection| {
        tracing::warn!(
            request_id = %request_id.0,
            status = rejection.status().as_u16(),
            error = %rejection.body_text(),
            "Rejected malformed chat completion request"
        );
        Error::Validation(rejection.body_text())
    })?;

    tracing::info!(
        request_id = %request_id.0,
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Received chat completion request"
    );

    let ctx = deadline_token(state.config.server.request_timeout());
    // Cancels the token when the response (or this future) is dropped.
    let guard = ctx.clone().drop_guard();

    if request.stream {
        let stream = state
            .service
            .complete_stream(ctx.clone(), &request)
            .inspect_err(|e| log_failure(&request_id, &request.model, e))?;

        tracing::info!(request_id = %request_id.0, model = %request.model, "Streaming response");
        let events = sse_events(stream, ctx, guard);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let response = state
        .service
        .complete(&ctx, &request)
        .await
        .inspect_err(|e| log_failure(&request_id, &request.model, e))?;
    drop(guard);

    tracing::info!(
        request_id = %request_id.0,
        model = %response.model,
        prompt_tokens = response.usage.prompt_tokens,
        completion_tokens = response.usage.completion_tokens,
        latency_ms = start.elapsed().as_millis() as u64,
        "Completed chat completion request"
    );
    Ok(Json(response).into_response())
}

/// Handle GET /health and /_health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let providers: Vec<&'static str> = state
        .service
        .providers()
        .into_iter()
        .map(|kind| kind.as_str())
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "providers": providers
    }))
}

fn log_failure(request_id: &RequestId, model: &str, err: &Error) {
    tracing::warn!(
        request_id = %request_id.0,
        model = %model,
        status = err.status_code().as_u16(),
        error = %err,
        "Chat completion request failed"
    );
}

/// A token that cancels itself once `timeout` elapses.
fn deadline_token(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = timer.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                tracing::debug!(timeout_secs = timeout.as_secs(), "Request deadline exceeded");
                timer.cancel();
            }
        }
    });
    token
}

struct SseState {
    stream: ChatStream,
    ctx: CancellationToken,
    _guard: DropGuard,
}

/// Frame a [`ChatStream`] as SSE events.
///
/// Each chunk becomes one `data:` event. A clean end emits `data: [DONE]`;
/// a failure emits one `event: error` and ends the stream without it.
fn sse_events(
    stream: ChatStream,
    ctx: CancellationToken,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = SseState {
        stream,
        ctx,
        _guard: guard,
    };

    futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        let event = match state.stream.recv().await {
            Some(Ok(chunk)) => match chunk_event(&chunk) {
                Ok(event) => return Some((Ok(event), Some(state))),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize stream chunk");
                    state.ctx.cancel();
                    error_event(&e)
                }
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Stream ended with error");
                error_event(&e)
            }
            // The producer exits silently on cancellation.
            None if state.stream.was_cancelled() => error_event(&Error::Cancelled),
            None => Event::default().data(DONE_MARKER),
        };
        Some((Ok(event), None))
    })
}

fn chunk_event(chunk: &ChatChunk) -> Result<Event, Error> {
    Ok(Event::default().data(serde_json::to_string(chunk)?))
}

fn error_event(err: &Error) -> Event {
    let payload = serde_json::json!({ "error": err.to_string() });
    Event::default().event("error").data(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stream::{spawn_bridge, Step};
    use crate::providers::ProviderKind;
    use futures::StreamExt;

    /// Render the SSE stream to its wire form.
    async fn render(stream: ChatStream, ctx: CancellationToken) -> String {
        let events = sse_events(stream, ctx.clone(), ctx.drop_guard());
        let response = Sse::new(events).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    #[tokio::test]
    async fn test_clean_finish_then_deadline_still_done() {
        let ctx = CancellationToken::new();
        let (stream, handle) = spawn_bridge(
            ProviderKind::OpenAi,
            ctx.clone(),
            futures::stream::iter(Vec::<crate::Result<()>>::new()),
            |_| Step::Skip,
        );
        handle.await.unwrap();
        // Deadline fires after the producer already finished.
        ctx.cancel();

        let body = render(stream, ctx).await;
        assert!(body.contains("data: [DONE]"), "body: {body}");
        assert!(!body.contains("event: error"), "body: {body}");
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_emits_error_event() {
        let ctx = CancellationToken::new();
        let (stream, handle) = spawn_bridge(
            ProviderKind::Anthropic,
            ctx.clone(),
            futures::stream::pending::<crate::Result<()>>(),
            |_| Step::Skip,
        );
        ctx.cancel();
        handle.await.unwrap();

        let body = render(stream, ctx).await;
        assert!(body.contains("event: error"), "body: {body}");
        assert!(body.contains("cancelled"), "body: {body}");
        assert!(!body.contains("[DONE]"), "body: {body}");
    }

    #[tokio::test]
    async fn test_deadline_token_fires() {
        let token = deadline_token(Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("deadline should cancel the token");
    }

    #[tokio::test]
    async fn test_failed_stream_yields_single_error_event() {
        let ctx = CancellationToken::new();
        let stream = ChatStream::failed(Error::StreamProtocol {
            provider: crate::providers::ProviderKind::Anthropic,
            message: "overloaded_error: busy".to_string(),
        });

        let events: Vec<_> = sse_events(stream, ctx.clone(), ctx.clone().drop_guard())
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        // Dropping the stream released the guard.
        assert!(ctx.is_cancelled());
    }
}
