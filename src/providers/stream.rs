//! Streaming bridge shared by all provider adapters.
//!
//! An adapter turns its provider's native event sequence into canonical
//! [`ChatChunk`]s by supplying a reducer to [`spawn_bridge`]. The bridge runs
//! on its own task and delivers results over two channels:
//!
//! - a chunk channel, sent to with a blocking send raced against cancellation
//! - an error channel of capacity 1, sent to with `try_send` only
//!
//! The producer therefore never blocks on the error channel, so it cannot
//! leak when the consumer has already gone away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ProviderKind;
use crate::error::{Error, Result};
use crate::models::ChatChunk;

/// Chunk channel capacity. One slot keeps delivery in lockstep with upstream.
const CHUNK_BUFFER: usize = 1;

/// What the bridge should do with one upstream item.
#[derive(Debug)]
pub enum Step {
    /// Deliver a chunk and keep reading.
    Emit(ChatChunk),
    /// Nothing to deliver for this item.
    Skip,
    /// Upstream signalled the end of the message.
    Finish,
    /// Upstream signalled a failure; report it and stop.
    Fail(Error),
}

/// Consumer side of a streaming completion.
///
/// Both channels can be drained independently. [`ChatStream::recv`] is the
/// usual way to read them together.
#[derive(Debug)]
pub struct ChatStream {
    pub chunks: mpsc::Receiver<ChatChunk>,
    pub errors: mpsc::Receiver<Error>,
    cancelled: Arc<AtomicBool>,
}

impl ChatStream {
    /// Next chunk, the terminal error, or `None` at clean end-of-stream.
    ///
    /// The producer posts its error before closing the chunk channel, so the
    /// error channel only needs checking once the chunk channel is closed.
    pub async fn recv(&mut self) -> Option<Result<ChatChunk>> {
        match self.chunks.recv().await {
            Some(chunk) => Some(Ok(chunk)),
            None => self.errors.try_recv().ok().map(Err),
        }
    }

    /// Whether the producer stopped because its context was cancelled.
    ///
    /// Set before the chunk channel closes, so it is settled once
    /// [`ChatStream::recv`] has returned `None`. A stream that finished
    /// before a later cancellation reports `false`.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Read the stream to its end.
    pub async fn collect(mut self) -> (Vec<ChatChunk>, Option<Error>) {
        let mut chunks = Vec::new();
        while let Some(item) = self.recv().await {
            match item {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => return (chunks, Some(e)),
            }
        }
        (chunks, None)
    }

    /// A stream that has already failed, with nothing to deliver.
    pub(crate) fn failed(err: Error) -> Self {
        let (_, chunks) = mpsc::channel(CHUNK_BUFFER);
        let (error_tx, errors) = mpsc::channel(1);
        let _ = error_tx.try_send(err);
        Self {
            chunks,
            errors,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Spawn the producer task that feeds `upstream` through `reduce`.
///
/// The task exits when upstream ends, the reducer finishes or fails, `ctx`
/// is cancelled, or the consumer drops the chunk receiver. Upstream errors
/// go to the error channel; they are dropped if nobody can take them.
pub fn spawn_bridge<S, T, F>(
    provider: ProviderKind,
    ctx: CancellationToken,
    upstream: S,
    mut reduce: F,
) -> (ChatStream, JoinHandle<()>)
where
    S: Stream<Item = Result<T>> + Send + 'static,
    T: Send + 'static,
    F: FnMut(T) -> Step + Send + 'static,
{
    let (chunk_tx, chunks) = mpsc::channel(CHUNK_BUFFER);
    let (error_tx, errors) = mpsc::channel::<Error>(1);
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_flag = cancelled.clone();

    let handle = tokio::spawn(async move {
        let mut upstream = std::pin::pin!(upstream);
        let mut delivered = 0usize;

        loop {
            let item = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    tracing::debug!(provider = %provider, delivered, "Stream cancelled by caller");
                    cancelled_flag.store(true, Ordering::Release);
                    return;
                }
                item = upstream.next() => item,
            };

            let step = match item {
                None => Step::Finish,
                Some(Err(e)) => Step::Fail(e),
                Some(Ok(value)) => reduce(value),
            };

            match step {
                Step::Emit(chunk) => {
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => {
                            tracing::debug!(provider = %provider, delivered, "Stream cancelled by caller");
                            cancelled_flag.store(true, Ordering::Release);
                            return;
                        }
                        sent = chunk_tx.send(chunk) => {
                            if sent.is_err() {
                                tracing::debug!(provider = %provider, delivered, "Stream consumer went away");
                                return;
                            }
                            delivered += 1;
                        }
                    }
                }
                Step::Skip => {}
                Step::Finish => {
                    tracing::debug!(provider = %provider, delivered, "Stream finished");
                    return;
                }
                Step::Fail(e) => {
                    tracing::warn!(provider = %provider, delivered, error = %e, "Stream failed");
                    if let Err(dropped) = error_tx.try_send(e) {
                        tracing::debug!(
                            provider = %provider,
                            error = %dropped,
                            "Terminal stream error dropped, no reader"
                        );
                    }
                    return;
                }
            }
        }
    });

    (
        ChatStream {
            chunks,
            errors,
            cancelled,
        },
        handle,
    )
}

/// Decode an HTTP body as server-sent events.
pub(crate) fn sse_events<S>(provider: ProviderKind, body: S) -> impl Stream<Item = Result<Event>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    body.eventsource().map(move |event| {
        event.map_err(|e| Error::StreamProtocol {
            provider,
            message: e.to_string(),
        })
    })
}
