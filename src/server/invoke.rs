//! Request/response entry point with pull delivery
//!
//! A connectionless transport hands each request body to `Invoker::invoke`.
//! Requests whose path ends in `pull` keep the response open for a bounded
//! window and stream whatever the connection's queue receives meanwhile,
//! which lets a polling client behave like a persistent duplex stream.

use super::{ConnContext, EventQueue, EventQueueTable, QueueError, RequestProcessor, ServerError};
use crate::event::{complete_frames_len, Event, EventCodec};
use crate::protocol::{PULL_BATCH, PULL_PATH_SUFFIX, PULL_PEEK_TIMEOUT, PULL_WINDOW};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bounds of one pull request
#[derive(Debug, Clone, Copy)]
pub struct PullOptions {
    /// Wall-clock window the response stays open
    pub window: Duration,
    /// Maximum events drained per peek
    pub batch: usize,
    /// Wait per peek
    pub peek_timeout: Duration,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            window: PULL_WINDOW,
            batch: PULL_BATCH,
            peek_timeout: PULL_PEEK_TIMEOUT,
        }
    }
}

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// Immediate responses written, no pull
    Responded,
    /// The auth frame was refused
    Rejected,
    /// The pull window elapsed
    PullExpired,
    /// Writing to the client failed mid-pull
    WriteFailed,
    /// The connection's queue was closed mid-pull
    QueueClosed,
}

/// Serves request bodies against the shared processor and queues
pub struct Invoker {
    processor: Arc<RequestProcessor>,
    queues: Arc<EventQueueTable>,
    pull: PullOptions,
}

impl Invoker {
    pub fn new(processor: Arc<RequestProcessor>, queues: Arc<EventQueueTable>, pull: PullOptions) -> Self {
        Self {
            processor,
            queues,
            pull,
        }
    }

    /// Process one request body and write the response to `writer`
    ///
    /// Errors mean the request itself was bad; the caller answers with a
    /// client error status.
    pub async fn invoke<W>(&self, path: &str, mut body: BytesMut, writer: &mut W) -> Result<InvokeOutcome, ServerError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // A cut-off body is refused before any of it takes effect.
        let framed = complete_frames_len(&body)?;
        if framed != body.len() {
            return Err(ServerError::Truncated(body.len() - framed));
        }

        let mut ctx = ConnContext::default();
        let responses = match self.processor.process(&mut body, &mut ctx) {
            Ok(responses) => responses,
            Err(e) => {
                error!(user = %ctx.user, index = ctx.index, path, "request failed: {}", e);
                return Err(e);
            }
        };

        let codec = self.processor.codec();
        write_events(writer, codec, ctx.iv, &responses).await?;

        if ctx.rejected {
            return Ok(InvokeOutcome::Rejected);
        }
        if !path.ends_with(PULL_PATH_SUFFIX) {
            return Ok(InvokeOutcome::Responded);
        }
        let Some(id) = ctx.conn_id() else {
            return Ok(InvokeOutcome::Responded);
        };
        let Some(queue) = self.queues.acquire(&id, true) else {
            return Ok(InvokeOutcome::QueueClosed);
        };

        debug!(conn = %id, "pull started");
        Ok(pull(writer, codec, ctx.iv, &queue, &self.pull).await)
    }
}

/// Drain `queue` into `writer` until the pull window ends or the client goes away
pub async fn pull<W>(writer: &mut W, codec: &EventCodec, iv: u64, queue: &EventQueue, opts: &PullOptions) -> InvokeOutcome
where
    W: AsyncWrite + Unpin + Send,
{
    let begin = Instant::now();
    let deadline = begin + opts.window;

    loop {
        let now = Instant::now();
        if now >= deadline {
            info!(elapsed = ?now - begin, "stop puller after window");
            return InvokeOutcome::PullExpired;
        }

        let wait = opts.peek_timeout.min(deadline - now);
        match queue.peek_multi(opts.batch, wait).await {
            Ok(events) => {
                if let Err(e) = write_events(writer, codec, iv, &events).await {
                    warn!("pull write error: {}", e);
                    return InvokeOutcome::WriteFailed;
                }
                queue.discard_peeks();
            }
            Err(QueueError::Closed) => return InvokeOutcome::QueueClosed,
            Err(_) => {}
        }
    }
}

/// Seal `events` under `iv` and write them out in one call
pub async fn write_events<W>(writer: &mut W, codec: &EventCodec, iv: u64, events: &[Event]) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    if events.is_empty() {
        return Ok(());
    }

    let mut buf = BytesMut::new();
    codec.encrypt_all(events, iv, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
