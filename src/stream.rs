//! Bridge from a blocking token producer to an async token stream
//!
//! The producer runs on tokio's blocking pool and feeds a bounded channel,
//! so a slow consumer applies backpressure instead of growing a buffer.
//! Cancellation is cooperative: the producer thread checks the token at
//! every token boundary and calls `TokenProducer::stop` before exiting. A
//! producer blocked inside an external call only notices once that call
//! returns. An optional idle timeout bounds how long the consumer waits for
//! the next event; when it lapses the stream ends with an error marker.

use crate::error::EngineError;
use crate::Result;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Incremental, blocking source of text fragments (a streaming model call).
pub trait TokenProducer: Send + 'static {
    /// Next fragment; `None` when the answer is complete.
    fn next_token(&mut self) -> Option<Result<String>>;

    /// Release whatever the producer holds (connections, buffers).
    fn stop(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    /// Normal completion.
    Done,
    /// Producer failure; nothing follows.
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamBridge {
    buffer: usize,
    idle_timeout: Option<Duration>,
}

impl StreamBridge {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            idle_timeout: None,
        }
    }

    /// Fail the stream when no event arrives within `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Start draining `producer` on the blocking pool. Must be called from
    /// within a tokio runtime.
    pub fn spawn(&self, producer: Box<dyn TokenProducer>) -> TokenStream {
        self.spawn_with_token(producer, CancellationToken::new())
    }

    /// As `spawn`, but cancelling `token` also stops the producer.
    pub fn spawn_with_token(
        &self,
        producer: Box<dyn TokenProducer>,
        token: CancellationToken,
    ) -> TokenStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let producer_token = token.clone();
        let task = tokio::task::spawn_blocking(move || drive(producer, tx, producer_token));

        TokenStream {
            rx,
            token,
            finished: false,
            task: Some(task),
            idle_timeout: self.idle_timeout,
            deadline: None,
            turn_id: None,
        }
    }
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new(32)
    }
}

fn drive(
    mut producer: Box<dyn TokenProducer>,
    tx: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
) {
    let mut delivered = 0usize;

    loop {
        if token.is_cancelled() {
            debug!(delivered, "stream cancelled, stopping producer");
            producer.stop();
            return;
        }

        match producer.next_token() {
            None => {
                let _ = tx.blocking_send(StreamEvent::Done);
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, delivered, "stream producer failed");
                producer.stop();
                let _ = tx.blocking_send(StreamEvent::Error(e.to_string()));
                return;
            }
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                if token.is_cancelled() || tx.blocking_send(StreamEvent::Fragment(fragment)).is_err() {
                    debug!(delivered, "stream consumer gone, stopping producer");
                    producer.stop();
                    return;
                }
                delivered += 1;
            }
        }
    }
}

/// Ordered fragments ending in `Done` or `Error`. Dropping the stream
/// cancels the producer.
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
    token: CancellationToken,
    finished: bool,
    task: Option<JoinHandle<()>>,
    idle_timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    /// Turn this answer belongs to, for failure logs.
    turn_id: Option<Uuid>,
}

impl TokenStream {
    /// A stream over an answer that is already complete.
    pub fn from_text(text: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(StreamEvent::Fragment(text.into()));
        let _ = tx.try_send(StreamEvent::Done);

        Self {
            rx,
            token: CancellationToken::new(),
            finished: false,
            task: None,
            idle_timeout: None,
            deadline: None,
            turn_id: None,
        }
    }

    pub(crate) fn for_turn(mut self, turn_id: Uuid) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn turn_id(&self) -> Option<Uuid> {
        self.turn_id
    }

    /// Stop the producer and discard anything not yet delivered.
    pub fn cancel(&mut self) {
        self.token.cancel();
        self.rx.close();
        self.finished = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain into one string. A terminal error marker becomes `StreamingProducer`.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();

        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Fragment(fragment) => text.push_str(&fragment),
                StreamEvent::Done => return Ok(text),
                StreamEvent::Error(message) => return Err(EngineError::StreamingProducer(message)),
            }
        }

        if self.token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Err(EngineError::StreamingProducer(
                "the stream ended without a completion marker".to_string(),
            ))
        }
    }

    /// Wait for the producer thread to exit after cancellation.
    pub async fn cancel_and_wait(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let event = match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if let (Some(timeout), Some(deadline)) = (this.idle_timeout, this.deadline.as_mut()) {
                    deadline.as_mut().reset(Instant::now() + timeout);
                }
                event
            }
            Poll::Ready(None) => {
                if this.token.is_cancelled() {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                // Producer exited (e.g. panicked) without a marker.
                StreamEvent::Error("the answer stream stopped unexpectedly".to_string())
            }
            Poll::Pending => {
                let Some(timeout) = this.idle_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                if deadline.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }

                this.token.cancel();
                this.rx.close();
                StreamEvent::Error(format!(
                    "model did not respond within {} ms",
                    timeout.as_millis()
                ))
            }
        };

        if event.is_terminal() {
            this.finished = true;
        }
        if let StreamEvent::Error(message) = &event {
            error!(turn_id = ?this.turn_id, error = %message, "turn failed while streaming");
        }
        Poll::Ready(Some(event))
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Producer over an already-known text, emitted a few words at a time.
pub struct TextProducer {
    chunks: VecDeque<String>,
}

impl TextProducer {
    pub fn new(text: &str, words_per_chunk: usize) -> Self {
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        let chunks = words
            .chunks(words_per_chunk.max(1))
            .map(|c| c.concat())
            .collect();
        Self { chunks }
    }
}

impl TokenProducer for TextProducer {
    fn next_token(&mut self) -> Option<Result<String>> {
        self.chunks.pop_front().map(Ok)
    }

    fn stop(&mut self) {
        self.chunks.clear();
    }
}
