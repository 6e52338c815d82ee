//! Language model backends
//!
//! The engine talks to models through `LanguageModel` only. Two model
//! identities are used per process: a fast one for conversational queries
//! and the primary one for decisions and synthesis.

use crate::error::EngineError;
use crate::stream::{TextProducer, TokenProducer};
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub mod gemini;
pub use gemini::GeminiClient;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// One complete response.
    async fn complete(&self, prompt: &str, model_id: &str) -> Result<String>;

    /// Blocking incremental producer for the same request, to be driven by
    /// the stream bridge. Opening the producer must not block.
    fn stream(&self, prompt: &str, model_id: &str) -> Result<Box<dyn TokenProducer>>;
}

/// Canned reply for `ScriptedModel`.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Backend failure (unreachable, quota, empty response).
    Fail(String),
    /// Respond only after `delay`; drives timeout tests with a paused clock.
    Delayed(Duration, String),
    /// Stream some fragments, then fail mid-answer.
    BrokenStream { partial: String, error: String },
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }
}

/// A call the scripted model received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub model_id: String,
    pub prompt: String,
    pub streaming: bool,
}

/// Replays replies in order. Used in tests and for running without an API key.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    /// Reply used once the script is exhausted; `None` makes that a backend failure.
    fallback: Option<String>,
}

impl ScriptedModel {
    pub fn new<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = ScriptedReply>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// Script made only of text replies.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ScriptedReply::Text(t.into())))
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }

    fn next_reply(&self, prompt: &str, model_id: &str, streaming: bool) -> Result<ScriptedReply> {
        lock(&self.calls).push(RecordedCall {
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            streaming,
        });

        match lock(&self.replies).pop_front() {
            Some(reply) => Ok(reply),
            None => self
                .fallback
                .clone()
                .map(ScriptedReply::Text)
                .ok_or_else(|| EngineError::FatalBackend("scripted model has no replies left".into())),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str, model_id: &str) -> Result<String> {
        match self.next_reply(prompt, model_id, false)? {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(message) => Err(EngineError::FatalBackend(message)),
            ScriptedReply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            ScriptedReply::BrokenStream { partial, .. } => Ok(partial),
        }
    }

    fn stream(&self, prompt: &str, model_id: &str) -> Result<Box<dyn TokenProducer>> {
        match self.next_reply(prompt, model_id, true)? {
            ScriptedReply::Text(text) | ScriptedReply::Delayed(_, text) => {
                Ok(Box::new(TextProducer::new(&text, 3)))
            }
            ScriptedReply::Fail(message) => Err(EngineError::FatalBackend(message)),
            ScriptedReply::BrokenStream { partial, error } => Ok(Box::new(BrokenProducer {
                inner: TextProducer::new(&partial, 3),
                error: Some(error),
            })),
        }
    }
}

struct BrokenProducer {
    inner: TextProducer,
    error: Option<String>,
}

impl TokenProducer for BrokenProducer {
    fn next_token(&mut self) -> Option<Result<String>> {
        match self.inner.next_token() {
            Some(token) => Some(token),
            None => self.error.take().map(|e| Err(EngineError::StreamingProducer(e))),
        }
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamBridge;

    #[tokio::test]
    async fn test_replies_in_order_and_recorded() {
        let model = ScriptedModel::from_texts(["first", "second"]);
        assert_eq!(model.complete("p1", "fast").await.unwrap(), "first");
        assert_eq!(model.complete("p2", "primary").await.unwrap(), "second");

        let calls = model.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].model_id, "primary");
        assert_eq!(calls[1].prompt, "p2");
    }

    #[tokio::test]
    async fn test_exhausted_script_is_backend_failure() {
        let model = ScriptedModel::new(Vec::new());
        let err = model.complete("p", "m").await.unwrap_err();
        assert!(matches!(err, EngineError::FatalBackend(_)));

        let model = ScriptedModel::new(Vec::new()).with_fallback("I'm here to help.");
        assert_eq!(model.complete("p", "m").await.unwrap(), "I'm here to help.");
    }

    #[tokio::test]
    async fn test_stream_reply() {
        let model = ScriptedModel::from_texts(["Bitcoin is trading near $64,000 today."]);
        let producer = model.stream("p", "m").unwrap();
        let text = StreamBridge::default().spawn(producer).collect_text().await.unwrap();
        assert_eq!(text, "Bitcoin is trading near $64,000 today.");
        assert!(model.calls()[0].streaming);
    }

    #[tokio::test]
    async fn test_broken_stream() {
        let model = ScriptedModel::new([ScriptedReply::BrokenStream {
            partial: "Partial answer".into(),
            error: "socket closed".into(),
        }]);
        let producer = model.stream("p", "m").unwrap();
        let err = StreamBridge::default().spawn(producer).collect_text().await.unwrap_err();
        assert!(matches!(err, EngineError::StreamingProducer(m) if m.contains("socket closed")));
    }
}
