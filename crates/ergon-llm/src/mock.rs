//! Mock model backend for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::provider::*;
use ergon_core::{ErgonError, Result};

/// One scripted backend behavior.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Reply with this text.
    Text(String),
    /// Fail with a backend error carrying this message.
    Error(String),
    /// Wait, then behave like the inner step.
    Delayed { delay: Duration, then: Box<MockStep> },
    /// Never reply.
    Hang,
    /// Reply with the last user message of the request.
    Echo,
}

/// A mock backend that plays back a queue of scripted steps.
///
/// # Example
/// ```
/// use ergon_llm::mock::MockBackend;
/// let backend = MockBackend::new("test")
///     .with_response("Hello, world!");
/// ```
pub struct MockBackend {
    steps: Arc<Mutex<VecDeque<MockStep>>>,
    /// Track all requests received (for assertions in tests).
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    /// Played when the queue is empty.
    fallback: MockStep,
    name: String,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(vec![])),
            fallback: MockStep::Text("(mock: no more queued responses)".into()),
            name: name.into(),
        }
    }

    /// A backend that echoes the last user message once its queue is empty.
    pub fn echo() -> Self {
        let mut backend = Self::new("mock");
        backend.fallback = MockStep::Echo;
        backend
    }

    /// A backend that never replies.
    pub fn hanging() -> Self {
        let mut backend = Self::new("mock");
        backend.fallback = MockStep::Hang;
        backend
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.push(MockStep::Text(text.to_string()))
    }

    /// Queue a structured tool call in the `function_call` convention.
    pub fn with_tool_call(self, name: &str, args: serde_json::Value) -> Self {
        let body = serde_json::json!({
            "function_call": { "name": name, "arguments": args }
        });
        self.push(MockStep::Text(body.to_string()))
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.push(MockStep::Error(error.to_string()))
    }

    /// Queue a response delivered after `delay`.
    pub fn with_delayed_response(self, delay: Duration, text: &str) -> Self {
        self.push(MockStep::Delayed {
            delay,
            then: Box::new(MockStep::Text(text.to_string())),
        })
    }

    /// Queue a call that never returns.
    pub fn with_hang(self) -> Self {
        self.push(MockStep::Hang)
    }

    /// Queue any step.
    pub fn with_step(self, step: MockStep) -> Self {
        self.push(step)
    }

    fn push(self, step: MockStep) -> Self {
        self.steps.lock().push_back(step);
        self
    }

    /// Shared handle to all requests made so far.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Number of complete/stream calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_step(&self, request: &CompletionRequest) -> MockStep {
        self.requests.lock().push(request.clone());
        self.steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn play(step: MockStep, request: &CompletionRequest) -> Result<String> {
        let mut step = step;
        loop {
            match step {
                MockStep::Text(text) => return Ok(text),
                MockStep::Error(msg) => return Err(ErgonError::Backend(msg)),
                MockStep::Echo => {
                    return Ok(request.last_user_message().unwrap_or_default().to_string());
                }
                MockStep::Hang => std::future::pending::<()>().await,
                MockStep::Delayed { delay, then } => {
                    tokio::time::sleep(delay).await;
                    step = *then;
                }
            }
        }
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let step = self.next_step(request);
        Self::play(step, request).await
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        let step = self.next_step(request);
        let request = request.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            match Self::play(step, &request).await {
                Ok(text) => {
                    // Stream the text word by word
                    for word in text.split_inclusive(' ') {
                        if tx.send(StreamChunk::TextDelta(word.to_string())).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(StreamChunk::Done).await;
                }
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ergon_core::Role;

    fn request(user: &str) -> CompletionRequest {
        CompletionRequest::new(
            "mock/test",
            vec![
                ChatMessage::new(Role::System, "be nice"),
                ChatMessage::new(Role::User, user),
            ],
        )
    }

    #[tokio::test]
    async fn test_mock_text_response() {
        let backend = MockBackend::new("mock").with_response("Hello!");
        let text = backend.complete(&request("hi")).await.unwrap();
        assert_eq!(text, "Hello!");
    }

    #[tokio::test]
    async fn test_mock_tool_call_is_function_call_json() {
        let backend = MockBackend::new("mock")
            .with_tool_call("get_weather", serde_json::json!({"location": "Boston"}));
        let text = backend.complete(&request("weather?")).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["function_call"]["name"], "get_weather");
        assert_eq!(value["function_call"]["arguments"]["location"], "Boston");
    }

    #[tokio::test]
    async fn test_mock_error() {
        let backend = MockBackend::new("mock").with_error("HTTP 503: unavailable");
        let result = backend.complete(&request("hi")).await;
        assert!(matches!(result, Err(ErgonError::Backend(_))));
    }

    #[tokio::test]
    async fn test_mock_echo_fallback() {
        let backend = MockBackend::echo().with_response("scripted");
        assert_eq!(backend.complete(&request("one")).await.unwrap(), "scripted");
        assert_eq!(backend.complete(&request("two")).await.unwrap(), "two");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let backend = MockBackend::new("mock").with_response("ok");
        let _ = backend.complete(&request("hello")).await;
        let recorded = backend.recorded_requests();
        let recorded = recorded.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].messages[0].content, "be nice");
    }

    #[tokio::test]
    async fn test_mock_hang_never_completes() {
        let backend = MockBackend::new("mock").with_hang();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            backend.complete(&request("hi")),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mock_streaming() {
        let backend = MockBackend::new("mock").with_response("Hello big world");
        let mut rx = backend.stream(&request("hi")).await.unwrap();
        let mut text = String::new();
        let mut done = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done => done = true,
                StreamChunk::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(done);
        assert_eq!(text, "Hello big world");
    }

    #[tokio::test]
    async fn test_mock_streaming_error() {
        let backend = MockBackend::new("mock").with_error("boom");
        let mut rx = backend.stream(&request("hi")).await.unwrap();
        assert!(matches!(rx.recv().await, Some(StreamChunk::Error(_))));
    }
}
