use async_trait::async_trait;
use ergon_core::{Result, Role, Turn};
use serde::{Deserialize, Serialize};

/// One message of the history replayed to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.replay_content(),
        }
    }
}

/// A completion request: the full history plus sampling settings.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier, e.g. "local/llama3". Backends strip their own prefix.
    pub model: String,
    /// Ordered history; `system` content must be honored as an instruction.
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Maximum tokens to generate (None = backend default).
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Content of the most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// A chunk of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Content text delta.
    TextDelta(String),
    /// Stream is done.
    Done,
    /// An error occurred mid-stream.
    Error(String),
}

/// Split "provider/model" into its parts. A bare name has no provider.
pub fn split_model(model: &str) -> (Option<&str>, &str) {
    match model.split_once('/') {
        Some((provider, name)) => (Some(provider), name),
        None => (None, model),
    }
}

/// Trait implemented by each model backend (local server, mock, ...).
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Human-readable name, e.g. "local", "mock".
    fn name(&self) -> &str;

    /// Send a non-streaming request and return the full text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Send a streaming request. Returns a receiver for chunks.
    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;

    /// Check if this backend is reachable.
    async fn health_check(&self) -> Result<()>;
}
