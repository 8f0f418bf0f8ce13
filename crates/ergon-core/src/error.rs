use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the Ergon engine.
#[derive(Error, Debug)]
pub enum ErgonError {
    // ── Model backend errors ───────────────────────────────────
    #[error("model backend error: {0}")]
    Backend(String),

    #[error("model backend rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("model backend unreachable after {attempts} attempts: {reason}")]
    BackendUnreachable { attempts: u32, reason: String },

    #[error("no backend configured for model: {0}")]
    ModelNotFound(String),

    // ── Trace errors ───────────────────────────────────────────
    #[error("trace sink rejected write for execution {execution_id}: {reason}")]
    TraceSink { execution_id: Uuid, reason: String },

    #[error("trace store error: {0}")]
    Trace(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    // ── Memory errors ──────────────────────────────────────────
    #[error("memory store error: {0}")]
    Memory(String),

    // ── Agent errors ───────────────────────────────────────────
    #[error("invalid agent definition: {0}")]
    AgentDefinition(String),

    #[error("session task failed: {0}")]
    SessionTask(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ErgonError {
    /// Shorthand for a sink rejection.
    pub fn sink(execution_id: Uuid, reason: impl Into<String>) -> Self {
        Self::TraceSink {
            execution_id,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ErgonError>;
