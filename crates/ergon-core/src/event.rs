use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::execution::{Outcome, TimeoutPolicy};
use crate::turn::Role;

/// Events emitted by the engine while executions run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Execution lifecycle ────────────────────────────────────
    ExecutionStarted {
        execution_id: Uuid,
        agent: String,
    },
    ExecutionTimedOut {
        execution_id: Uuid,
        policy: TimeoutPolicy,
        elapsed_ms: u64,
    },
    ExecutionFinished {
        execution_id: Uuid,
        outcome: Outcome,
        elapsed_ms: u64,
    },

    // ── Conversation ───────────────────────────────────────────
    TurnRecorded {
        execution_id: Uuid,
        seq: u32,
        role: Role,
    },
    ToolDispatched {
        execution_id: Uuid,
        tool_name: String,
    },
    ToolSettled {
        execution_id: Uuid,
        tool_name: String,
        is_error: bool,
    },
}

/// A broadcast-based event bus handed to each engine component.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<EngineEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
