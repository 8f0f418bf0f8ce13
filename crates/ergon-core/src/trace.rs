use async_trait::async_trait;

use crate::execution::{Execution, ExecutionId, Outcome, TerminalDetail};
use crate::turn::Turn;

/// Append-only persistence for one execution's turns and terminal outcome.
///
/// Implementations must:
/// - make an appended turn visible to readers before `append` returns;
/// - keep each execution's turns in `seq` order, rejecting a turn whose
///   `seq` is not exactly the current history length;
/// - reject appends and a second `mark_terminal` once an execution is terminal;
/// - accept concurrent calls for different executions.
///
/// `append` should not hold an await point across the commit, so that
/// cancelling the caller can never leave half a write behind.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Register a new execution before its session starts.
    async fn open(&self, execution: &Execution) -> crate::Result<()>;

    /// Append one turn to an open execution.
    async fn append(&self, execution_id: ExecutionId, turn: &Turn) -> crate::Result<()>;

    /// Record the terminal outcome of an execution.
    async fn mark_terminal(
        &self,
        execution_id: ExecutionId,
        outcome: Outcome,
        detail: Option<&TerminalDetail>,
    ) -> crate::Result<()>;
}

/// Read side of a trace store, for inspection and tests.
#[async_trait]
pub trait TraceReader: Send + Sync {
    async fn execution(&self, execution_id: ExecutionId) -> crate::Result<Option<Execution>>;

    async fn turns(&self, execution_id: ExecutionId) -> crate::Result<Vec<Turn>>;

    /// Most recently started executions first.
    async fn recent(&self, limit: usize) -> crate::Result<Vec<Execution>>;
}
