//! # ergon-trace
//!
//! Trace sinks record every turn of every execution, in order, as it happens.
//! Both stores enforce the same append rules:
//!
//! - a turn's `seq` must equal the execution's current history length;
//! - nothing is appended to a terminal execution;
//! - an execution becomes terminal exactly once.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTrace;
pub use sqlite::SqliteTrace;

use ergon_core::{ErgonError, Execution, ExecutionId, Result, Turn};

/// Check that `turn` may be appended to `execution`, which has `len` turns.
pub(crate) fn check_append(execution: &Execution, len: usize, turn: &Turn) -> Result<()> {
    if turn.execution_id != execution.id {
        return Err(ErgonError::sink(
            execution.id,
            format!("turn belongs to execution {}", turn.execution_id),
        ));
    }
    if execution.is_terminal() {
        return Err(ErgonError::sink(
            execution.id,
            "execution is terminal, no further turns accepted",
        ));
    }
    if turn.seq as usize != len {
        return Err(ErgonError::sink(
            execution.id,
            format!("out-of-order turn: seq {} but history has {} turns", turn.seq, len),
        ));
    }
    Ok(())
}

/// Reject a second terminal transition.
pub(crate) fn check_not_terminal(execution_id: ExecutionId, execution: &Execution) -> Result<()> {
    if execution.is_terminal() {
        return Err(ErgonError::sink(execution_id, "execution is already terminal"));
    }
    Ok(())
}
