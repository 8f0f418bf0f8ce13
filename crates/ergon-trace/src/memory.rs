use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use ergon_core::{
    ErgonError, Execution, ExecutionId, Outcome, Result, TerminalDetail, TraceReader, TraceSink,
    Turn,
};

use crate::{check_append, check_not_terminal};

struct Record {
    execution: Execution,
    turns: Vec<Turn>,
}

/// Process-local trace store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryTrace {
    records: RwLock<HashMap<ExecutionId, Record>>,
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions recorded so far.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl TraceSink for MemoryTrace {
    async fn open(&self, execution: &Execution) -> Result<()> {
        let mut records = self.records.write();
        if records.contains_key(&execution.id) {
            return Err(ErgonError::sink(execution.id, "execution already opened"));
        }
        records.insert(
            execution.id,
            Record {
                execution: execution.clone(),
                turns: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append(&self, execution_id: ExecutionId, turn: &Turn) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&execution_id)
            .ok_or(ErgonError::ExecutionNotFound(execution_id))?;
        check_append(&record.execution, record.turns.len(), turn)?;
        debug!(%execution_id, seq = turn.seq, role = %turn.role, "turn recorded");
        record.turns.push(turn.clone());
        Ok(())
    }

    async fn mark_terminal(
        &self,
        execution_id: ExecutionId,
        outcome: Outcome,
        detail: Option<&TerminalDetail>,
    ) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&execution_id)
            .ok_or(ErgonError::ExecutionNotFound(execution_id))?;
        check_not_terminal(execution_id, &record.execution)?;
        record.execution.finish(outcome, detail.cloned());
        Ok(())
    }
}

#[async_trait]
impl TraceReader for MemoryTrace {
    async fn execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>> {
        Ok(self
            .records
            .read()
            .get(&execution_id)
            .map(|r| r.execution.clone()))
    }

    async fn turns(&self, execution_id: ExecutionId) -> Result<Vec<Turn>> {
        self.records
            .read()
            .get(&execution_id)
            .map(|r| r.turns.clone())
            .ok_or(ErgonError::ExecutionNotFound(execution_id))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Execution>> {
        let mut executions: Vec<Execution> = self
            .records
            .read()
            .values()
            .map(|r| r.execution.clone())
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit);
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ergon_core::Role;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_append_requires_open() {
        let trace = MemoryTrace::new();
        let id = Uuid::new_v4();
        let err = trace
            .append(id, &Turn::text(id, 0, Role::User, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ErgonError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_double_open_rejected() {
        let trace = MemoryTrace::new();
        let exec = Execution::new(Uuid::new_v4(), "a", "in");
        trace.open(&exec).await.unwrap();
        assert!(trace.open(&exec).await.is_err());
        assert_eq!(trace.len(), 1);
    }
}
