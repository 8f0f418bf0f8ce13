use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use ergon_core::{
    ErgonError, Execution, ExecutionId, Outcome, Result, Severity, TerminalDetail, ToolInvocation,
    TraceReader, TraceSink, Turn,
};

use crate::{check_append, check_not_terminal};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        agent_name TEXT NOT NULL,
        input TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        outcome TEXT,
        severity TEXT,
        detail TEXT
    );

    CREATE TABLE IF NOT EXISTS turns (
        execution_id TEXT NOT NULL REFERENCES executions(id),
        seq INTEGER NOT NULL,
        id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        invocation TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (execution_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at);
";

/// Durable trace store backed by SQLite (WAL mode).
///
/// Every write commits synchronously under the connection lock, so a turn
/// is durable before `append` returns and a cancelled caller never leaves
/// half a record behind.
pub struct SqliteTrace {
    db: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ErgonError {
    ErgonError::Trace(e.to_string())
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ErgonError::Trace(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| ErgonError::Trace(format!("bad id '{raw}': {e}")))
}

/// Raw `executions` row, converted outside the rusqlite closure.
struct ExecutionRow {
    id: String,
    agent_id: String,
    agent_name: String,
    input: String,
    started_at: String,
    completed_at: Option<String>,
    outcome: Option<String>,
    severity: Option<String>,
    detail: Option<String>,
}

const EXECUTION_COLUMNS: &str =
    "id, agent_id, agent_name, input, started_at, completed_at, outcome, severity, detail";

impl ExecutionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            agent_name: row.get(2)?,
            input: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            outcome: row.get(6)?,
            severity: row.get(7)?,
            detail: row.get(8)?,
        })
    }

    fn into_execution(self) -> Result<Execution> {
        let outcome = self
            .outcome
            .as_deref()
            .map(Outcome::from_str)
            .transpose()
            .map_err(ErgonError::Trace)?;
        let detail = match (self.severity, self.detail) {
            (Some(severity), Some(message)) => Some(TerminalDetail::new(
                Severity::from_str(&severity).map_err(ErgonError::Trace)?,
                message,
            )),
            _ => None,
        };
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            agent_id: parse_uuid(&self.agent_id)?,
            agent_name: self.agent_name,
            input: self.input,
            started_at: parse_timestamp(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            outcome,
            detail,
        })
    }
}

impl SqliteTrace {
    /// Open or create the trace database at the given path.
    pub fn connect(path: &Path) -> Result<Self> {
        info!(?path, "opening trace store");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn load_execution(conn: &Connection, execution_id: ExecutionId) -> Result<Option<Execution>> {
        let row = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![execution_id.to_string()],
                ExecutionRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    fn turn_count(conn: &Connection, execution_id: ExecutionId) -> Result<usize> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM turns WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl TraceSink for SqliteTrace {
    async fn open(&self, execution: &Execution) -> Result<()> {
        let conn = self.db.lock();
        if Self::load_execution(&conn, execution.id)?.is_some() {
            return Err(ErgonError::sink(execution.id, "execution already opened"));
        }
        conn.execute(
            "INSERT INTO executions (id, agent_id, agent_name, input, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution.id.to_string(),
                execution.agent_id.to_string(),
                execution.agent_name,
                execution.input,
                timestamp(&execution.started_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn append(&self, execution_id: ExecutionId, turn: &Turn) -> Result<()> {
        let conn = self.db.lock();
        let execution = Self::load_execution(&conn, execution_id)?
            .ok_or(ErgonError::ExecutionNotFound(execution_id))?;
        let len = Self::turn_count(&conn, execution_id)?;
        check_append(&execution, len, turn)?;

        let invocation = turn
            .invocation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO turns (execution_id, seq, id, role, content, invocation, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                execution_id.to_string(),
                turn.seq,
                turn.id.to_string(),
                turn.role.as_str(),
                turn.content,
                invocation,
                timestamp(&turn.created_at),
            ],
        )
        .map_err(db_err)?;
        debug!(%execution_id, seq = turn.seq, role = %turn.role, "turn persisted");
        Ok(())
    }

    async fn mark_terminal(
        &self,
        execution_id: ExecutionId,
        outcome: Outcome,
        detail: Option<&TerminalDetail>,
    ) -> Result<()> {
        let conn = self.db.lock();
        let execution = Self::load_execution(&conn, execution_id)?
            .ok_or(ErgonError::ExecutionNotFound(execution_id))?;
        check_not_terminal(execution_id, &execution)?;
        conn.execute(
            "UPDATE executions SET completed_at = ?1, outcome = ?2, severity = ?3, detail = ?4
             WHERE id = ?5 AND outcome IS NULL",
            params![
                timestamp(&Utc::now()),
                outcome.as_str(),
                detail.map(|d| d.severity.as_str()),
                detail.map(|d| d.message.as_str()),
                execution_id.to_string(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl TraceReader for SqliteTrace {
    async fn execution(&self, execution_id: ExecutionId) -> Result<Option<Execution>> {
        let conn = self.db.lock();
        Self::load_execution(&conn, execution_id)
    }

    async fn turns(&self, execution_id: ExecutionId) -> Result<Vec<Turn>> {
        let conn = self.db.lock();
        if Self::load_execution(&conn, execution_id)?.is_none() {
            return Err(ErgonError::ExecutionNotFound(execution_id));
        }
        let mut stmt = conn
            .prepare(
                "SELECT seq, id, role, content, invocation, created_at
                 FROM turns WHERE execution_id = ?1 ORDER BY seq",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![execution_id.to_string()], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?;

        let mut turns = Vec::new();
        for row in rows {
            let (seq, id, role, content, invocation, created_at) = row.map_err(db_err)?;
            turns.push(Turn {
                id: parse_uuid(&id)?,
                execution_id,
                seq,
                role: role.parse().map_err(ErgonError::Trace)?,
                content,
                created_at: parse_timestamp(&created_at)?,
                invocation: invocation
                    .as_deref()
                    .map(serde_json::from_str::<ToolInvocation>)
                    .transpose()?,
            });
        }
        Ok(turns)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.db.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 ORDER BY started_at DESC, rowid DESC LIMIT ?1"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], ExecutionRow::from_row)
            .map_err(db_err)?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.map_err(db_err)?.into_execution()?);
        }
        Ok(executions)
    }
}
