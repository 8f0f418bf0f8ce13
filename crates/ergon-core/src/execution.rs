use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an agent definition.
pub type AgentId = Uuid;

/// Unique identifier for one execution.
pub type ExecutionId = Uuid;

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Exhausted,
    TimedOut,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Exhausted => "exhausted",
            Outcome::TimedOut => "timed_out",
            Outcome::Error => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "exhausted" => Ok(Outcome::Exhausted),
            "timed_out" => Ok(Outcome::TimedOut),
            "error" => Ok(Outcome::Error),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// Severity tag attached to a terminal execution record, for downstream alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Alarm,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Alarm => "alarm",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "alarm" => Ok(Severity::Alarm),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// What the caller wants to happen when an execution runs out of time.
///
/// All three cancel the session the same way; they differ only in the
/// returned text and the severity recorded on the execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    #[default]
    Log,
    Alarm,
    Kill,
}

impl TimeoutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPolicy::Log => "log",
            TimeoutPolicy::Alarm => "alarm",
            TimeoutPolicy::Kill => "kill",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            TimeoutPolicy::Log => Severity::Warning,
            TimeoutPolicy::Alarm => Severity::Alarm,
            TimeoutPolicy::Kill => Severity::Critical,
        }
    }

    /// Parse a policy name, falling back to `Log` (with a warning) on anything unknown.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().parse() {
            Ok(policy) => policy,
            Err(_) => {
                tracing::warn!(policy = s, "invalid timeout policy, using 'log' instead");
                TimeoutPolicy::Log
            }
        }
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(TimeoutPolicy::Log),
            "alarm" => Ok(TimeoutPolicy::Alarm),
            "kill" => Ok(TimeoutPolicy::Kill),
            other => Err(format!(
                "unknown timeout policy '{other}' (expected log, alarm or kill)"
            )),
        }
    }
}

/// Failure or timeout detail recorded alongside a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDetail {
    pub severity: Severity,
    pub message: String,
}

impl TerminalDetail {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// One bounded run of the engine against one agent for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub input: String,
    pub started_at: DateTime<Utc>,
    /// Set once the execution is terminal.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub detail: Option<TerminalDetail>,
}

impl Execution {
    pub fn new(agent_id: AgentId, agent_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            agent_name: agent_name.into(),
            input: input.into(),
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            detail: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Transition to terminal. Returns `false` if the execution was already terminal.
    pub fn finish(&mut self, outcome: Outcome, detail: Option<TerminalDetail>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.outcome = Some(outcome);
        self.detail = detail;
        self.completed_at = Some(Utc::now());
        true
    }
}
