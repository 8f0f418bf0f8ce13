use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::execution::ExecutionId;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Settled result of a tool invocation: exactly one of value or error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "content", rename_all = "snake_case")]
pub enum InvocationResult {
    Value(String),
    Error(String),
}

impl InvocationResult {
    pub fn is_error(&self) -> bool {
        matches!(self, InvocationResult::Error(_))
    }

    pub fn text(&self) -> &str {
        match self {
            InvocationResult::Value(v) | InvocationResult::Error(v) => v,
        }
    }
}

/// The call half and the result half of a tool turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Value,
    /// `None` when no result was recorded.
    #[serde(default)]
    pub result: Option<InvocationResult>,
}

/// One recorded step of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub execution_id: ExecutionId,
    /// Zero-based position in the execution's history.
    pub seq: u32,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<ToolInvocation>,
}

impl Turn {
    /// Create a plain text turn.
    pub fn text(execution_id: ExecutionId, seq: u32, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            seq,
            role,
            content: content.into(),
            created_at: Utc::now(),
            invocation: None,
        }
    }

    /// Create a settled tool turn. The content mirrors the result text.
    pub fn tool(
        execution_id: ExecutionId,
        seq: u32,
        tool_name: impl Into<String>,
        arguments: Value,
        result: InvocationResult,
    ) -> Self {
        let content = result.text().to_string();
        Self {
            id: Uuid::new_v4(),
            execution_id,
            seq,
            role: Role::Tool,
            content,
            created_at: Utc::now(),
            invocation: Some(ToolInvocation {
                tool_name: tool_name.into(),
                arguments,
                result: Some(result),
            }),
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.invocation.as_ref().map(|i| i.tool_name.as_str())
    }

    /// Text as it should be replayed to the model.
    pub fn replay_content(&self) -> String {
        match &self.invocation {
            Some(inv) => match &inv.result {
                Some(InvocationResult::Value(v)) => {
                    format!("Result of tool `{}`: {}", inv.tool_name, v)
                }
                Some(InvocationResult::Error(e)) => {
                    format!("Tool `{}` failed: {}", inv.tool_name, e)
                }
                None => format!("Tool `{}` is still running", inv.tool_name),
            },
            None => self.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_turn_is_settled() {
        let turn = Turn::tool(
            Uuid::nil(),
            2,
            "get_weather",
            json!({"location": "Boston"}),
            InvocationResult::Value("72F".into()),
        );
        assert_eq!(turn.role, Role::Tool);
        assert_eq!(turn.content, "72F");
        assert_eq!(turn.tool_name(), Some("get_weather"));
        assert!(turn.invocation.as_ref().unwrap().result.is_some());
        assert!(turn.replay_content().contains("72F"));
    }

    #[test]
    fn test_error_result_replay_mentions_failure() {
        let turn = Turn::tool(
            Uuid::nil(),
            2,
            "lookup",
            json!({}),
            InvocationResult::Error("tool 'lookup' not found".into()),
        );
        assert!(turn.replay_content().starts_with("Tool `lookup` failed"));
    }

    #[test]
    fn test_text_turn_has_no_tool_name() {
        let turn = Turn::text(Uuid::nil(), 0, Role::System, "be brief");
        assert!(turn.tool_name().is_none());
        assert_eq!(turn.replay_content(), "be brief");
    }
}
