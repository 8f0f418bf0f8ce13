use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use crate::execution::AgentId;

/// A tool an agent declares it may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Unique name within the agent, e.g. "get_weather".
    pub name: String,
    /// Human-readable description shown to the model.
    #[serde(default)]
    pub description: String,
    /// JSON-schema-like parameter spec: `{"type": "object", "properties": {...}, "required": [...]}`.
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    /// Program and arguments implementing the tool, e.g. `["python3", "tools/weather.py"]`.
    /// Empty when the implementation is supplied in-process.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

fn empty_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {}, "required": [] })
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            command: Vec::new(),
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Names listed under `required`, in declaration order.
    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Names listed under `properties`.
    pub fn param_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// The declared primitive type of a parameter ("string", "integer", ...), if any.
    pub fn param_type(&self, param: &str) -> Option<&str> {
        self.parameters
            .get("properties")
            .and_then(|p| p.get(param))
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
    }
}

/// Read-only description of an agent, owned by the authoring side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: AgentId,
    pub name: String,
    /// Model identifier in "provider/model" form, e.g. "local/llama3".
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Category tag; only used to pick a specialized tool bundle.
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

fn default_category() -> String {
    "standard".into()
}

impl AgentDefinition {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            category: default_category(),
            tools: vec![],
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolDeclaration) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDeclaration> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Structural checks: non-empty name and model, unique tool names.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::ErgonError::AgentDefinition("name is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(crate::ErgonError::AgentDefinition(format!(
                "agent '{}' has no model",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(crate::ErgonError::AgentDefinition(format!(
                    "agent '{}' declares tool '{}' twice",
                    self.name, tool.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather() -> ToolDeclaration {
        ToolDeclaration::new(
            "get_weather",
            "Get the current weather for a location",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string" },
                    "units": { "type": "string" }
                },
                "required": ["location"]
            }),
        )
    }

    #[test]
    fn test_declaration_schema_accessors() {
        let decl = weather();
        assert_eq!(decl.required_params(), vec!["location"]);
        assert_eq!(decl.param_type("location"), Some("string"));
        assert_eq!(decl.param_type("missing"), None);
        assert_eq!(decl.param_names().len(), 2);
    }

    #[test]
    fn test_declaration_without_parameters_defaults_to_empty_object() {
        let decl: ToolDeclaration =
            serde_json::from_value(json!({ "name": "ping" })).unwrap();
        assert!(decl.required_params().is_empty());
        assert!(decl.param_names().is_empty());
        assert!(decl.command.is_empty());
    }

    #[test]
    fn test_declaration_command_from_json() {
        let decl: ToolDeclaration = serde_json::from_value(json!({
            "name": "get_weather",
            "command": ["python3", "tools/weather.py"]
        }))
        .unwrap();
        assert_eq!(decl.command, vec!["python3", "tools/weather.py"]);
        assert_eq!(
            ToolDeclaration::new("x", "", json!({})).with_command(["cat"]).command,
            vec!["cat"]
        );
    }

    #[test]
    fn test_agent_validate_rejects_duplicate_tools() {
        let agent = AgentDefinition::new("dup", "mock/echo", "")
            .with_tool(weather())
            .with_tool(weather());
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_agent_validate_rejects_empty_model() {
        let agent = AgentDefinition::new("nomodel", "  ", "");
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_agent_defaults_from_json() {
        let agent: AgentDefinition = serde_json::from_value(json!({
            "name": "helper",
            "model": "mock/echo"
        }))
        .unwrap();
        assert_eq!(agent.category, "standard");
        assert!(agent.tools.is_empty());
        assert!(agent.system_prompt.is_empty());
        assert!(agent.validate().is_ok());
    }
}
