//! Intent resolution: answer directly, or call exactly one tool.
//!
//! The local backends have no native function calling, so the structured
//! resolver embeds the tool list in the system message and asks for a
//! `function_call` JSON object. Anything it cannot read as a call to a
//! declared tool is taken as a direct answer.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use ergon_core::{Result, Role, ToolDeclaration, Turn};
use ergon_llm::{ChatMessage, CompletionRequest, ModelBackend};

/// What the next step of a session should be.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Direct(String),
    ToolCall(ToolCallIntent),
}

/// A validated request to call one declared tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallIntent {
    pub name: String,
    pub arguments: Value,
    /// Parameters that were missing or mistyped and got a placeholder value.
    pub substituted: Vec<String>,
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    fn name(&self) -> &str;

    /// Decide the next step for `history`, given the tools on offer.
    async fn resolve(&self, history: &[Turn], tools: &[ToolDeclaration]) -> Result<Resolution>;
}

/// Model settings shared by the resolvers.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl ResolverSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    /// Build a request replaying `history`, with `instruction` appended to the system message.
    pub fn request(&self, history: &[Turn], instruction: Option<&str>) -> CompletionRequest {
        let mut messages: Vec<ChatMessage> = history.iter().map(ChatMessage::from_turn).collect();
        if let Some(extra) = instruction {
            match messages.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => {
                    system.content = format!("{}\n\n{}", system.content, extra);
                }
                None => messages.insert(0, ChatMessage::new(Role::System, extra)),
            }
        }
        CompletionRequest::new(self.model.clone(), messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

/// Placeholder for a required parameter the model did not supply.
pub fn sentinel(param: &str) -> String {
    format!("default_{param}")
}

/// Whether `value` is the placeholder for `param`.
pub fn is_sentinel(param: &str, value: &str) -> bool {
    value.strip_prefix("default_") == Some(param)
}

/// The instruction block listing `tools` and the call convention.
pub fn tool_instruction(tools: &[ToolDeclaration]) -> String {
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    let descriptions: Vec<String> = tools
        .iter()
        .map(|t| {
            let params = t.param_names().join(", ");
            format!("{}({}): {}", t.name, params, t.description)
        })
        .collect();
    format!(
        "Available tools: {}\n\nTool descriptions:\n{}\n\n\
         To use a tool, respond with a JSON object with this format:\n\
         {{\"function_call\": {{\"name\": \"tool_name\", \"arguments\": {{\"arg1\": \"value1\"}}}}}}\n\n\
         If you don't need to use a tool, respond with your regular text answer.",
        names.join(", "),
        descriptions.join("\n")
    )
}

static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok());

/// Find a `function_call` object in model output: bare, fenced, or embedded in prose.
pub fn parse_function_call(text: &str) -> Option<(String, Value)> {
    let trimmed = text.trim();
    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(re) = FENCED_JSON.as_ref()
        && let Some(m) = re.captures(trimmed).and_then(|c| c.get(1))
    {
        candidates.push(m.as_str());
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        candidates.push(&trimmed[start..=end]);
    }

    candidates.into_iter().find_map(|candidate| {
        let value: Value = serde_json::from_str(candidate).ok()?;
        let call = value.get("function_call")?;
        let name = call.get("name")?.as_str()?.trim().to_string();
        if name.is_empty() {
            return None;
        }
        let arguments = match call.get("arguments") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::String(raw)) if raw.trim().is_empty() => Value::Object(Map::new()),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Value::Object(map),
                _ => return None,
            },
            Some(_) => return None,
        };
        Some((name, arguments))
    })
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Check `arguments` against the declared parameter spec.
///
/// A required parameter that is absent, and any declared parameter whose value
/// has the wrong primitive type, is replaced by its [`sentinel`]. Resolution
/// never fails here; the tool's own validation reports the problem.
pub fn validate_arguments(declaration: &ToolDeclaration, arguments: Value) -> (Value, Vec<String>) {
    let mut map = match arguments {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut substituted = Vec::new();

    for param in declaration.param_names() {
        let Some(value) = map.get(param) else {
            continue;
        };
        if let Some(expected) = declaration.param_type(param)
            && !value.is_null()
            && !type_matches(expected, value)
        {
            map.insert(param.to_string(), Value::String(sentinel(param)));
            substituted.push(param.to_string());
        }
    }
    for param in declaration.required_params() {
        if map.get(param).is_none_or(Value::is_null) {
            map.insert(param.to_string(), Value::String(sentinel(param)));
            substituted.push(param.to_string());
        }
    }

    (Value::Object(map), substituted)
}

// ── Structured ─────────────────────────────────────────────────

/// Resolves intent from the model's structured output.
pub struct StructuredResolver {
    backend: Arc<dyn ModelBackend>,
    settings: ResolverSettings,
}

impl StructuredResolver {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: ResolverSettings) -> Self {
        Self { backend, settings }
    }
}

#[async_trait]
impl IntentResolver for StructuredResolver {
    fn name(&self) -> &str {
        "structured"
    }

    async fn resolve(&self, history: &[Turn], tools: &[ToolDeclaration]) -> Result<Resolution> {
        if tools.is_empty() {
            let request = self.settings.request(history, None);
            return Ok(Resolution::Direct(self.backend.complete(&request).await?));
        }

        let instruction = tool_instruction(tools);
        let request = self.settings.request(history, Some(&instruction));
        let raw = self.backend.complete(&request).await?;

        let Some((name, arguments)) = parse_function_call(&raw) else {
            debug!(chars = raw.len(), "no function call in model output, answering directly");
            return Ok(Resolution::Direct(raw));
        };
        let Some(declaration) = tools.iter().find(|t| t.name == name) else {
            warn!(tool = %name, "model called an undeclared tool, answering directly");
            return Ok(Resolution::Direct(raw));
        };

        let (arguments, substituted) = validate_arguments(declaration, arguments);
        if !substituted.is_empty() {
            warn!(tool = %name, params = ?substituted, "substituted placeholder arguments");
        }
        Ok(Resolution::ToolCall(ToolCallIntent {
            name,
            arguments,
            substituted,
        }))
    }
}

// ── Keyword ────────────────────────────────────────────────────

/// Picks a tool by matching its name and description words against the user's text.
///
/// Only the newest user turn is considered, and only until a tool has
/// answered it; after that the model writes the reply.
pub struct KeywordResolver {
    backend: Arc<dyn ModelBackend>,
    settings: ResolverSettings,
}

impl KeywordResolver {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: ResolverSettings) -> Self {
        Self { backend, settings }
    }

    fn keywords(tool: &ToolDeclaration) -> Vec<String> {
        tool.name
            .split('_')
            .filter(|part| !part.is_empty())
            .map(str::to_lowercase)
            .chain(
                tool.description
                    .split_whitespace()
                    .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                    .filter(|w| w.len() > 3),
            )
            .collect()
    }

    /// The tool call the keyword heuristic makes for `input`, if any.
    pub fn match_tool(input: &str, tools: &[ToolDeclaration]) -> Option<ToolCallIntent> {
        let haystack = input.to_lowercase();
        let tool = tools
            .iter()
            .find(|tool| Self::keywords(tool).iter().any(|kw| haystack.contains(kw.as_str())))?;

        let required = tool.required_params();
        let mut arguments = Map::new();
        let mut substituted = Vec::new();
        for param in tool.param_names() {
            if param == "query" || param == "input" {
                arguments.insert(param.to_string(), Value::String(input.to_string()));
            } else if required.contains(&param) {
                arguments.insert(param.to_string(), Value::String(sentinel(param)));
                substituted.push(param.to_string());
            }
        }
        Some(ToolCallIntent {
            name: tool.name.clone(),
            arguments: Value::Object(arguments),
            substituted,
        })
    }
}

#[async_trait]
impl IntentResolver for KeywordResolver {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn resolve(&self, history: &[Turn], tools: &[ToolDeclaration]) -> Result<Resolution> {
        let last_user = history.iter().rposition(|t| t.role == Role::User);
        let answered = last_user
            .map(|i| history[i + 1..].iter().any(|t| t.role == Role::Tool))
            .unwrap_or(true);

        if !answered
            && let Some(i) = last_user
            && let Some(intent) = Self::match_tool(&history[i].content, tools)
        {
            debug!(tool = %intent.name, "keyword match");
            return Ok(Resolution::ToolCall(intent));
        }

        let request = self.settings.request(history, None);
        Ok(Resolution::Direct(self.backend.complete(&request).await?))
    }
}

/// Which resolver strategy a runner uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolverKind {
    #[default]
    Structured,
    Keyword,
}

impl ResolverKind {
    /// Parse a configured name; anything unrecognised means `Structured`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "keyword" => ResolverKind::Keyword,
            _ => ResolverKind::Structured,
        }
    }

    pub fn build(
        self,
        backend: Arc<dyn ModelBackend>,
        settings: ResolverSettings,
    ) -> Arc<dyn IntentResolver> {
        match self {
            ResolverKind::Structured => Arc::new(StructuredResolver::new(backend, settings)),
            ResolverKind::Keyword => Arc::new(KeywordResolver::new(backend, settings)),
        }
    }
}
