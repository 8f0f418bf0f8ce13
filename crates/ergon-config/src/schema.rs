use ergon_core::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration, read from `ergon.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErgonConfig {
    pub runner: RunnerConfig,
    pub backend: BackendConfig,
    pub trace: TraceConfig,
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

// ── Runner ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock budget per execution in seconds. 0 = no timeout.
    pub default_timeout_secs: u64,
    /// What to report when the budget runs out: "log", "alarm" or "kill".
    pub timeout_policy: String,
    /// Tool-call ceiling per session.
    pub max_tool_calls: u32,
    /// Intent resolution strategy: "structured" or "keyword".
    pub resolver: String,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens per model response (None = backend default).
    pub max_tokens: Option<u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 0,
            timeout_policy: "log".into(),
            max_tool_calls: 5,
            resolver: "structured".into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl RunnerConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }

    pub fn policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::parse_lenient(&self.timeout_policy)
    }
}

// ── Backend ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Model used when an agent definition does not name one, e.g. "local/llama3".
    pub model: String,
    /// Base URL of the Ollama-compatible local server.
    pub local_base_url: String,
    /// Retries for transient backend errors before the backend counts as unreachable.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: "local/llama3".into(),
            local_base_url: "http://127.0.0.1:11434".into(),
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

// ── Trace ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Path to the SQLite trace database. Relative paths resolve under `~/.ergon/`.
    pub db_path: PathBuf,
    /// Keep traces in memory only (nothing survives the process).
    pub in_memory: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("trace.db"),
            in_memory: false,
        }
    }
}

impl TraceConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        under_ergon_home(&self.db_path)
    }
}

/// Absolute paths are kept; relative ones land under `~/.ergon/`.
fn under_ergon_home(path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ergon")
        .join(path)
}

// ── Memory ─────────────────────────────────────────────────────

/// Storage for the memory tool bundle (`category = "memory"` agents).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the SQLite memory database. Relative paths resolve under `~/.ergon/`.
    pub db_path: PathBuf,
    /// Keep memories in memory only.
    pub in_memory: bool,
    /// Oldest entries beyond this count are pruned, per agent.
    pub max_entries_per_agent: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("memory.db"),
            in_memory: false,
            max_entries_per_agent: 200,
        }
    }
}

impl MemoryConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        under_ergon_home(&self.db_path)
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "[{}] {}: {}", tag, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl ErgonConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Backend model ───
        let model = &self.backend.model;
        if model.is_empty() {
            warnings.push(ConfigWarning {
                field: "backend.model".into(),
                message: "model is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'local/llama3' or 'mock/echo'".into()),
            });
        } else if !model.contains('/') {
            warnings.push(ConfigWarning {
                field: "backend.model".into(),
                message: format!("model '{}' should be in 'provider/model' format", model),
                severity: WarningSeverity::Warning,
                hint: Some("Use 'local/llama3', 'ollama/mistral', or 'mock/echo'".into()),
            });
        }

        // ── Temperature ───
        if self.runner.temperature < 0.0 || self.runner.temperature > 2.0 {
            warnings.push(ConfigWarning {
                field: "runner.temperature".into(),
                message: format!("temperature {} is out of range", self.runner.temperature),
                severity: WarningSeverity::Error,
                hint: Some("Temperature must be between 0.0 and 2.0".into()),
            });
        }

        // ── Tool-call ceiling ───
        if self.runner.max_tool_calls == 0 {
            warnings.push(ConfigWarning {
                field: "runner.max_tool_calls".into(),
                message: "max_tool_calls is 0, every session ends exhausted".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The usual ceiling is 5".into()),
            });
        }

        // ── Memory retention ───
        if self.memory.max_entries_per_agent == 0 {
            warnings.push(ConfigWarning {
                field: "memory.max_entries_per_agent".into(),
                message: "max_entries_per_agent is 0, memory agents remember nothing".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The default keeps the 200 newest entries".into()),
            });
        }

        // ── Timeout policy ───
        let valid_policies = ["log", "alarm", "kill"];
        if !valid_policies.contains(&self.runner.timeout_policy.to_lowercase().as_str()) {
            warnings.push(ConfigWarning {
                field: "runner.timeout_policy".into(),
                message: format!(
                    "unknown timeout policy '{}', 'log' will be used",
                    self.runner.timeout_policy
                ),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_policies.join(", "))),
            });
        }

        // ── Resolver ───
        let valid_resolvers = ["structured", "keyword"];
        if !valid_resolvers.contains(&self.runner.resolver.as_str()) {
            warnings.push(ConfigWarning {
                field: "runner.resolver".into(),
                message: format!("unknown resolver '{}'", self.runner.resolver),
                severity: WarningSeverity::Error,
                hint: Some(format!("Valid values: {}", valid_resolvers.join(", "))),
            });
        }

        // ── Timeout ───
        if self.runner.default_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "runner.default_timeout_secs".into(),
                message: "no default timeout, executions may run indefinitely".into(),
                severity: WarningSeverity::Info,
                hint: Some("Pass --timeout per run or set e.g. 300".into()),
            });
        }

        // ── Backend URL ───
        if !self.backend.local_base_url.starts_with("http://")
            && !self.backend.local_base_url.starts_with("https://")
        {
            warnings.push(ConfigWarning {
                field: "backend.local_base_url".into(),
                message: format!("'{}' is not an http(s) URL", self.backend.local_base_url),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 'http://127.0.0.1:11434'".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
