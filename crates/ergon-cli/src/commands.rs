use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use ergon_config::{ConfigLoader, ErgonConfig};
use ergon_core::{AgentDefinition, ErgonError, Outcome, Role, TimeoutPolicy, TraceReader, TraceSink};
use ergon_llm::{LocalBackend, MockBackend, ModelBackend, RetryingBackend, split_model};
use ergon_runtime::{
    AgentRunner, BundleCatalog, CommandArtifacts, MEMORY_CATEGORIES, MemoryStore, RunOptions,
    RunnerSettings, TerminalResult,
};
use ergon_trace::{MemoryTrace, SqliteTrace};

/// Ergon: run agents as bounded, supervised model/tool conversations
#[derive(Parser)]
#[command(name = "ergon", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to ergon.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an agent on one input
    Run {
        /// Agent definition file (TOML)
        #[arg(short, long)]
        agent: PathBuf,
        /// The user input
        #[arg(short, long)]
        input: String,
        /// Wall-clock budget in seconds, 0 for none (overrides runner.default_timeout_secs)
        #[arg(long)]
        timeout: Option<f64>,
        /// Timeout policy: log, alarm or kill
        #[arg(long)]
        policy: Option<String>,
        /// Print the terminal result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the recorded turns of one execution
    Trace {
        /// Execution id
        id: Uuid,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent executions
    Executions {
        /// Number of executions to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that the model backend answers
    Health {
        /// Model identifier to check (defaults to backend.model)
        #[arg(short, long)]
        model: Option<String>,
    },
}

impl Cli {
    pub async fn run(self) -> ergon_core::Result<ExitCode> {
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(log_level, &config.logging.format);
        config_loader.report();

        match self.command {
            Commands::Run {
                agent,
                input,
                timeout,
                policy,
                json,
            } => Self::cmd_run(config, &agent, input, timeout, policy, json).await,
            Commands::Trace { id, json } => Self::cmd_trace(config, id, json).await,
            Commands::Executions { limit } => Self::cmd_executions(config, limit).await,
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Health { model } => Self::cmd_health(config, model).await,
        }
    }

    async fn cmd_run(
        config: ErgonConfig,
        agent_path: &Path,
        input: String,
        timeout: Option<f64>,
        policy: Option<String>,
        json: bool,
    ) -> ergon_core::Result<ExitCode> {
        let agent = load_agent(agent_path, &config)?;
        let backend = build_backend(&agent.model, &config)?;
        let (sink, _) = open_trace(&config)?;
        let options = run_options(timeout, policy)?;

        info!(agent = %agent.name, model = %agent.model, "running agent");
        let runner = build_runner(&agent, agent_path, &config, backend, sink)?;
        let result = runner.run(&agent, &input, options).await;

        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&result_json(&result))?
            );
        } else {
            print_result(&result);
        }

        Ok(if result.outcome.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }

    async fn cmd_trace(config: ErgonConfig, id: Uuid, json: bool) -> ergon_core::Result<ExitCode> {
        let (_, reader) = open_trace(&config)?;
        let execution = reader
            .execution(id)
            .await?
            .ok_or(ErgonError::ExecutionNotFound(id))?;
        let turns = reader.turns(id).await?;

        if json {
            let value = serde_json::json!({ "execution": execution, "turns": turns });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(ExitCode::SUCCESS);
        }

        let outcome = execution
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "running".into());
        println!(
            "{} {} ({})",
            style("Execution").bold(),
            execution.id,
            outcome_style(execution.outcome, &outcome)
        );
        println!("   agent:   {}", execution.agent_name);
        println!("   started: {}", execution.started_at.to_rfc3339());
        if let Some(done) = execution.completed_at {
            println!("   elapsed: {}ms", (done - execution.started_at).num_milliseconds());
        }
        if let Some(detail) = &execution.detail {
            println!("   detail:  [{}] {}", detail.severity.as_str(), detail.message);
        }
        println!("{}", "-".repeat(80));

        for turn in &turns {
            let role = match turn.role {
                Role::System => style("system").dim(),
                Role::User => style("user").cyan(),
                Role::Assistant => style("assistant").green(),
                Role::Tool => style("tool").magenta(),
            };
            match &turn.invocation {
                Some(inv) => println!(
                    "{:>3} {:<9} {}({}) -> {}",
                    turn.seq,
                    role,
                    inv.tool_name,
                    inv.arguments,
                    truncate_output(&turn.content, 120)
                ),
                None => println!(
                    "{:>3} {:<9} {}",
                    turn.seq,
                    role,
                    truncate_output(&turn.content, 120)
                ),
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn cmd_executions(config: ErgonConfig, limit: usize) -> ergon_core::Result<ExitCode> {
        let (_, reader) = open_trace(&config)?;
        let executions = reader.recent(limit).await?;
        if executions.is_empty() {
            println!("No executions recorded.");
            return Ok(ExitCode::SUCCESS);
        }

        println!("{} ({} shown)", style("Recent executions").bold(), executions.len());
        println!("{}", "-".repeat(80));
        for execution in executions {
            let outcome = execution
                .outcome
                .map(|o| o.to_string())
                .unwrap_or_else(|| "running".into());
            println!(
                "{}  {}  {:<10} {:<16} {}",
                style(execution.started_at.format("%Y-%m-%d %H:%M:%S")).dim(),
                execution.id,
                outcome_style(execution.outcome, &outcome),
                execution.agent_name,
                truncate_output(&execution.input, 40)
            );
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn cmd_health(config: ErgonConfig, model: Option<String>) -> ergon_core::Result<ExitCode> {
        let model = model.unwrap_or_else(|| config.backend.model.clone());
        let backend = build_backend(&model, &config)?;
        match backend.health_check().await {
            Ok(()) => {
                println!("{} {} ({})", style("✓").green(), model, backend.name());
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                println!("{} {} ({}): {}", style("✗").red(), model, backend.name(), e);
                Ok(ExitCode::FAILURE)
            }
        }
    }

    fn cmd_config(config: ErgonConfig, json: bool) -> ergon_core::Result<ExitCode> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| ErgonError::Config(e.to_string()))?
            );
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

/// Read an agent definition from TOML. A missing model falls back to `backend.model`.
pub fn load_agent(path: &Path, config: &ErgonConfig) -> ergon_core::Result<AgentDefinition> {
    let raw = std::fs::read_to_string(path)?;
    parse_agent(&raw, path, config)
}

pub fn parse_agent(raw: &str, origin: &Path, config: &ErgonConfig) -> ergon_core::Result<AgentDefinition> {
    let mut table: toml::Table = toml::from_str(raw).map_err(|e| {
        ErgonError::AgentDefinition(format!("failed to parse {}: {}", origin.display(), e))
    })?;
    if !table.contains_key("model") {
        table.insert("model".into(), toml::Value::String(config.backend.model.clone()));
    }
    let agent: AgentDefinition = toml::Value::Table(table)
        .try_into()
        .map_err(|e| ErgonError::AgentDefinition(format!("{}: {}", origin.display(), e)))?;
    agent.validate()?;
    Ok(agent)
}

/// Pick the backend for a "provider/model" identifier.
pub fn build_backend(model: &str, config: &ErgonConfig) -> ergon_core::Result<Arc<dyn ModelBackend>> {
    match split_model(model) {
        (Some("mock"), _) => Ok(Arc::new(MockBackend::echo())),
        (Some("local" | "ollama") | None, _) => {
            let local = LocalBackend::new(&config.backend.local_base_url);
            Ok(Arc::new(
                RetryingBackend::new(Arc::new(local))
                    .with_max_retries(config.backend.max_retries)
                    .with_base_delay(Duration::from_millis(config.backend.retry_base_delay_ms)),
            ))
        }
        (Some(_), _) => Err(ErgonError::ModelNotFound(model.to_string())),
    }
}

/// Per-run options from the `run` flags. A zero timeout means none.
fn run_options(timeout: Option<f64>, policy: Option<String>) -> ergon_core::Result<RunOptions> {
    let mut options = RunOptions::new();
    if let Some(secs) = timeout {
        let limit = Duration::try_from_secs_f64(secs)
            .map_err(|e| ErgonError::Config(format!("invalid --timeout {secs}: {e}")))?;
        options = options.with_timeout(limit);
    }
    if let Some(p) = policy {
        options = options.with_policy(TimeoutPolicy::parse_lenient(&p));
    }
    Ok(options)
}

/// The runner for one agent file: settings from config, command tools
/// resolved beside the file, and the memory bundle for memory agents.
pub fn build_runner(
    agent: &AgentDefinition,
    agent_path: &Path,
    config: &ErgonConfig,
    backend: Arc<dyn ModelBackend>,
    sink: Arc<dyn TraceSink>,
) -> ergon_core::Result<AgentRunner> {
    let category = agent.category.to_lowercase();
    let bundles = if MEMORY_CATEGORIES.contains(&category.as_str()) {
        BundleCatalog::builtin(open_memory(config)?)
    } else {
        BundleCatalog::new()
    };
    Ok(AgentRunner::new(backend, sink)
        .with_settings(RunnerSettings::from_config(&config.runner))
        .with_artifacts(Arc::new(CommandArtifacts::beside(agent_path)))
        .with_bundles(bundles))
}

fn open_memory(config: &ErgonConfig) -> ergon_core::Result<Arc<MemoryStore>> {
    let max_entries = config.memory.max_entries_per_agent;
    let store = if config.memory.in_memory {
        MemoryStore::in_memory(max_entries)?
    } else {
        MemoryStore::open(&config.memory.resolved_db_path(), max_entries)?
    };
    Ok(Arc::new(store))
}

/// Open the configured trace store, as both sink and reader.
fn open_trace(
    config: &ErgonConfig,
) -> ergon_core::Result<(Arc<dyn TraceSink>, Arc<dyn TraceReader>)> {
    if config.trace.in_memory {
        let store = Arc::new(MemoryTrace::new());
        return Ok((store.clone(), store));
    }
    let store = Arc::new(SqliteTrace::connect(&config.trace.resolved_db_path())?);
    Ok((store.clone(), store))
}

fn result_json(result: &TerminalResult) -> serde_json::Value {
    serde_json::json!({
        "execution_id": result.execution_id,
        "outcome": result.outcome,
        "text": result.text,
        "detail": result.detail,
        "tool_calls": result.tool_calls,
        "elapsed_ms": result.elapsed.as_millis() as u64,
        "turns": result.turns,
    })
}

fn print_result(result: &TerminalResult) {
    println!("{}", result.text);
    eprintln!(
        "{} {} in {:.2}s, {} tool call(s), execution {}",
        style("▸").dim(),
        outcome_style(Some(result.outcome), result.outcome.as_str()),
        result.elapsed.as_secs_f64(),
        result.tool_calls,
        result.execution_id
    );
}

fn outcome_style(outcome: Option<Outcome>, label: &str) -> console::StyledObject<String> {
    let styled = style(label.to_string());
    match outcome {
        Some(Outcome::Success) => styled.green(),
        Some(Outcome::Exhausted) => styled.yellow(),
        Some(Outcome::TimedOut) => styled.yellow().bold(),
        Some(Outcome::Error) => styled.red().bold(),
        None => styled.dim(),
    }
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        format!("{}...", flat.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "ergon", "run", "--agent", "a.toml", "--input", "hi", "--timeout", "1.5", "--policy",
            "kill",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                timeout, policy, ..
            } => {
                assert_eq!(timeout, Some(1.5));
                assert_eq!(policy.as_deref(), Some("kill"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_agent_with_tools_and_default_model() {
        let raw = r#"
            name = "weather"
            system_prompt = "You report the weather."

            [[tools]]
            name = "get_weather"
            description = "Get the weather"
            [tools.parameters]
            type = "object"
            required = ["location"]
            [tools.parameters.properties.location]
            type = "string"
        "#;
        let agent = parse_agent(raw, Path::new("weather.toml"), &ErgonConfig::default()).unwrap();
        assert_eq!(agent.model, "local/llama3");
        assert_eq!(agent.category, "standard");
        assert_eq!(agent.tools[0].required_params(), vec!["location"]);
    }

    #[test]
    fn test_parse_agent_rejects_duplicate_tools() {
        let raw = r#"
            name = "dup"
            model = "mock/echo"
            [[tools]]
            name = "x"
            description = ""
            parameters = {}
            [[tools]]
            name = "x"
            description = ""
            parameters = {}
        "#;
        let err = parse_agent(raw, Path::new("dup.toml"), &ErgonConfig::default()).unwrap_err();
        assert!(matches!(err, ErgonError::AgentDefinition(_)));
    }

    #[test]
    fn test_build_backend_by_provider() {
        let config = ErgonConfig::default();
        assert_eq!(build_backend("mock/echo", &config).unwrap().name(), "mock");
        assert_eq!(build_backend("ollama/mistral", &config).unwrap().name(), "local");
        assert!(matches!(
            build_backend("acme/gpt", &config),
            Err(ErgonError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_trace_is_readable_after_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ErgonConfig::default();
        config.trace.db_path = dir.path().join("trace.db");

        let (sink, reader) = open_trace(&config).unwrap();
        let agent = AgentDefinition::new("echo", "mock/echo", "");
        let backend = build_backend(&agent.model, &config).unwrap();
        let result = AgentRunner::new(backend, sink)
            .run(&agent, "ping", RunOptions::new())
            .await;

        assert_eq!(result.outcome, Outcome::Success);
        let json = result_json(&result);
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["text"], "ping");
        assert_eq!(reader.turns(result.execution_id).await.unwrap().len(), 3);
    }

    #[test]
    fn test_run_options_from_flags() {
        let options = run_options(Some(0.0), Some("alarm".into())).unwrap();
        assert_eq!(options.timeout, Some(Duration::ZERO));
        assert_eq!(options.policy, Some(TimeoutPolicy::Alarm));
        assert!(run_options(Some(-1.0), None).is_err());
        assert!(run_options(None, None).unwrap().timeout.is_none());
    }

    #[tokio::test]
    async fn test_health_command() {
        let mut config = ErgonConfig::default();
        let ok = Cli::cmd_health(config.clone(), Some("mock/echo".into())).await.unwrap();
        assert_eq!(ok, ExitCode::SUCCESS);

        config.backend.local_base_url = "http://127.0.0.1:1".into();
        let down = Cli::cmd_health(config, Some("local/llama3".into())).await.unwrap();
        assert_eq!(down, ExitCode::FAILURE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_agent_file_command_tool_is_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weather.sh"), "cat > /dev/null\necho 'Sunny, 72F'\n").unwrap();
        let agent_path = dir.path().join("weather.toml");
        std::fs::write(
            &agent_path,
            r#"
                name = "weather"
                model = "mock/test"
                [[tools]]
                name = "get_weather"
                description = "Get the weather"
                command = ["sh", "weather.sh"]
                [tools.parameters]
                type = "object"
                required = ["location"]
                [tools.parameters.properties.location]
                type = "string"
            "#,
        )
        .unwrap();

        let config = ErgonConfig::default();
        let agent = load_agent(&agent_path, &config).unwrap();
        let backend = Arc::new(
            MockBackend::new("mock")
                .with_tool_call("get_weather", serde_json::json!({"location": "Boston"}))
                .with_response("Sunny in Boston."),
        );
        let runner =
            build_runner(&agent, &agent_path, &config, backend, Arc::new(MemoryTrace::new())).unwrap();
        let result = runner.run(&agent, "Weather in Boston?", RunOptions::new()).await;

        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.turns[2].content, "Sunny, 72F");
    }

    #[tokio::test]
    async fn test_memory_agent_recalls_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ErgonConfig::default();
        config.memory.db_path = dir.path().join("memory.db");
        let agent_path = dir.path().join("nexus.toml");
        let raw = r#"
            name = "nexus"
            model = "mock/echo"
            system_prompt = "You remember."
            category = "memory"
        "#;

        let run_once = |input: &'static str| {
            let config = config.clone();
            let agent_path = agent_path.clone();
            async move {
                let agent = parse_agent(raw, &agent_path, &config).unwrap();
                let backend = build_backend(&agent.model, &config).unwrap();
                let runner =
                    build_runner(&agent, &agent_path, &config, backend, Arc::new(MemoryTrace::new()))
                        .unwrap();
                runner.run(&agent, input, RunOptions::new()).await
            }
        };

        let first = run_once("my dog is named Rex").await;
        assert_eq!(first.outcome, Outcome::Success);
        let second = run_once("what is my dog called").await;
        assert!(second.turns[0].content.starts_with("You remember."));
        assert!(second.turns[0].content.contains("Rex"));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("a\nb", 10), "a b");
        assert_eq!(truncate_output("abcdef", 3), "abc...");
    }
}
