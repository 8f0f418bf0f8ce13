//! The caller surface: run an agent on one input and always get a value back.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info};

use ergon_config::RunnerConfig;
use ergon_core::{
    AgentDefinition, EngineEvent, ErgonError, EventBus, Execution, Outcome, Severity,
    TerminalDetail, TimeoutPolicy, TraceSink,
};
use ergon_llm::ModelBackend;

use crate::bundle::BundleCatalog;
use crate::registry::{ArtifactResolver, NoArtifacts, ToolRegistry};
use crate::resolver::{ResolverKind, ResolverSettings};
use crate::session::{ConversationSession, DEFAULT_MAX_TOOL_CALLS, StreamEvent};
use crate::supervisor::{ExecutionSupervisor, TerminalResult, fault_message};

/// Per-run overrides. Anything left `None` falls back to [`RunnerSettings`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Wall-clock budget. `Duration::ZERO` runs without one, whatever the default.
    pub timeout: Option<Duration>,
    pub policy: Option<TimeoutPolicy>,
    /// Overrides the agent's model identifier.
    pub model: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_tool_calls: u32,
    pub resolver: ResolverKind,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub default_timeout: Option<Duration>,
    pub default_policy: TimeoutPolicy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            resolver: ResolverKind::Structured,
            temperature: 0.7,
            max_tokens: None,
            default_timeout: None,
            default_policy: TimeoutPolicy::Log,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_tool_calls: config.max_tool_calls,
            resolver: ResolverKind::from_name(&config.resolver),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            default_timeout: config.default_timeout(),
            default_policy: config.policy(),
        }
    }
}

/// Runs agents against a model backend, recording everything to a trace sink.
///
/// No category bundles are registered until [`AgentRunner::with_bundles`].
/// Cheap to clone; clones share the backend, sink, bundles and event bus.
#[derive(Clone)]
pub struct AgentRunner {
    backend: Arc<dyn ModelBackend>,
    sink: Arc<dyn TraceSink>,
    artifacts: Arc<dyn ArtifactResolver>,
    bundles: BundleCatalog,
    events: EventBus,
    settings: RunnerSettings,
}

impl AgentRunner {
    pub fn new(backend: Arc<dyn ModelBackend>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            backend,
            sink,
            artifacts: Arc::new(NoArtifacts),
            bundles: BundleCatalog::new(),
            events: EventBus::default(),
            settings: RunnerSettings::default(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactResolver>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_bundles(mut self, bundles: BundleCatalog) -> Self {
        self.bundles = bundles;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn resolver_settings(&self, agent: &AgentDefinition, options: &RunOptions) -> ResolverSettings {
        let model = options.model.clone().unwrap_or_else(|| agent.model.clone());
        ResolverSettings {
            model,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    fn effective_timeout(&self, options: &RunOptions) -> Option<Duration> {
        match options.timeout {
            Some(limit) if limit.is_zero() => None,
            Some(limit) => Some(limit),
            None => self.settings.default_timeout,
        }
    }

    fn supervisor(&self) -> ExecutionSupervisor {
        ExecutionSupervisor::new(Arc::clone(&self.sink), self.events.clone())
    }

    /// Validate the agent and register the execution with the sink.
    async fn begin(&self, agent: &AgentDefinition, input: &str) -> Result<Execution, TerminalResult> {
        let execution = Execution::new(agent.id, &agent.name, input);
        let started = Instant::now();
        let opened = match agent.validate() {
            Ok(()) => self.sink.open(&execution).await,
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            error!(agent = %agent.name, error = %e, "execution could not start");
            return Err(early_failure(&execution, &e, started));
        }

        info!(execution = %execution.id, agent = %agent.name, model = %agent.model, "execution started");
        self.events.publish(EngineEvent::ExecutionStarted {
            execution_id: execution.id,
            agent: agent.name.clone(),
        });
        Ok(execution)
    }

    /// Run `agent` on `input` to a terminal result.
    pub async fn run(
        &self,
        agent: &AgentDefinition,
        input: &str,
        options: RunOptions,
    ) -> TerminalResult {
        let execution = match self.begin(agent, input).await {
            Ok(execution) => execution,
            Err(result) => return result,
        };

        let registry = Arc::new(ToolRegistry::build(agent, self.artifacts.as_ref(), &self.bundles));
        let mut system_prompt = agent.system_prompt.clone();
        if let Some(addendum) = registry
            .bundle()
            .and_then(|bundle| bundle.system_addendum(agent, input))
        {
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&addendum);
        }

        let resolver = self
            .settings
            .resolver
            .build(Arc::clone(&self.backend), self.resolver_settings(agent, &options));
        let session = ConversationSession::new(
            execution.id,
            &agent.name,
            system_prompt,
            resolver,
            Arc::clone(&registry),
            Arc::clone(&self.sink),
            self.events.clone(),
            self.settings.max_tool_calls,
        );

        let result = self
            .supervisor()
            .supervise(
                session,
                input.to_string(),
                self.effective_timeout(&options),
                options.policy.unwrap_or(self.settings.default_policy),
            )
            .await;

        if result.outcome.is_success()
            && let Some(bundle) = registry.bundle()
        {
            bundle.record_exchange(agent, input, &result.text);
        }
        result
    }

    /// Stream a tool-less completion for `agent` on `input`.
    ///
    /// The receiver yields `Started`, any number of `TextDelta`s, then exactly
    /// one `Finished`.
    pub fn run_streaming(
        &self,
        agent: &AgentDefinition,
        input: &str,
        options: RunOptions,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let runner = self.clone();
        let agent = agent.clone();
        let input = input.to_string();

        tokio::spawn(async move {
            let execution = match runner.begin(&agent, &input).await {
                Ok(execution) => execution,
                Err(result) => {
                    let _ = tx
                        .send(StreamEvent::Finished {
                            outcome: result.outcome,
                            text: result.text,
                        })
                        .await;
                    return;
                }
            };
            let _ = tx
                .send(StreamEvent::Started {
                    execution_id: execution.id,
                })
                .await;

            let session = ConversationSession::streaming(
                execution.id,
                &agent.name,
                agent.system_prompt.clone(),
                Arc::clone(&runner.backend),
                runner.resolver_settings(&agent, &options),
                tx.clone(),
                Arc::clone(&runner.sink),
                runner.events.clone(),
            );
            let result = runner
                .supervisor()
                .supervise(
                    session,
                    input,
                    runner.effective_timeout(&options),
                    options.policy.unwrap_or(runner.settings.default_policy),
                )
                .await;

            let _ = tx
                .send(StreamEvent::Finished {
                    outcome: result.outcome,
                    text: result.text,
                })
                .await;
        });

        rx
    }
}

fn early_failure(execution: &Execution, error: &ErgonError, started: Instant) -> TerminalResult {
    TerminalResult {
        execution_id: execution.id,
        text: fault_message(error),
        outcome: Outcome::Error,
        detail: Some(TerminalDetail::new(Severity::Critical, error.to_string())),
        turns: Vec::new(),
        tool_calls: 0,
        elapsed: started.elapsed(),
    }
}
