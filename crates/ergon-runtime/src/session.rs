//! One bounded conversation: system and user turns, then resolve/dispatch
//! rounds until a direct answer or the tool-call ceiling.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ergon_core::{
    EngineEvent, ErgonError, EventBus, ExecutionId, InvocationResult, Outcome, Result, Role,
    Severity, TerminalDetail, TraceSink, Turn,
};
use ergon_llm::{ModelBackend, StreamChunk};

use crate::registry::ToolRegistry;
use crate::resolver::{IntentResolver, Resolution, ResolverSettings};

pub const EXHAUSTED_MESSAGE: &str =
    "I've made too many tool calls without reaching a conclusion. Please try a more specific query.";

pub const DEFAULT_MAX_TOOL_CALLS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    AwaitingModel,
    DispatchingTool,
    Terminal(Outcome),
}

/// Session progress, shared with the supervisor so it survives cancellation.
#[derive(Debug)]
pub struct Transcript {
    pub state: SessionState,
    pub turns: Vec<Turn>,
    pub tool_calls: u32,
    /// Tool being dispatched right now, if any.
    pub in_flight: Option<String>,
}

impl Transcript {
    fn new() -> Self {
        Self {
            state: SessionState::Start,
            turns: Vec::new(),
            tool_calls: 0,
            in_flight: None,
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.turns.len() as u32
    }
}

pub type SharedTranscript = Arc<Mutex<Transcript>>;

/// How a session ended on its own (not cancelled, not faulted).
#[derive(Debug, Clone)]
pub struct SessionEnd {
    pub outcome: Outcome,
    pub text: String,
    pub detail: Option<TerminalDetail>,
}

/// Events forwarded to a streaming caller.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Started { execution_id: ExecutionId },
    TextDelta(String),
    Finished { outcome: Outcome, text: String },
}

enum Mode {
    Resolve {
        resolver: Arc<dyn IntentResolver>,
        registry: Arc<ToolRegistry>,
        max_tool_calls: u32,
    },
    Stream {
        backend: Arc<dyn ModelBackend>,
        settings: ResolverSettings,
        deltas: mpsc::Sender<StreamEvent>,
    },
}

/// Drives one execution's conversation. Consumed by [`ConversationSession::run`].
pub struct ConversationSession {
    execution_id: ExecutionId,
    agent_name: String,
    system_prompt: String,
    mode: Mode,
    sink: Arc<dyn TraceSink>,
    events: EventBus,
    transcript: SharedTranscript,
}

impl ConversationSession {
    /// A session that resolves intent and dispatches tools.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: ExecutionId,
        agent_name: impl Into<String>,
        system_prompt: impl Into<String>,
        resolver: Arc<dyn IntentResolver>,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn TraceSink>,
        events: EventBus,
        max_tool_calls: u32,
    ) -> Self {
        Self {
            execution_id,
            agent_name: agent_name.into(),
            system_prompt: system_prompt.into(),
            mode: Mode::Resolve {
                resolver,
                registry,
                max_tool_calls,
            },
            sink,
            events,
            transcript: Arc::new(Mutex::new(Transcript::new())),
        }
    }

    /// A tool-less session that streams a single completion to `deltas`.
    #[allow(clippy::too_many_arguments)]
    pub fn streaming(
        execution_id: ExecutionId,
        agent_name: impl Into<String>,
        system_prompt: impl Into<String>,
        backend: Arc<dyn ModelBackend>,
        settings: ResolverSettings,
        deltas: mpsc::Sender<StreamEvent>,
        sink: Arc<dyn TraceSink>,
        events: EventBus,
    ) -> Self {
        Self {
            execution_id,
            agent_name: agent_name.into(),
            system_prompt: system_prompt.into(),
            mode: Mode::Stream {
                backend,
                settings,
                deltas,
            },
            sink,
            events,
            transcript: Arc::new(Mutex::new(Transcript::new())),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn transcript(&self) -> SharedTranscript {
        Arc::clone(&self.transcript)
    }

    fn set_state(&self, state: SessionState) {
        self.transcript.lock().state = state;
    }

    /// Persist a turn, then make it part of the history.
    async fn record(&self, role: Role, content: String) -> Result<()> {
        let seq = self.transcript.lock().next_seq();
        let turn = Turn::text(self.execution_id, seq, role, content);
        self.commit(turn).await
    }

    async fn commit(&self, turn: Turn) -> Result<()> {
        self.sink.append(self.execution_id, &turn).await?;
        debug!(execution = %self.execution_id, seq = turn.seq, role = %turn.role, "turn recorded");
        self.events.publish(EngineEvent::TurnRecorded {
            execution_id: self.execution_id,
            seq: turn.seq,
            role: turn.role,
        });
        self.transcript.lock().turns.push(turn);
        Ok(())
    }

    fn history(&self) -> Vec<Turn> {
        self.transcript.lock().turns.clone()
    }

    /// Run to a terminal state. Backend and sink faults come back as `Err`.
    pub async fn run(self, input: String) -> Result<SessionEnd> {
        self.record(Role::System, self.system_prompt.clone()).await?;
        self.record(Role::User, input).await?;
        self.set_state(SessionState::AwaitingModel);

        let end = match &self.mode {
            Mode::Resolve {
                resolver,
                registry,
                max_tool_calls,
            } => {
                self.resolve_loop(resolver.as_ref(), registry, *max_tool_calls)
                    .await?
            }
            Mode::Stream {
                backend,
                settings,
                deltas,
            } => self.stream_once(backend.as_ref(), settings, deltas).await?,
        };

        self.set_state(SessionState::Terminal(end.outcome));
        Ok(end)
    }

    async fn resolve_loop(
        &self,
        resolver: &dyn IntentResolver,
        registry: &ToolRegistry,
        max_tool_calls: u32,
    ) -> Result<SessionEnd> {
        loop {
            let tool_calls = self.transcript.lock().tool_calls;
            if tool_calls >= max_tool_calls {
                warn!(execution = %self.execution_id, tool_calls, "tool-call ceiling reached");
                return Ok(SessionEnd {
                    outcome: Outcome::Exhausted,
                    text: EXHAUSTED_MESSAGE.to_string(),
                    detail: Some(TerminalDetail::new(
                        Severity::Warning,
                        format!("tool-call ceiling of {max_tool_calls} reached"),
                    )),
                });
            }

            let history = self.history();
            match resolver.resolve(&history, registry.declarations()).await? {
                Resolution::Direct(text) => {
                    self.record(Role::Assistant, text.clone()).await?;
                    return Ok(SessionEnd {
                        outcome: Outcome::Success,
                        text,
                        detail: None,
                    });
                }
                Resolution::ToolCall(intent) => {
                    self.dispatch(registry, intent.name, intent.arguments).await?;
                }
            }
        }
    }

    async fn dispatch(&self, registry: &ToolRegistry, name: String, arguments: Value) -> Result<()> {
        {
            let mut transcript = self.transcript.lock();
            transcript.state = SessionState::DispatchingTool;
            transcript.tool_calls += 1;
            transcript.in_flight = Some(name.clone());
        }
        debug!(execution = %self.execution_id, tool = %name, "dispatching tool");
        self.events.publish(EngineEvent::ToolDispatched {
            execution_id: self.execution_id,
            tool_name: name.clone(),
        });

        let result = match registry.invoke(&name, arguments.clone()).await {
            Ok(value) => InvocationResult::Value(value),
            Err(e) => {
                warn!(execution = %self.execution_id, tool = %name, error = %e, "tool invocation failed");
                InvocationResult::Error(e.message)
            }
        };
        let is_error = result.is_error();

        let seq = self.transcript.lock().next_seq();
        let turn = Turn::tool(self.execution_id, seq, name.clone(), arguments, result);
        self.commit(turn).await?;
        {
            let mut transcript = self.transcript.lock();
            transcript.in_flight = None;
            transcript.state = SessionState::AwaitingModel;
        }
        self.events.publish(EngineEvent::ToolSettled {
            execution_id: self.execution_id,
            tool_name: name,
            is_error,
        });
        Ok(())
    }

    async fn stream_once(
        &self,
        backend: &dyn ModelBackend,
        settings: &ResolverSettings,
        deltas: &mpsc::Sender<StreamEvent>,
    ) -> Result<SessionEnd> {
        let request = settings.request(&self.history(), None);
        let mut rx = backend.stream(&request).await?;
        let mut text = String::new();

        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(delta) => {
                    text.push_str(&delta);
                    // A caller that hung up still gets its execution recorded.
                    let _ = deltas.send(StreamEvent::TextDelta(delta)).await;
                }
                StreamChunk::Done => break,
                StreamChunk::Error(e) => return Err(ErgonError::Backend(e)),
            }
        }

        info!(execution = %self.execution_id, chars = text.len(), "stream complete");
        self.record(Role::Assistant, text.clone()).await?;
        Ok(SessionEnd {
            outcome: Outcome::Success,
            text,
            detail: None,
        })
    }
}
