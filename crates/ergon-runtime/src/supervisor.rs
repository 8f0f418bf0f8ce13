use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use ergon_core::{
    EngineEvent, ErgonError, EventBus, ExecutionId, Outcome, Role, Severity, TerminalDetail,
    TimeoutPolicy, TraceSink, Turn,
};

use crate::session::{ConversationSession, SessionEnd, SessionState, SharedTranscript};

/// How long to wait for a cancelled session task to unwind.
const ABORT_GRACE: Duration = Duration::from_millis(250);

/// What the caller gets back from every execution, whatever happened.
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub execution_id: ExecutionId,
    pub text: String,
    pub outcome: Outcome,
    pub detail: Option<TerminalDetail>,
    /// The conversation as far as it got.
    pub turns: Vec<Turn>,
    pub tool_calls: u32,
    pub elapsed: Duration,
}

/// Text returned for a fault.
pub fn fault_message(error: &ErgonError) -> String {
    format!("I encountered an error while processing your request: {error}")
}

/// Detail line for a timeout.
pub fn timeout_detail(agent_name: &str, elapsed: Duration, limit: Duration) -> String {
    format!(
        "Agent '{}' execution timed out after {:.2} seconds (timeout: {}s)",
        agent_name,
        elapsed.as_secs_f64(),
        limit.as_secs_f64()
    )
}

/// Text returned for a timeout under `policy`.
pub fn timeout_message(policy: TimeoutPolicy, detail: &str) -> String {
    match policy {
        TimeoutPolicy::Log => {
            format!("I wasn't able to complete the task in the allowed time. {detail}")
        }
        TimeoutPolicy::Alarm => format!("TIMEOUT ALARM: {detail}"),
        TimeoutPolicy::Kill => format!("EXECUTION TERMINATED: {detail}"),
    }
}

enum Settled {
    Finished(ergon_core::Result<SessionEnd>),
    TimedOut(Duration),
}

/// Runs a session as its own task under a wall-clock budget and turns every
/// ending into a [`TerminalResult`].
///
/// All three timeout policies cancel the task the same way. A blocking tool
/// that is mid-call at that point keeps running on its worker thread.
pub struct ExecutionSupervisor {
    sink: Arc<dyn TraceSink>,
    events: EventBus,
}

impl ExecutionSupervisor {
    pub fn new(sink: Arc<dyn TraceSink>, events: EventBus) -> Self {
        Self { sink, events }
    }

    pub async fn supervise(
        &self,
        session: ConversationSession,
        input: String,
        timeout: Option<Duration>,
        policy: TimeoutPolicy,
    ) -> TerminalResult {
        let execution_id = session.execution_id();
        let agent_name = session.agent_name().to_string();
        let transcript = session.transcript();
        let started = Instant::now();

        let mut handle = tokio::spawn(session.run(input));

        let settled = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => Settled::Finished(flatten(joined)),
                Err(_) => {
                    handle.abort();
                    // Wait for the task to drop so no turn lands after the timeout turn.
                    match tokio::time::timeout(ABORT_GRACE, &mut handle).await {
                        // Completed between the deadline and the abort.
                        Ok(Ok(Ok(end))) => {
                            debug!(execution = %execution_id, "session finished at the deadline");
                            Settled::Finished(Ok(end))
                        }
                        _ => Settled::TimedOut(limit),
                    }
                }
            },
            None => Settled::Finished(flatten(handle.await)),
        };

        let (outcome, text, detail) = match settled {
            Settled::Finished(Ok(end)) => {
                match self
                    .sink
                    .mark_terminal(execution_id, end.outcome, end.detail.as_ref())
                    .await
                {
                    Ok(()) => (end.outcome, end.text, end.detail),
                    Err(e) => self.fault(execution_id, &transcript, e, false).await,
                }
            }
            Settled::Finished(Err(e)) => self.fault(execution_id, &transcript, e, true).await,
            Settled::TimedOut(limit) => {
                self.timed_out(execution_id, &agent_name, &transcript, started, limit, policy)
                    .await
            }
        };

        let elapsed = started.elapsed();
        self.events.publish(EngineEvent::ExecutionFinished {
            execution_id,
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        info!(
            execution = %execution_id,
            agent = %agent_name,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "execution finished"
        );

        let (turns, tool_calls) = {
            let mut t = transcript.lock();
            t.state = SessionState::Terminal(outcome);
            (t.turns.clone(), t.tool_calls)
        };

        TerminalResult {
            execution_id,
            text,
            outcome,
            detail,
            turns,
            tool_calls,
            elapsed,
        }
    }

    async fn fault(
        &self,
        execution_id: ExecutionId,
        transcript: &SharedTranscript,
        e: ErgonError,
        record: bool,
    ) -> (Outcome, String, Option<TerminalDetail>) {
        error!(execution = %execution_id, error = %e, "execution failed");
        transcript.lock().state = SessionState::Terminal(Outcome::Error);
        let detail = TerminalDetail::new(Severity::Critical, e.to_string());
        if record
            && let Err(sink_err) = self
                .sink
                .mark_terminal(execution_id, Outcome::Error, Some(&detail))
                .await
        {
            error!(execution = %execution_id, error = %sink_err, "could not record failure");
        }
        (Outcome::Error, fault_message(&e), Some(detail))
    }

    async fn timed_out(
        &self,
        execution_id: ExecutionId,
        agent_name: &str,
        transcript: &SharedTranscript,
        started: Instant,
        limit: Duration,
        policy: TimeoutPolicy,
    ) -> (Outcome, String, Option<TerminalDetail>) {
        let elapsed = started.elapsed();
        let detail_text = timeout_detail(agent_name, elapsed, limit);
        warn!(
            execution = %execution_id,
            policy = %policy,
            elapsed_ms = elapsed.as_millis() as u64,
            "{detail_text}"
        );
        self.events.publish(EngineEvent::ExecutionTimedOut {
            execution_id,
            policy,
            elapsed_ms: elapsed.as_millis() as u64,
        });

        let turn = {
            let t = transcript.lock();
            let content = match &t.in_flight {
                Some(tool) => format!("Execution cancelled while tool '{tool}' was running: {detail_text}"),
                None => format!("Execution cancelled: {detail_text}"),
            };
            Turn::text(execution_id, t.next_seq(), Role::System, content)
        };
        match self.sink.append(execution_id, &turn).await {
            Ok(()) => {
                let mut t = transcript.lock();
                t.in_flight = None;
                t.turns.push(turn);
            }
            Err(e) => warn!(execution = %execution_id, error = %e, "could not record timeout turn"),
        }

        let detail = TerminalDetail::new(policy.severity(), detail_text.clone());
        if let Err(e) = self
            .sink
            .mark_terminal(execution_id, Outcome::TimedOut, Some(&detail))
            .await
        {
            error!(execution = %execution_id, error = %e, "could not record timeout");
        }

        (
            Outcome::TimedOut,
            timeout_message(policy, &detail_text),
            Some(detail),
        )
    }
}

fn flatten(
    joined: Result<ergon_core::Result<SessionEnd>, tokio::task::JoinError>,
) -> ergon_core::Result<SessionEnd> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ErgonError::SessionTask(e.to_string())),
    }
}
