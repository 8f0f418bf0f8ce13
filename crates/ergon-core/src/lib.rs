//! # ergon-core
//!
//! Core types, traits, and primitives for the Ergon agent execution engine.
//! This crate defines the shared vocabulary used by every other crate in the workspace:
//! agent definitions, conversation turns, execution records, the trace sink
//! contract, and the engine event bus.

pub mod agent;
pub mod error;
pub mod event;
pub mod execution;
pub mod trace;
pub mod turn;

pub use agent::{AgentDefinition, ToolDeclaration};
pub use error::{ErgonError, Result};
pub use event::{EngineEvent, EventBus};
pub use execution::{
    AgentId, Execution, ExecutionId, Outcome, Severity, TerminalDetail, TimeoutPolicy,
};
pub use trace::{TraceReader, TraceSink};
pub use turn::{InvocationResult, Role, ToolInvocation, Turn};
