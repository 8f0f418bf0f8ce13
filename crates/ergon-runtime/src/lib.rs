//! # ergon-runtime
//!
//! The execution engine. One call to [`AgentRunner::run`] drives one
//! execution from input to a [`TerminalResult`]:
//!
//! ```text
//!   AgentRunner::run(agent, input, options)
//!          │
//!          │  open Execution, build ToolRegistry (declared tools + bundle)
//!          ▼
//!   ┌──────────────────────┐
//!   │ ExecutionSupervisor  │  ← spawns the session, owns the timeout
//!   │  ┌────────────────┐  │
//!   │  │ Conversation   │  │  1. system + user turns
//!   │  │ Session        │  │  2. IntentResolver: Direct | ToolCall
//!   │  │                │  │  3. ToolRegistry::invoke → tool turn
//!   │  │                │  │  4. repeat until answer or ceiling
//!   │  └────────────────┘  │
//!   └──────────┬───────────┘
//!              │ every turn, in order
//!              ▼
//!         TraceSink
//! ```
//!
//! Nothing escapes the supervisor as an error: timeouts, exhaustion and
//! faults all come back as a [`TerminalResult`] with an [`ergon_core::Outcome`].

pub mod bundle;
pub mod memory;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod session;
pub mod supervisor;

pub use bundle::{BundleCatalog, BundledTool, MEMORY_CATEGORIES, ToolBundle};
pub use memory::{MemoryBook, MemoryBundle, MemoryEntry, MemoryStore};
pub use registry::{
    ArtifactResolver, CommandArtifacts, NoArtifacts, StaticArtifacts, ToolError, ToolErrorKind, ToolHandler,
    ToolRegistry,
};
pub use resolver::{
    IntentResolver, KeywordResolver, Resolution, ResolverKind, ResolverSettings,
    StructuredResolver, ToolCallIntent,
};
pub use runner::{AgentRunner, RunOptions, RunnerSettings};
pub use session::{ConversationSession, EXHAUSTED_MESSAGE, SessionState, StreamEvent};
pub use supervisor::{ExecutionSupervisor, TerminalResult};
