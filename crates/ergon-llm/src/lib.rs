//! # ergon-llm
//!
//! Model backend adapter layer. The engine only needs one contract: replay an
//! ordered history of `{role, content}` messages and get text back, either
//! whole or as a stream of chunks. Backends behind the contract are stateless
//! between calls.

pub mod local;
pub mod mock;
pub mod provider;
pub mod retry;

pub use local::LocalBackend;
pub use mock::{MockBackend, MockStep};
pub use provider::{ChatMessage, CompletionRequest, ModelBackend, StreamChunk, split_model};
pub use retry::RetryingBackend;
