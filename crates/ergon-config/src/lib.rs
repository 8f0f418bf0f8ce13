//! # ergon-config
//!
//! Configuration system for the Ergon engine. Reads from `ergon.toml` and
//! environment variables, in that precedence order (env wins).

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::ErgonConfig;
pub use schema::{
    BackendConfig, ConfigWarning, LoggingConfig, MemoryConfig, RunnerConfig, TraceConfig, WarningSeverity,
};
