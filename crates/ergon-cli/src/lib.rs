//! # ergon-cli
//!
//! Command-line interface for the Ergon execution engine.
//!
//! ## Commands
//!
//! - `ergon run`: Run an agent definition on one input
//! - `ergon trace`: Print the recorded turns of an execution
//! - `ergon executions`: List recent executions
//! - `ergon config`: Show the effective configuration
//! - `ergon health`: Check that the model backend answers

pub mod commands;

pub use commands::Cli;
