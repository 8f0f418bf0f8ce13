//! Tool registry: binds tool names to invocable handlers for one execution.
//!
//! Handlers come from two places. Category bundles (see [`crate::bundle`])
//! contribute a fixed tool set, and each declared tool is resolved against the
//! agent's compiled artifacts through an [`ArtifactResolver`]. A bundle tool
//! wins when both provide the same name. A declared tool with no artifact stays
//! visible to the model but is absent from the registry, so dispatching it
//! yields a "not found" [`ToolError`] rather than a build failure.
//!
//! Blocking handlers run on tokio's blocking pool. A blocking tool that never
//! returns keeps its worker thread busy after the execution times out; the
//! caller stops waiting, the call itself is not interrupted. Command tools
//! (see [`CommandArtifacts`]) are killed when their call is cancelled.

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use ergon_core::{AgentDefinition, ToolDeclaration};

use crate::bundle::{BundleCatalog, ToolBundle};

pub type BlockingToolFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;
pub type AsyncToolFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A tool implementation, synchronous or asynchronous.
#[derive(Clone)]
pub enum ToolHandler {
    /// Runs on a blocking worker thread.
    Blocking(Arc<BlockingToolFn>),
    /// Awaited on the session task.
    Async(Arc<AsyncToolFn>),
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolHandler::Blocking(_) => f.write_str("ToolHandler::Blocking"),
            ToolHandler::Async(_) => f.write_str("ToolHandler::Async"),
        }
    }
}

impl ToolHandler {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        ToolHandler::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        ToolHandler::Async(Arc::new(move |args| f(args).boxed()))
    }

    /// Run the handler. Errors and panics come back as a [`ToolError`].
    pub async fn call(&self, tool: &str, args: Value) -> Result<Value, ToolError> {
        match self {
            ToolHandler::Blocking(f) => {
                let f = Arc::clone(f);
                match tokio::task::spawn_blocking(move || f(args)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ToolError::failed(tool, format!("{e:#}"))),
                    Err(join) if join.is_panic() => Err(ToolError::panicked(tool)),
                    Err(join) => Err(ToolError::failed(tool, join.to_string())),
                }
            }
            ToolHandler::Async(f) => {
                let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                    Ok(fut) => fut,
                    Err(_) => return Err(ToolError::panicked(tool)),
                };
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ToolError::failed(tool, format!("{e:#}"))),
                    Err(_) => Err(ToolError::panicked(tool)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    NotFound,
    Failed,
    Panicked,
}

/// A tool failure, carried as a value so it can become a tool turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn not_found(tool: &str) -> Self {
        Self {
            kind: ToolErrorKind::NotFound,
            message: format!("tool '{tool}' not found"),
        }
    }

    pub fn failed(tool: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Failed,
            message: format!("tool '{tool}' failed: {}", reason.into()),
        }
    }

    pub fn panicked(tool: &str) -> Self {
        Self {
            kind: ToolErrorKind::Panicked,
            message: format!("tool '{tool}' panicked"),
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Resolves a declared tool to its compiled implementation.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, declaration: &ToolDeclaration) -> Option<ToolHandler>;
}

/// An artifact resolver that never finds anything.
pub struct NoArtifacts;

impl ArtifactResolver for NoArtifacts {
    fn resolve(&self, _declaration: &ToolDeclaration) -> Option<ToolHandler> {
        None
    }
}

/// Handlers registered up front, keyed by tool name.
#[derive(Default, Clone)]
pub struct StaticArtifacts {
    handlers: HashMap<String, ToolHandler>,
}

impl StaticArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: ToolHandler) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with_blocking<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.insert(name, ToolHandler::blocking(f));
        self
    }

    pub fn with_async<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.insert(name, ToolHandler::from_async(f));
        self
    }
}

impl ArtifactResolver for StaticArtifacts {
    fn resolve(&self, declaration: &ToolDeclaration) -> Option<ToolHandler> {
        self.handlers.get(&declaration.name).cloned()
    }
}

/// Declared tools implemented by an external program.
///
/// The program named by [`ToolDeclaration::command`] receives the arguments
/// as one JSON object on stdin and answers on stdout. JSON output becomes a
/// JSON value, anything else is taken as trimmed text. A non-zero exit is a
/// tool failure carrying stderr. The process runs in `base_dir`, and a
/// relative program path containing a separator resolves against it.
#[derive(Debug, Clone)]
pub struct CommandArtifacts {
    base_dir: PathBuf,
}

impl CommandArtifacts {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Commands relative to the directory holding an agent definition file.
    pub fn beside(agent_file: &Path) -> Self {
        match agent_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Self::new(dir),
            _ => Self::new("."),
        }
    }

    fn program_path(&self, program: &str) -> PathBuf {
        let path = Path::new(program);
        if path.is_relative() && path.components().count() > 1 {
            self.base_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }
}

impl ArtifactResolver for CommandArtifacts {
    fn resolve(&self, declaration: &ToolDeclaration) -> Option<ToolHandler> {
        let (program, args) = declaration.command.split_first()?;
        let command = Arc::new(ToolCommand {
            tool: declaration.name.clone(),
            program: self.program_path(program),
            args: args.to_vec(),
            dir: self.base_dir.clone(),
        });
        Some(ToolHandler::from_async(move |input| {
            let command = Arc::clone(&command);
            async move { command.run(input).await }
        }))
    }
}

struct ToolCommand {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    dir: PathBuf,
}

impl ToolCommand {
    async fn run(&self, input: Value) -> anyhow::Result<Value> {
        let started = Instant::now();
        let payload = serde_json::to_vec(&input)?;
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start '{}'", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may exit before reading it.
            match stdin.write_all(&payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(e).context("failed to write tool input");
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed waiting for tool process")?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        info!(
            tool = %self.tool,
            program = %self.program.display(),
            status = %output.status,
            duration_ms = started.elapsed().as_millis() as u64,
            "tool command finished"
        );
        if !output.status.success() {
            anyhow::bail!("exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8(output.stdout).context("tool wrote non-UTF-8 output")?;
        let stdout = stdout.trim();
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

/// Tools available to one session.
pub struct ToolRegistry {
    /// Everything offered to the model, declared tools first.
    declarations: Vec<ToolDeclaration>,
    handlers: HashMap<String, ToolHandler>,
    bundle: Option<Arc<dyn ToolBundle>>,
}

impl ToolRegistry {
    /// A registry with no tools at all.
    pub fn empty() -> Self {
        Self {
            declarations: Vec::new(),
            handlers: HashMap::new(),
            bundle: None,
        }
    }

    /// Build the registry for one execution of `agent`.
    pub fn build(
        agent: &AgentDefinition,
        artifacts: &dyn ArtifactResolver,
        bundles: &BundleCatalog,
    ) -> Self {
        let mut declarations = Vec::new();
        let mut handlers = HashMap::new();

        for declaration in &agent.tools {
            match artifacts.resolve(declaration) {
                Some(handler) => {
                    handlers.insert(declaration.name.clone(), handler);
                }
                None => {
                    warn!(agent = %agent.name, tool = %declaration.name, "no artifact for declared tool");
                }
            }
            declarations.push(declaration.clone());
        }

        let bundle = bundles.for_category(&agent.category);
        if let Some(bundle) = &bundle {
            for tool in bundle.tools(agent) {
                let name = tool.declaration.name.clone();
                if handlers.insert(name.clone(), tool.handler).is_some() {
                    debug!(tool = %name, bundle = bundle.name(), "bundle tool overrides declared tool");
                }
                match declarations.iter_mut().find(|d| d.name == name) {
                    Some(existing) => *existing = tool.declaration,
                    None => declarations.push(tool.declaration),
                }
            }
        }

        debug!(
            agent = %agent.name,
            offered = declarations.len(),
            resolved = handlers.len(),
            "tool registry built"
        );

        Self {
            declarations,
            handlers,
            bundle,
        }
    }

    /// Tool declarations offered to the intent resolver.
    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    /// The category bundle selected for this agent, if any.
    pub fn bundle(&self) -> Option<&Arc<dyn ToolBundle>> {
        self.bundle.as_ref()
    }

    /// Invoke a tool. Strings pass through; other values are serialized to JSON text.
    pub async fn invoke(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let Some(handler) = self.handlers.get(name) else {
            return Err(ToolError::not_found(name));
        };
        let value = handler.call(name, args).await?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
