//! Category tool bundles.
//!
//! An agent's `category` selects at most one bundle. A bundle adds a fixed
//! tool set to the registry, may extend the system prompt, and sees the final
//! exchange of every successful run.

use std::collections::HashMap;
use std::sync::Arc;

use ergon_core::{AgentDefinition, ToolDeclaration};

use crate::memory::{MemoryBundle, MemoryStore};
use crate::registry::ToolHandler;

/// Categories that select the memory bundle.
pub const MEMORY_CATEGORIES: [&str; 2] = ["memory", "nexus"];

/// A tool contributed by a bundle.
pub struct BundledTool {
    pub declaration: ToolDeclaration,
    pub handler: ToolHandler,
}

pub trait ToolBundle: Send + Sync {
    fn name(&self) -> &str;

    /// Tools for one execution of `agent`.
    fn tools(&self, agent: &AgentDefinition) -> Vec<BundledTool>;

    /// Extra system-prompt text for this input.
    fn system_addendum(&self, _agent: &AgentDefinition, _input: &str) -> Option<String> {
        None
    }

    /// Called with the input and final answer of a successful run.
    fn record_exchange(&self, _agent: &AgentDefinition, _input: &str, _response: &str) {}
}

/// Bundles keyed by agent category.
#[derive(Default, Clone)]
pub struct BundleCatalog {
    bundles: HashMap<String, Arc<dyn ToolBundle>>,
}

impl BundleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog with every built-in bundle registered, memories kept in `memory`.
    pub fn builtin(memory: Arc<MemoryStore>) -> Self {
        Self::new().with_bundle(&MEMORY_CATEGORIES, Arc::new(MemoryBundle::new(memory)))
    }

    pub fn with_bundle(mut self, categories: &[&str], bundle: Arc<dyn ToolBundle>) -> Self {
        for category in categories {
            self.bundles
                .insert(category.to_lowercase(), Arc::clone(&bundle));
        }
        self
    }

    pub fn for_category(&self, category: &str) -> Option<Arc<dyn ToolBundle>> {
        self.bundles.get(&category.to_lowercase()).cloned()
    }
}
