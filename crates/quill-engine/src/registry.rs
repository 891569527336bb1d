use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};

use quill_core::tools::{InvocationError, Tool, ToolDefinition};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("unknown tool `{0}`")]
    NotFound(String),
}

/// Registry of available tools.
///
/// Built once at startup, then shared read-only behind an `Arc`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Names are unique.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        self.tools
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Validate `raw_arguments` against the tool's schema and run it once.
    ///
    /// A panicking tool is reported as an execution failure.
    #[instrument(skip(self, raw_arguments), fields(tool = %name))]
    pub fn invoke(&self, name: &str, raw_arguments: &str) -> Result<String, InvocationError> {
        let tool = self
            .resolve(name)
            .map_err(|_| InvocationError::NotFound(name.to_string()))?;

        let input = tool
            .input_schema()
            .parse(raw_arguments)
            .map_err(|reason| InvocationError::Schema {
                tool: name.to_string(),
                reason,
            })?;

        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| tool.execute(input)));
        let elapsed_us = started.elapsed().as_micros() as u64;

        match result {
            Ok(Ok(output)) => {
                debug!(elapsed_us, bytes = output.len(), "tool succeeded");
                Ok(output)
            }
            Ok(Err(e)) => {
                debug!(elapsed_us, error = %e, "tool failed");
                Err(InvocationError::Execution {
                    tool: name.to_string(),
                    cause: e.to_string(),
                })
            }
            Err(panic) => {
                let cause = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                warn!(elapsed_us, cause = %cause, "tool panicked");
                Err(InvocationError::Execution {
                    tool: name.to_string(),
                    cause,
                })
            }
        }
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions for the prompt, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
