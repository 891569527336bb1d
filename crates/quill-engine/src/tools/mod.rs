pub mod calculator;

use std::sync::Arc;

use crate::registry::{RegistryError, ToolRegistry};

pub use calculator::CalculatorTool;

/// Registry holding every built-in tool.
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CalculatorTool))?;
    Ok(registry)
}
