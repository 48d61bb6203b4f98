//! Tool registry and execution.
//!
//! A [`Tool`] pairs a static [`ToolDefinition`] with an async `invoke`. The
//! [`ToolRegistry`] owns tools by unique name; the [`ToolExecutor`] runs
//! invocations against it and reports every run on the bus.

mod builtin;
mod executor;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;
use sage_protocol::{KernelError, KernelResult, ToolDefinition, ToolFailure};
use sage_sandbox::SandboxRunner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use builtin::{CalculatorTool, DateTimeTool, FsReadTool, FsWriteTool, ShellTool};
pub use executor::{ToolExecutor, validate_arguments};

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure>;
}

/// Wraps a synchronous closure as a tool.
pub struct FnTool<F> {
    definition: ToolDefinition,
    handler: F,
}

impl<F> FnTool<F>
where
    F: Fn(&Value) -> Result<String, ToolFailure> + Send + Sync,
{
    pub fn new(definition: ToolDefinition, handler: F) -> Self {
        Self {
            definition,
            handler,
        }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&Value) -> Result<String, ToolFailure> + Send + Sync,
{
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        (self.handler)(args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub enable_builtin: bool,
    pub enable_shell: bool,
    pub enable_fs: bool,
    /// Root that `fs_*` and `shell` are confined to.
    pub workspace_root: PathBuf,
    pub timeout_secs: u64,
    /// Outputs longer than this (in characters) are summarized or truncated.
    pub max_output_chars: usize,
    pub summarize_oversized: bool,
    pub summary_model: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enable_builtin: true,
            enable_shell: true,
            enable_fs: true,
            workspace_root: PathBuf::from("."),
            timeout_secs: 30,
            max_output_chars: 8_000,
            summarize_oversized: true,
            summary_model: None,
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<IndexMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tools enabled in `config`.
    pub fn with_builtin_tools(
        config: &ToolsConfig,
        sandbox: Arc<dyn SandboxRunner>,
    ) -> KernelResult<Self> {
        let registry = Self::new();
        if !config.enable_builtin {
            return Ok(registry);
        }
        registry.register(Arc::new(CalculatorTool::new()))?;
        registry.register(Arc::new(DateTimeTool::new()))?;
        if config.enable_shell {
            registry.register(Arc::new(ShellTool::new(
                sandbox,
                config.workspace_root.clone(),
            )))?;
        }
        if config.enable_fs {
            registry.register(Arc::new(FsReadTool::new(config.workspace_root.clone())))?;
            registry.register(Arc::new(FsWriteTool::new(config.workspace_root.clone())))?;
        }
        Ok(registry)
    }

    /// Fails with `DuplicateRegistration` if the name is taken; the existing
    /// tool is kept.
    pub fn register(&self, tool: Arc<dyn Tool>) -> KernelResult<()> {
        let name = tool.definition().name.clone();
        let mut tools = self.tools.write();
        if tools.contains_key(&name) {
            return Err(KernelError::DuplicateRegistration { kind: "tool", name });
        }
        debug!(tool = %name, "tool registered");
        tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Registered names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.write().shift_remove(name).is_some()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .values()
            .map(|tool| tool.definition().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}
