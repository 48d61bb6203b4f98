use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sage_protocol::{ToolDefinition, ToolFailure};
use sage_sandbox::{SandboxError, SandboxRequest, SandboxRunner};
use serde_json::{Value, json};
use tokio::fs;
use tracing::{debug, instrument};

use crate::Tool;

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolFailure> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolFailure::Validation(format!("`{key}` must be a string")))
}

fn num_arg(args: &Value, key: &str) -> Result<f64, ToolFailure> {
    args.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ToolFailure::Validation(format!("`{key}` must be a number")))
}

/// Render integral results without a trailing `.0`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

pub struct CalculatorTool {
    definition: ToolDefinition,
}

impl CalculatorTool {
    pub fn new() -> Self {
        Self {
            definition: ToolDefinition {
                name: "calculator".to_owned(),
                description: "Basic arithmetic on two numbers".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "operation": {
                            "type": "string",
                            "enum": ["add", "subtract", "multiply", "divide", "power", "modulo"]
                        },
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    },
                    "required": ["operation", "a", "b"]
                }),
            },
        }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        let operation = str_arg(args, "operation")?;
        let a = num_arg(args, "a")?;
        let b = num_arg(args, "b")?;
        let value = match operation {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" if b == 0.0 => {
                return Err(ToolFailure::Execution("division by zero".to_owned()));
            }
            "divide" => a / b,
            "power" => a.powf(b),
            "modulo" if b == 0.0 => {
                return Err(ToolFailure::Execution("modulo by zero".to_owned()));
            }
            "modulo" => a % b,
            other => {
                return Err(ToolFailure::Validation(format!(
                    "unknown operation `{other}`"
                )));
            }
        };
        if !value.is_finite() {
            return Err(ToolFailure::Execution("result is not a finite number".to_owned()));
        }
        Ok(format_number(value))
    }
}

pub struct DateTimeTool {
    definition: ToolDefinition,
}

impl DateTimeTool {
    pub fn new() -> Self {
        Self {
            definition: ToolDefinition {
                name: "datetime".to_owned(),
                description: "Current UTC date and time, RFC 3339 or a strftime format"
                    .to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "format": { "type": "string" }
                    }
                }),
            },
        }
    }
}

impl Default for DateTimeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for DateTimeTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        let now = Utc::now();
        match args.get("format").and_then(Value::as_str) {
            None => Ok(now.to_rfc3339()),
            Some(format) => {
                let mut rendered = String::new();
                write!(rendered, "{}", now.format(format)).map_err(|_| {
                    ToolFailure::Validation(format!("invalid time format `{format}`"))
                })?;
                Ok(rendered)
            }
        }
    }
}

pub struct ShellTool {
    definition: ToolDefinition,
    sandbox: Arc<dyn SandboxRunner>,
    workspace_root: PathBuf,
}

impl ShellTool {
    pub fn new(sandbox: Arc<dyn SandboxRunner>, workspace_root: PathBuf) -> Self {
        Self {
            definition: ToolDefinition {
                name: "shell".to_owned(),
                description: "Run a shell command in the workspace through the sandbox"
                    .to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" }
                    },
                    "required": ["command"]
                }),
            },
            sandbox,
            workspace_root,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    #[instrument(skip(self, args), fields(tool = "shell"))]
    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        let command = str_arg(args, "command")?;
        let request = SandboxRequest::shell(command).in_dir(&self.workspace_root);
        let execution = self.sandbox.run(request).await.map_err(|error| match error {
            SandboxError::Blocked { pattern } => ToolFailure::Blocked(pattern),
            SandboxError::Timeout(secs) => ToolFailure::Timeout(secs),
            SandboxError::Spawn(error) => ToolFailure::Execution(error.to_string()),
        })?;
        debug!(exit_code = execution.exit_code, "shell finished");
        if execution.success() {
            Ok(execution.combined_output())
        } else {
            Err(ToolFailure::Execution(format!(
                "exit code {}: {}",
                execution.exit_code,
                execution.combined_output().trim_end()
            )))
        }
    }
}

/// Resolve `relative_path` under `root`, refusing paths whose nearest
/// existing ancestor (or the path itself, when it exists) resolves outside it.
fn canonical_workspace_path(root: &Path, relative_path: &str) -> Result<PathBuf, ToolFailure> {
    let escapes = || ToolFailure::Blocked(format!("path escapes workspace root: {relative_path}"));
    if relative_path.split(['/', '\\']).any(|part| part == "..") {
        return Err(escapes());
    }
    let normalized = relative_path.trim_start_matches('/');
    let candidate = root.join(normalized);
    let Some(existing) = candidate
        .ancestors()
        .take_while(|ancestor| ancestor.starts_with(root))
        .find(|ancestor| ancestor.symlink_metadata().is_ok())
    else {
        return Ok(candidate);
    };
    let canonical = existing.canonicalize().map_err(|error| {
        ToolFailure::Execution(format!("failed canonicalizing {existing:?}: {error}"))
    })?;
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if !canonical.starts_with(&root) {
        return Err(escapes());
    }
    Ok(candidate)
}

pub struct FsReadTool {
    definition: ToolDefinition,
    workspace_root: PathBuf,
}

impl FsReadTool {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            definition: ToolDefinition {
                name: "fs_read".to_owned(),
                description: "Read a UTF-8 text file from the workspace".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" }
                    },
                    "required": ["path"]
                }),
            },
            workspace_root,
        }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    #[instrument(skip(self, args), fields(tool = "fs_read"))]
    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        let path = str_arg(args, "path")?;
        let absolute = canonical_workspace_path(&self.workspace_root, path)?;
        fs::read_to_string(&absolute)
            .await
            .map_err(|error| ToolFailure::Execution(format!("failed reading {path}: {error}")))
    }
}

pub struct FsWriteTool {
    definition: ToolDefinition,
    workspace_root: PathBuf,
}

impl FsWriteTool {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            definition: ToolDefinition {
                name: "fs_write".to_owned(),
                description: "Write a UTF-8 text file in the workspace".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }),
            },
            workspace_root,
        }
    }
}

#[async_trait]
impl Tool for FsWriteTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    #[instrument(skip(self, args), fields(tool = "fs_write"))]
    async fn invoke(&self, args: &Value) -> Result<String, ToolFailure> {
        let path = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        let absolute = canonical_workspace_path(&self.workspace_root, path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|error| ToolFailure::Execution(error.to_string()))?;
        }
        fs::write(&absolute, content)
            .await
            .map_err(|error| ToolFailure::Execution(format!("failed writing {path}: {error}")))?;
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use sage_sandbox::LocalSandboxRunner;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn calculator_operations() {
        let calc = CalculatorTool::new();
        let calc = &calc;
        let run = |op: &str, a: f64, b: f64| {
            let args = json!({"operation": op, "a": a, "b": b});
            async move { calc.invoke(&args).await }
        };
        assert_eq!(run("add", 2.0, 3.0).await.unwrap(), "5");
        assert_eq!(run("subtract", 2.0, 3.0).await.unwrap(), "-1");
        assert_eq!(run("multiply", 1.5, 2.0).await.unwrap(), "3");
        assert_eq!(run("divide", 7.0, 2.0).await.unwrap(), "3.5");
        assert_eq!(run("power", 2.0, 10.0).await.unwrap(), "1024");
        assert_eq!(run("modulo", 7.0, 4.0).await.unwrap(), "3");
        assert!(matches!(
            run("divide", 1.0, 0.0).await,
            Err(ToolFailure::Execution(_))
        ));
        assert!(matches!(
            run("sqrt", 1.0, 0.0).await,
            Err(ToolFailure::Validation(_))
        ));
    }

    #[tokio::test]
    async fn datetime_supports_custom_format() {
        let tool = DateTimeTool::new();
        let year = tool.invoke(&json!({"format": "%Y"})).await.unwrap();
        assert_eq!(year.len(), 4);
        let default = tool.invoke(&json!({})).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&default).is_ok());
    }

    #[tokio::test]
    async fn fs_tools_round_trip_inside_workspace() {
        let root = unique_test_root("sage-tools-fs");
        fs::create_dir_all(&root).await.unwrap();
        let write = FsWriteTool::new(root.clone());
        let read = FsReadTool::new(root.clone());

        write
            .invoke(&json!({"path": "notes/today.txt", "content": "buy milk"}))
            .await
            .unwrap();
        let content = read
            .invoke(&json!({"path": "notes/today.txt"}))
            .await
            .unwrap();
        assert_eq!(content, "buy milk");

        let escape = read.invoke(&json!({"path": "../outside.txt"})).await;
        assert!(matches!(escape, Err(ToolFailure::Blocked(_))));
        let _ = fs::remove_dir_all(root).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fs_write_refuses_symlinked_directory_outside_workspace() {
        let root = unique_test_root("sage-tools-link-root");
        let outside = unique_test_root("sage-tools-link-outside");
        fs::create_dir_all(&root).await.unwrap();
        fs::create_dir_all(&outside).await.unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
        let write = FsWriteTool::new(root.clone());
        let read = FsReadTool::new(root.clone());

        let result = write
            .invoke(&json!({"path": "link/newdir/file.txt", "content": "leak"}))
            .await;
        assert!(matches!(result, Err(ToolFailure::Blocked(_))));
        assert!(!outside.join("newdir").exists());

        fs::write(outside.join("secret.txt"), "hidden").await.unwrap();
        let result = read.invoke(&json!({"path": "link/secret.txt"})).await;
        assert!(matches!(result, Err(ToolFailure::Blocked(_))));

        let _ = fs::remove_dir_all(root).await;
        let _ = fs::remove_dir_all(outside).await;
    }

    #[tokio::test]
    async fn shell_maps_sandbox_rejection_to_blocked() {
        let tool = ShellTool::new(
            Arc::new(LocalSandboxRunner::default()),
            std::env::temp_dir(),
        );
        let result = tool.invoke(&json!({"command": "sudo rm -rf /"})).await;
        assert!(matches!(result, Err(ToolFailure::Blocked(_))));

        let output = tool.invoke(&json!({"command": "echo sandboxed"})).await.unwrap();
        assert_eq!(output.trim(), "sandboxed");
    }
}
