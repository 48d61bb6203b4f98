//! Tool types: definitions, invocations, and results.

use crate::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static description of an invocable tool. `parameters` is a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A request to run one tool, correlated to its eventual result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub correlation_id: CorrelationId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            correlation_id: CorrelationId::default(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Closed set of ways a tool run can fail.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "failure", content = "detail", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool timed out after {0} seconds")]
    Timeout(u64),
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("command blocked: {0}")]
    Blocked(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { output: String },
    Failure { failure: ToolFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub correlation_id: CorrelationId,
    pub tool_name: String,
    pub elapsed_ms: u64,
    pub outcome: ToolOutcome,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Text folded back into the conversation for the model to read.
    pub fn to_message_content(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { output } => output.clone(),
            ToolOutcome::Failure { failure } => format!("Error: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_renders_as_error_string() {
        let result = ToolResult {
            correlation_id: CorrelationId::from_string("t1"),
            tool_name: "shell".to_owned(),
            elapsed_ms: 3,
            outcome: ToolOutcome::Failure {
                failure: ToolFailure::Timeout(30),
            },
        };
        assert!(!result.is_success());
        assert_eq!(
            result.to_message_content(),
            "Error: tool timed out after 30 seconds"
        );
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = ToolOutcome::Failure {
            failure: ToolFailure::NotFound("nope".to_owned()),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["failure"]["failure"], "not_found");
    }
}
