use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use sage_events::BusHandle;
use sage_protocol::{
    ChatMessage, ChatRequest, EventPayload, ModelBackend, ToolDefinition, ToolFailure,
    ToolInvocation, ToolOutcome, ToolResult,
};
use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use crate::{ToolRegistry, ToolsConfig};

const SUMMARY_INSTRUCTION: &str = "Summarize the following tool output. Keep every number, name, \
     path and error message the user may need. Reply with the summary only.";

/// Shallow check of `args` against the `type` and `required` keys of the
/// tool's JSON schema.
pub fn validate_arguments(definition: &ToolDefinition, args: &Value) -> Result<(), ToolFailure> {
    let schema = &definition.parameters;
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(ToolFailure::Validation(format!(
            "{} expects an object of arguments",
            definition.name
        )));
    }
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for name in required.iter().filter_map(Value::as_str) {
        if args.get(name).is_none_or(Value::is_null) {
            return Err(ToolFailure::Validation(format!(
                "missing required argument `{name}`"
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    backend: Option<Arc<dyn ModelBackend>>,
    config: ToolsConfig,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: ToolsConfig) -> Self {
        Self {
            registry,
            backend: None,
            config,
        }
    }

    /// Backend used to summarize oversized outputs.
    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    /// Run every invocation concurrently. Results keep the input order and a
    /// failure never cancels its siblings.
    pub async fn execute_all(
        &self,
        bus: &BusHandle,
        invocations: Vec<ToolInvocation>,
    ) -> Vec<ToolResult> {
        join_all(
            invocations
                .into_iter()
                .map(|invocation| self.execute(bus, invocation)),
        )
        .await
    }

    pub async fn execute(&self, bus: &BusHandle, invocation: ToolInvocation) -> ToolResult {
        let span = info_span!(
            "tool.execute",
            tool = %invocation.tool_name,
            correlation_id = %invocation.correlation_id
        );
        self.execute_inner(bus, invocation).instrument(span).await
    }

    async fn execute_inner(&self, bus: &BusHandle, invocation: ToolInvocation) -> ToolResult {
        let ToolInvocation {
            correlation_id,
            tool_name,
            arguments,
        } = invocation;

        emit(
            bus,
            EventPayload::ToolStart {
                correlation_id: correlation_id.clone(),
                tool_name: tool_name.clone(),
                args: arguments.clone(),
            },
        );

        let started = Instant::now();
        let outcome = self.run_tool(&tool_name, &arguments).await;
        let outcome = match outcome {
            Ok(output) => Ok(self.fit_output(&tool_name, output).await),
            Err(failure) => Err(failure),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(output) => {
                debug!(elapsed_ms, "tool completed");
                emit(
                    bus,
                    EventPayload::ToolComplete {
                        correlation_id: correlation_id.clone(),
                        tool_name: tool_name.clone(),
                        args: arguments,
                        output: output.clone(),
                        elapsed_ms,
                    },
                );
                ToolResult {
                    correlation_id,
                    tool_name,
                    elapsed_ms,
                    outcome: ToolOutcome::Success { output },
                }
            }
            Err(failure) => {
                warn!(elapsed_ms, error = %failure, "tool failed");
                emit(
                    bus,
                    EventPayload::ToolError {
                        correlation_id: correlation_id.clone(),
                        tool_name: tool_name.clone(),
                        args: arguments,
                        message: failure.to_string(),
                        elapsed_ms,
                    },
                );
                ToolResult {
                    correlation_id,
                    tool_name,
                    elapsed_ms,
                    outcome: ToolOutcome::Failure { failure },
                }
            }
        }
    }

    async fn run_tool(&self, tool_name: &str, arguments: &Value) -> Result<String, ToolFailure> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolFailure::NotFound(tool_name.to_owned()))?;
        validate_arguments(tool.definition(), arguments)?;

        let limit = Duration::from_secs(self.config.timeout_secs.max(1));
        match tokio::time::timeout(limit, tool.invoke(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::Timeout(self.config.timeout_secs.max(1))),
        }
    }

    /// Keep output under `max_output_chars`: summarize through the backend
    /// when possible, otherwise truncate with a notice.
    async fn fit_output(&self, tool_name: &str, output: String) -> String {
        let max = self.config.max_output_chars;
        let length = output.chars().count();
        if length <= max {
            return output;
        }

        if self.config.summarize_oversized {
            if let Some(backend) = &self.backend {
                let request = ChatRequest::summarize(
                    vec![
                        ChatMessage::system(SUMMARY_INSTRUCTION),
                        ChatMessage::user(format!("Output of `{tool_name}`:\n{output}")),
                    ],
                    self.config.summary_model.clone(),
                );
                match backend.chat(request).await {
                    Ok(response) if !response.content.trim().is_empty() => {
                        debug!(original_chars = length, "tool output summarized");
                        return format!("[summarized from {length} characters]\n{}", response.content);
                    }
                    Ok(_) => warn!("empty summary; truncating tool output"),
                    Err(error) => warn!(%error, "summary failed; truncating tool output"),
                }
            }
        }

        let mut truncated: String = output.chars().take(max).collect();
        truncated.push_str(&format!(
            "\n[output truncated: {} characters omitted]",
            length - max
        ));
        truncated
    }
}

fn emit(bus: &BusHandle, payload: EventPayload) {
    if let Err(error) = bus.emit(payload) {
        warn!(%error, "failed to emit tool event");
    }
}
