//! Bounded agentic loop: model call, tool execution, results folded back.

use std::sync::Arc;

use sage_events::BusHandle;
use sage_protocol::{
    BackendError, ChatMessage, ChatRequest, ModelBackend, ToolDefinition, ToolInvocation,
    ToolResult,
};
use sage_tools::ToolExecutor;
use tracing::{debug, info};

use crate::parse::tool_requests;

const SUMMARY_INSTRUCTION: &str = "Summarize the tool results below so they can be used to \
     answer the user. Keep every figure, name and error. Reply with the summary only.";

#[derive(Debug)]
pub enum LoopOutcome {
    /// The model replied without requesting tools.
    Answered {
        reply: String,
        /// Tool rounds that ran before the reply.
        iterations: usize,
        results: Vec<ToolResult>,
    },
    /// Every allowed model call asked for more tools.
    CapReached { results: Vec<ToolResult> },
}

pub struct ToolLoop<'a> {
    pub backend: &'a Arc<dyn ModelBackend>,
    pub executor: &'a ToolExecutor,
    pub bus: &'a BusHandle,
    pub max_iterations: usize,
    pub model: Option<String>,
}

impl ToolLoop<'_> {
    /// Run the loop over `messages`, appending assistant and tool turns as it
    /// goes. At most `max_iterations` model calls are made.
    pub async fn run(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<LoopOutcome, BackendError> {
        let mut results = Vec::new();
        let mut iteration = 0;

        while iteration < self.max_iterations {
            let mut request = ChatRequest::new(messages.clone()).with_tools(tools.to_vec());
            request.model = self.model.clone();
            let response = self.backend.chat(request).await?;

            let calls = tool_requests(&response);
            if calls.is_empty() {
                debug!(iteration, "model answered without tools");
                return Ok(LoopOutcome::Answered {
                    reply: response.content,
                    iterations: iteration,
                    results,
                });
            }

            debug!(iteration, calls = calls.len(), "model requested tools");
            messages.push(ChatMessage::assistant(response.content));

            let mut call_ids = Vec::with_capacity(calls.len());
            let invocations: Vec<ToolInvocation> = calls
                .into_iter()
                .map(|call| {
                    let invocation = ToolInvocation::new(call.name, call.arguments);
                    call_ids.push(
                        call.id
                            .unwrap_or_else(|| invocation.correlation_id.to_string()),
                    );
                    invocation
                })
                .collect();

            let round = self.executor.execute_all(self.bus, invocations).await;
            for (result, call_id) in round.iter().zip(call_ids) {
                messages.push(ChatMessage::tool(
                    result.tool_name.clone(),
                    call_id,
                    result.to_message_content(),
                ));
            }
            results.extend(round);
            iteration += 1;
        }

        info!(max_iterations = self.max_iterations, "tool iteration cap reached");
        Ok(LoopOutcome::CapReached { results })
    }
}

/// Tool results as plain text, one block per call.
pub fn render_results(results: &[ToolResult]) -> String {
    results
        .iter()
        .map(|result| format!("[{}]\n{}", result.tool_name, result.to_message_content()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One-shot summary of the tool results for the final prompt. Falls back to
/// the raw results when the summary call fails.
pub async fn summarize_results(
    backend: &Arc<dyn ModelBackend>,
    model: Option<String>,
    user_text: &str,
    results: &[ToolResult],
) -> String {
    let raw = render_results(results);
    let request = ChatRequest::summarize(
        vec![
            ChatMessage::system(SUMMARY_INSTRUCTION),
            ChatMessage::user(format!("User request: {user_text}\n\n{raw}")),
        ],
        model,
    );
    match backend.chat(request).await {
        Ok(response) if !response.content.trim().is_empty() => response.content,
        Ok(_) => raw,
        Err(error) => {
            debug!(%error, "tool summary failed; using raw results");
            raw
        }
    }
}
