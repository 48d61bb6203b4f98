//! Offline model backend so the daemon runs without a model server.
//!
//! It recognizes `<a> <op> <b>` arithmetic and questions about the time and
//! answers them through the built-in tools; anything else is echoed back.

use async_trait::async_trait;
use futures_util::StreamExt;
use sage_protocol::{
    BackendError, ChatChunkStream, ChatMessage, ChatPurpose, ChatRequest, ChatResponse, ChatRole,
    ModelBackend, ToolCallRequest,
};
use serde_json::json;

const FACTS_HEADING: &str = "## Relevant facts\n";
const RESULTS_HEADING: &str = "## Tool results\n";

#[derive(Debug, Default)]
pub struct DemoBackend;

impl DemoBackend {
    pub fn new() -> Self {
        Self
    }
}

fn last_with_role(messages: &[ChatMessage], role: ChatRole) -> Option<&ChatMessage> {
    messages.iter().rev().find(|message| message.role == role)
}

fn section<'a>(system: &'a str, heading: &str) -> Option<&'a str> {
    let start = system.find(heading)? + heading.len();
    let rest = &system[start..];
    let end = rest.find("\n\n").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn arithmetic(text: &str) -> Option<ToolCallRequest> {
    let cleaned = text.trim().trim_end_matches('?');
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let [a, op, b] = tokens.as_slice().get(tokens.len().checked_sub(3)?..)? else {
        return None;
    };
    let a: f64 = a.parse().ok()?;
    let b: f64 = b.parse().ok()?;
    let operation = match *op {
        "+" => "add",
        "-" => "subtract",
        "*" | "x" => "multiply",
        "/" => "divide",
        "^" => "power",
        "%" => "modulo",
        _ => return None,
    };
    Some(ToolCallRequest {
        id: None,
        name: "calculator".to_owned(),
        arguments: json!({ "operation": operation, "a": a, "b": b }),
    })
}

fn converse(request: &ChatRequest) -> ChatResponse {
    if let Some(last) = request.messages.last() {
        if last.role == ChatRole::Tool {
            return ChatResponse::text(format!("The tool says: {}", last.content));
        }
    }

    let user = last_with_role(&request.messages, ChatRole::User)
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    let has_tool = |name: &str| request.tools.iter().any(|tool| tool.name == name);

    if has_tool("calculator") {
        if let Some(call) = arithmetic(user) {
            return ChatResponse {
                content: String::new(),
                tool_calls: vec![call],
            };
        }
    }
    let lowered = user.to_lowercase();
    if has_tool("datetime") && (lowered.contains("time") || lowered.contains("date")) {
        return ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: None,
                name: "datetime".to_owned(),
                arguments: json!({}),
            }],
        };
    }

    let system = last_with_role(&request.messages, ChatRole::System)
        .map(|message| message.content.as_str())
        .unwrap_or_default();
    match section(system, FACTS_HEADING) {
        Some(facts) => ChatResponse::text(format!("You said: {user}\nI recall:\n{facts}")),
        None => ChatResponse::text(format!("You said: {user}")),
    }
}

#[async_trait]
impl ModelBackend for DemoBackend {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        match request.purpose {
            ChatPurpose::Converse => Ok(converse(&request)),
            ChatPurpose::Summarize => {
                let body = last_with_role(&request.messages, ChatRole::User)
                    .map(|message| message.content.clone())
                    .unwrap_or_default();
                let results = body.split_once("\n\n").map_or(body.as_str(), |(_, rest)| rest);
                Ok(ChatResponse::text(results.trim()))
            }
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream, BackendError> {
        let system = last_with_role(&request.messages, ChatRole::System)
            .map(|message| message.content.clone())
            .ok_or_else(|| BackendError::Stream("no system prompt".to_owned()))?;
        let answer = match section(&system, RESULTS_HEADING) {
            Some(results) => format!("Here is what I found: {results}"),
            None => "I have nothing to add.".to_owned(),
        };
        let words: Vec<String> = answer.split_inclusive(' ').map(str::to_owned).collect();
        let stream = async_stream::stream! {
            for word in words {
                yield Ok::<String, BackendError>(word);
            }
        };
        Ok(stream.boxed())
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::Embedding(
            "the demo backend has no embedding model".to_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use sage_protocol::ToolDefinition;

    use super::*;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_owned(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn arithmetic_becomes_a_calculator_call() {
        let call = arithmetic("what is 12 * 3?").unwrap();
        assert_eq!(call.arguments["operation"], "multiply");
        assert_eq!(call.arguments["b"], 3.0);
        assert!(arithmetic("hello there").is_none());
        assert!(arithmetic("5").is_none());
    }

    #[tokio::test]
    async fn tool_turn_is_answered_in_text() {
        let backend = DemoBackend::new();
        let request = ChatRequest::new(vec![
            ChatMessage::system("You are Sage."),
            ChatMessage::user("2 + 2"),
            ChatMessage::assistant(""),
            ChatMessage::tool("calculator", "c1", "4"),
        ])
        .with_tools(vec![tool("calculator")]);
        let response = backend.chat(request).await.unwrap();
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.content, "The tool says: 4");
    }

    #[tokio::test]
    async fn facts_are_echoed_when_present() {
        let backend = DemoBackend::new();
        let request = ChatRequest::new(vec![
            ChatMessage::system("You are Sage.\n\n## Relevant facts\n- cat is Miso"),
            ChatMessage::user("my cat?"),
        ]);
        let response = backend.chat(request).await.unwrap();
        assert!(response.content.contains("- cat is Miso"));
    }
}
