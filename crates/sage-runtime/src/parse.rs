//! Tool-call extraction from model replies.

use sage_protocol::{ChatResponse, ToolCallRequest};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const FENCE: &str = "```";

#[derive(Deserialize)]
struct FencedCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Bodies of every fenced code block in `text`. The language tag line, if
/// any, is dropped. An unclosed fence ends the scan.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find(FENCE) {
        let after_open = &rest[open + FENCE.len()..];
        let Some(close) = after_open.find(FENCE) else {
            break;
        };
        let block = &after_open[..close];
        let body = match block.find('\n') {
            Some(newline) if !block[..newline].trim_start().starts_with('{') => &block[newline + 1..],
            _ => block,
        };
        blocks.push(body.trim());
        rest = &after_open[close + FENCE.len()..];
    }
    blocks
}

/// Tool calls written as fenced JSON blocks. Blocks that are not a
/// `{"name": ..., "arguments": {...}}` object are skipped.
pub fn parse_fenced_tool_calls(text: &str) -> Vec<ToolCallRequest> {
    fenced_blocks(text)
        .into_iter()
        .filter_map(|body| match serde_json::from_str::<FencedCall>(body) {
            Ok(call) if !call.name.trim().is_empty() => Some(ToolCallRequest {
                id: None,
                name: call.name,
                arguments: if call.arguments.is_null() {
                    Value::Object(Default::default())
                } else {
                    call.arguments
                },
            }),
            Ok(_) => None,
            Err(error) => {
                debug!(%error, "skipping fenced block that is not a tool call");
                None
            }
        })
        .collect()
}

/// Structured calls win; fenced blocks are the fallback.
pub fn tool_requests(response: &ChatResponse) -> Vec<ToolCallRequest> {
    if response.tool_calls.is_empty() {
        parse_fenced_tool_calls(&response.content)
    } else {
        response.tool_calls.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_multiple_blocks_and_skips_malformed() {
        let reply = "Let me check.\n```json\n{\"name\": \"calculator\", \"arguments\": {\"operation\": \"add\", \"a\": 2, \"b\": 3}}\n```\nand\n```json\n{not json}\n```\n```\n{\"name\": \"datetime\"}\n```";
        let calls = parse_fenced_tool_calls(reply);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "calculator");
        assert_eq!(calls[0].arguments["b"], 3);
        assert_eq!(calls[1].name, "datetime");
        assert_eq!(calls[1].arguments, json!({}));
    }

    #[test]
    fn plain_text_has_no_calls() {
        assert!(parse_fenced_tool_calls("Just an answer.").is_empty());
        assert!(parse_fenced_tool_calls("```rust\nfn main() {}\n```").is_empty());
        assert!(parse_fenced_tool_calls("```json\n{\"name\": \"x\"").is_empty());
    }

    #[test]
    fn structured_calls_take_precedence() {
        let response = ChatResponse {
            content: "```json\n{\"name\": \"fenced\", \"arguments\": {}}\n```".to_owned(),
            tool_calls: vec![ToolCallRequest {
                id: Some("call-1".to_owned()),
                name: "structured".to_owned(),
                arguments: json!({}),
            }],
        };
        let calls = tool_requests(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "structured");
    }
}
