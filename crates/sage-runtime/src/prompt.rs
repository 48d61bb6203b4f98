//! Prompt assembly.

use std::fmt::Write as _;

use sage_protocol::{ChatMessage, KnowledgeFact, MemoryEntry, Role, ToolDefinition};

const TOOL_CALL_HINT: &str = "To use a tool, reply with a fenced ```json block containing \
     {\"name\": <tool name>, \"arguments\": {...}}. Use one block per call.";

/// System prompt: style prompt, then known facts, then the tool catalog.
pub fn system_prompt(style_prompt: &str, facts: &[KnowledgeFact], tools: &[ToolDefinition]) -> String {
    let mut prompt = style_prompt.trim().to_owned();

    if !facts.is_empty() {
        prompt.push_str("\n\n## Relevant facts\n");
        for fact in facts {
            let _ = writeln!(prompt, "- {}", fact.text);
        }
    }

    if !tools.is_empty() {
        prompt.push_str("\n\n## Available tools\n");
        for tool in tools {
            let _ = writeln!(
                prompt,
                "- {}: {} (parameters: {})",
                tool.name, tool.description, tool.parameters
            );
        }
        prompt.push('\n');
        prompt.push_str(TOOL_CALL_HINT);
    }

    prompt.trim_end().to_owned()
}

pub fn history_message(entry: &MemoryEntry) -> ChatMessage {
    match entry.role {
        Role::User => ChatMessage::user(entry.content.clone()),
        Role::Assistant => ChatMessage::assistant(entry.content.clone()),
        Role::System => ChatMessage::system(entry.content.clone()),
    }
}

/// System prompt, prior turns oldest first, then the new user turn.
pub fn build_messages(
    system: String,
    history: &[MemoryEntry],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history.iter().map(history_message));
    messages.push(ChatMessage::user(user_text));
    messages
}

/// Base system prompt with a tool-results summary appended.
pub fn fold_summary(system: &str, summary: &str) -> String {
    format!("{system}\n\n## Tool results\n{}", summary.trim())
}
