//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Good enough
//! for budgeting replayed history; real counts come back from the provider.

use opsclaw_core::message::Message;
use opsclaw_core::provider::ToolDefinition;

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single turn including its tool-call payload.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| estimate_tokens(&c.name) + estimate_tokens(&c.arguments))
        .sum();
    estimate_tokens(&message.content) + calls
}

/// Estimate tokens for a slice of turns.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a slice of tool definitions (serialized as JSON).
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools
        .iter()
        .map(|t| estimate_tokens(&serde_json::to_string(t).unwrap_or_default()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsclaw_core::message::MessageToolCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn tool_calls_count_toward_the_turn() {
        let plain = Message::assistant("");
        let with_call = Message::assistant_tool_calls(
            "",
            vec![MessageToolCall {
                id: "c1".into(),
                name: "ping".into(),
                arguments: "{}".into(),
            }],
        );
        assert_eq!(estimate_message_tokens(&plain), 0);
        assert_eq!(estimate_message_tokens(&with_call), 2);
    }

    #[test]
    fn multiple_messages() {
        let msgs = vec![Message::user("hello"), Message::assistant("world")];
        assert_eq!(estimate_messages_tokens(&msgs), 4);
    }

    #[test]
    fn tool_definitions_cost_something() {
        let tool = ToolDefinition {
            name: "ping".into(),
            description: "Check liveness".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        assert!(estimate_tools_tokens(&[tool]) > 0);
        assert_eq!(estimate_tools_tokens(&[]), 0);
    }
}
