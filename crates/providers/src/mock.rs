//! Offline provider for development and tests.
//!
//! Replies with scripted responses in order, then falls back to a fixed
//! text reply forever. Every request is kept for inspection. Never touches
//! the network.

use async_trait::async_trait;
use opsclaw_core::error::ProviderError;
use opsclaw_core::message::{Message, MessageToolCall};
use opsclaw_core::provider::{FinishReason, Provider, ProviderRequest, ProviderResponse, Usage};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_MOCK_REPLY: &str = "I'm a mock assistant. How can I help?";

fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

/// A provider with a queue of canned replies.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    history: Mutex<Vec<ProviderRequest>>,
    default_reply: String,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".into(),
            script: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            default_reply: DEFAULT_MOCK_REPLY.into(),
        }
    }

    /// Mock that replies with `responses` in order.
    pub fn scripted(responses: Vec<ProviderResponse>) -> Self {
        let mock = Self::new();
        for response in responses {
            mock.push(response);
        }
        mock
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Queue a response.
    pub fn push(&self, response: ProviderResponse) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(response));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: ProviderError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    /// Every request received so far, oldest first.
    pub fn call_history(&self) -> Vec<ProviderRequest> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// A text reply as the mock would produce it.
    pub fn text(content: impl Into<String>) -> ProviderResponse {
        let content = content.into();
        ProviderResponse {
            usage: Usage::new(0, estimate_tokens(&content)),
            content: Some(content),
            tool_calls: Vec::new(),
            model: "mock".into(),
            finish_reason: FinishReason::Stop,
        }
    }

    /// A reply requesting one tool call.
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> ProviderResponse {
        Self::tool_calls(vec![MessageToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.to_string(),
        }])
    }

    /// A reply requesting several tool calls in one turn.
    pub fn tool_calls(calls: Vec<MessageToolCall>) -> ProviderResponse {
        let completion = calls
            .iter()
            .map(|c| estimate_tokens(&c.arguments) + estimate_tokens(&c.name))
            .sum();
        ProviderResponse {
            content: None,
            tool_calls: calls,
            usage: Usage::new(0, completion),
            model: "mock".into(),
            finish_reason: FinishReason::ToolCalls,
        }
    }
}

fn prompt_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let prompt = prompt_tokens(&request.messages);
        let model = request.model.clone();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let mut response = match next {
            Some(scripted) => scripted?,
            None => Self::text(self.default_reply.clone()),
        };
        response.usage = Usage::new(prompt, response.usage.completion_tokens);
        if response.model == "mock" && !model.is_empty() {
            response.model = model;
        }
        Ok(response)
    }
}
