//! Provider trait: the abstraction over model backends.
//!
//! A Provider sends a transcript (plus the operations the model may call)
//! to a model and returns one completion. Backends differ in which request
//! parameters each model accepts; every backend declares those differences
//! as [`ModelCapabilities`] and [`ModelCapabilities::negotiate`] reshapes a
//! request before it goes on the wire, so callers code to one contract.
//!
//! Implementations: OpenAI-compatible, Azure OpenAI, null/mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// A completion request in backend-neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o", "o3-mini")
    pub model: String,

    /// The transcript, oldest first
    pub messages: Vec<Message>,

    /// Sampling temperature; `None` leaves the backend default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Operations the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// An operation signature sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The operation name
    pub name: String,

    /// Description of what the operation does
    pub description: String,

    /// JSON Schema describing the operation's parameters
    pub parameters: serde_json::Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

impl FinishReason {
    /// Map a wire-level finish reason string.
    pub fn from_api(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | None => Self::Stop,
            Some("tool_calls") | Some("function_call") => Self::ToolCalls,
            Some("length") => Self::Length,
            Some("content_filter") => Self::ContentFilter,
            Some(_) => Self::Other,
        }
    }
}

/// A complete response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Generated text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls requested by the model, in the order it returned them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Token usage statistics
    #[serde(default)]
    pub usage: Usage,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    pub finish_reason: FinishReason,
}

impl ProviderResponse {
    /// A text-only response.
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            model: model.into(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Convert into the assistant turn that records this response.
    pub fn to_message(&self) -> Message {
        let content = self.content.clone().unwrap_or_default();
        let msg = if self.tool_calls.is_empty() {
            Message::assistant(content)
        } else {
            Message::assistant_tool_calls(content, self.tool_calls.clone())
        };
        msg.with_tokens(self.usage.completion_tokens)
            .with_metadata("model", serde_json::Value::String(self.model.clone()))
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Add another usage sample into this running total.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Which request field carries the generation limit for a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitParam {
    #[default]
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenLimitParam {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::MaxCompletionTokens => "max_completion_tokens",
        }
    }
}

/// What a given model accepts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub accepts_temperature: bool,
    pub token_limit: TokenLimitParam,
    pub accepts_tools: bool,
    pub parallel_tools: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            accepts_temperature: true,
            token_limit: TokenLimitParam::MaxTokens,
            accepts_tools: true,
            parallel_tools: true,
        }
    }
}

/// A request reshaped for one model.
#[derive(Debug, Clone)]
pub struct NegotiatedRequest {
    pub request: ProviderRequest,
    /// Field name to use for `request.max_tokens`
    pub token_limit_field: &'static str,
    /// Parameters removed because the model rejects them
    pub dropped: Vec<&'static str>,
    /// `parallel_tool_calls` flag; only set when tools survive negotiation
    pub parallel_tool_calls: Option<bool>,
}

impl ModelCapabilities {
    /// Strip or rename parameters the model does not accept.
    pub fn negotiate(&self, mut request: ProviderRequest) -> NegotiatedRequest {
        let mut dropped = Vec::new();

        if !self.accepts_temperature && request.temperature.take().is_some() {
            dropped.push("temperature");
        }

        if !self.accepts_tools && !request.tools.is_empty() {
            tracing::warn!(
                model = %request.model,
                tools = request.tools.len(),
                "Model does not support tool calling, dropping tool definitions"
            );
            request.tools.clear();
            dropped.push("tools");
        }

        let parallel_tool_calls = (!request.tools.is_empty()).then_some(self.parallel_tools);

        NegotiatedRequest {
            request,
            token_limit_field: self.token_limit.field_name(),
            dropped,
            parallel_tool_calls,
        }
    }
}

/// The core Provider trait.
///
/// Every model backend implements this trait. The agent loop calls
/// `complete()` without knowing which backend is in use. Errors are hard
/// failures: there is no internal retry, callers that want backoff wrap
/// the provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai", "null").
    fn name(&self) -> &str;

    /// Capabilities of `model` on this backend.
    fn capabilities(&self, _model: &str) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_everything() -> ProviderRequest {
        ProviderRequest::new("o1-preview", vec![Message::user("hi")])
            .with_temperature(Some(0.2))
            .with_max_tokens(Some(512))
            .with_tools(vec![ToolDefinition {
                name: "ping".into(),
                description: "Health check".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }])
    }

    #[test]
    fn permissive_capabilities_keep_request_intact() {
        let negotiated = ModelCapabilities::default().negotiate(request_with_everything());
        assert_eq!(negotiated.request.temperature, Some(0.2));
        assert_eq!(negotiated.request.tools.len(), 1);
        assert_eq!(negotiated.token_limit_field, "max_tokens");
        assert!(negotiated.dropped.is_empty());
        assert_eq!(negotiated.parallel_tool_calls, Some(true));
    }

    #[test]
    fn parallel_flag_absent_without_tools() {
        let request = ProviderRequest::new("gpt-4o", vec![Message::user("hi")]);
        let negotiated = ModelCapabilities::default().negotiate(request);
        assert_eq!(negotiated.parallel_tool_calls, None);
    }

    #[test]
    fn restrictive_capabilities_strip_parameters() {
        let caps = ModelCapabilities {
            accepts_temperature: false,
            token_limit: TokenLimitParam::MaxCompletionTokens,
            accepts_tools: false,
            parallel_tools: false,
        };
        let negotiated = caps.negotiate(request_with_everything());
        assert_eq!(negotiated.request.temperature, None);
        assert!(negotiated.request.tools.is_empty());
        assert_eq!(negotiated.request.max_tokens, Some(512));
        assert_eq!(negotiated.token_limit_field, "max_completion_tokens");
        assert_eq!(negotiated.dropped, vec!["temperature", "tools"]);
        assert_eq!(negotiated.parallel_tool_calls, None);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_api(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_api(None), FinishReason::Stop);
        assert_eq!(FinishReason::from_api(Some("weird")), FinishReason::Other);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = Usage::default();
        total.accumulate(&Usage::new(10, 5));
        total.accumulate(&Usage::new(3, 2));
        assert_eq!(total, Usage { prompt_tokens: 13, completion_tokens: 7, total_tokens: 20 });
    }

    #[test]
    fn response_to_message_carries_tool_calls() {
        let resp = ProviderResponse {
            content: None,
            tool_calls: vec![MessageToolCall { id: "c1".into(), name: "ping".into(), arguments: "{}".into() }],
            usage: Usage::new(4, 6),
            model: "mock".into(),
            finish_reason: FinishReason::ToolCalls,
        };
        let msg = resp.to_message();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tokens, 6);
        assert_eq!(msg.content, "");
    }
}
