//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, Azure OpenAI, and any endpoint exposing the
//! `/chat/completions` dialect (Ollama, vLLM, OpenRouter, ...).
//!
//! Before a request goes on the wire it is reshaped for the target model
//! (see [`ModelRegistry`]): temperature is dropped for reasoning models,
//! the generation limit is sent under the field name the model expects,
//! and tool definitions are withheld from models that cannot call them.

use crate::capabilities::ModelRegistry;
use async_trait::async_trait;
use opsclaw_core::error::ProviderError;
use opsclaw_core::message::{Message, MessageToolCall, Role};
use opsclaw_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// How requests are addressed and authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    /// `{base}/chat/completions` with a bearer token
    OpenAi,
    /// `{endpoint}/openai/deployments/{model}/chat/completions?api-version=..`
    /// with an `api-key` header
    Azure { api_version: String },
}

/// An OpenAI-compatible model backend.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    dialect: Dialect,
    registry: ModelRegistry,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            dialect: Dialect::OpenAi,
            registry: ModelRegistry::new(),
            client,
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Azure OpenAI provider. `endpoint` is the resource URL,
    /// e.g. `https://my-resource.openai.azure.com`.
    pub fn azure(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        api_version: Option<String>,
    ) -> Self {
        let mut provider = Self::new(name, endpoint, api_key);
        provider.dialect = Dialect::Azure {
            api_version: api_version.unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
        };
        provider
    }

    /// Replace the capability registry (for config overrides).
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn completions_url(&self, model: &str) -> String {
        match &self.dialect {
            Dialect::OpenAi => format!("{}/chat/completions", self.base_url),
            Dialect::Azure { api_version } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, model, api_version
            ),
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.dialect {
            Dialect::OpenAi => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            Dialect::Azure { .. } => builder.header("api-key", &self.api_key),
        }
    }

    /// Render the JSON body for a negotiated request.
    fn build_body(negotiated: &NegotiatedRequest) -> serde_json::Value {
        let request = &negotiated.request;
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": false,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            body[negotiated.token_limit_field] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        if let Some(parallel) = negotiated.parallel_tool_calls {
            body["parallel_tool_calls"] = serde_json::json!(parallel);
        }

        body
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: if m.role == Role::Assistant && m.content.is_empty() && !m.tool_calls.is_empty() {
                    None
                } else {
                    Some(m.content.clone())
                },
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn parse_response(api_response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let tool_calls: Vec<MessageToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let usage = api_response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(ProviderResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            usage,
            model: api_response.model,
            finish_reason: FinishReason::from_api(choice.finish_reason.as_deref()),
        })
    }
}

fn network_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self, model: &str) -> ModelCapabilities {
        self.registry.lookup(model)
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let url = self.completions_url(&request.model);
        let negotiated = self.capabilities(&request.model).negotiate(request);
        if !negotiated.dropped.is_empty() {
            debug!(
                provider = %self.name,
                model = %negotiated.request.model,
                dropped = ?negotiated.dropped,
                "Dropped unsupported request parameters"
            );
        }
        let body = Self::build_body(&negotiated);

        debug!(provider = %self.name, model = %negotiated.request.model, "Sending completion request");

        let response = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status == 404 {
            return Err(ProviderError::ModelNotFound(negotiated.request.model));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        Self::parse_response(api_response)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        if matches!(self.dialect, Dialect::Azure { .. }) {
            // Azure exposes no cheap unauthenticated listing per deployment
            return Ok(!self.api_key.is_empty());
        }
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(network_error)?;

        Ok(response.status().is_success())
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
