//! Audit records: logic versions and flow steps.
//!
//! A logic version is a named, hashed snapshot of agent-loop configuration;
//! exactly one is active at a time and every request is tagged with it.
//! Flow steps are the per-request trail of what the orchestrator did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of processing step being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    FlowStart,
    ConversationLoad,
    ContextBuild,
    ReferenceFetch,
    HistoryLoad,
    ContextTruncate,
    LlmCall,
    LlmResponse,
    ToolDecision,
    ToolExecute,
    ToolResult,
    IterationStart,
    IterationEnd,
    MessageSave,
    FlowEnd,
    FlowError,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowStart => "flow_start",
            Self::ConversationLoad => "conversation_load",
            Self::ContextBuild => "context_build",
            Self::ReferenceFetch => "reference_fetch",
            Self::HistoryLoad => "history_load",
            Self::ContextTruncate => "context_truncate",
            Self::LlmCall => "llm_call",
            Self::LlmResponse => "llm_response",
            Self::ToolDecision => "tool_decision",
            Self::ToolExecute => "tool_execute",
            Self::ToolResult => "tool_result",
            Self::IterationStart => "iteration_start",
            Self::IterationEnd => "iteration_end",
            Self::MessageSave => "message_save",
            Self::FlowEnd => "flow_end",
            Self::FlowError => "flow_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "flow_start" => Self::FlowStart,
            "conversation_load" => Self::ConversationLoad,
            "context_build" => Self::ContextBuild,
            "reference_fetch" => Self::ReferenceFetch,
            "history_load" => Self::HistoryLoad,
            "context_truncate" => Self::ContextTruncate,
            "llm_call" => Self::LlmCall,
            "llm_response" => Self::LlmResponse,
            "tool_decision" => Self::ToolDecision,
            "tool_execute" => Self::ToolExecute,
            "tool_result" => Self::ToolResult,
            "iteration_start" => Self::IterationStart,
            "iteration_end" => Self::IterationEnd,
            "message_save" => Self::MessageSave,
            "flow_end" => Self::FlowEnd,
            "flow_error" => Self::FlowError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The configuration a logic version pins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicConfig {
    pub max_iterations: u32,

    #[serde(default)]
    pub temperature: Option<f32>,

    pub prompt_version: String,

    #[serde(default)]
    pub features: Vec<String>,
}

/// A versioned, hashed snapshot of agent-loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicVersion {
    /// Version label, e.g. `v1.0.0`
    pub version: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub config: LogicConfig,

    /// Short content hash of `config`
    pub config_hash: String,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// One timed, typed step of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStepRecord {
    pub id: String,

    /// The request this step belongs to
    pub request_id: String,

    pub conversation_id: String,

    /// Logic version active when the request started
    pub logic_version: String,

    /// Position within the request, starting at 1
    pub step_order: u32,

    pub step_type: StepType,

    pub step_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}
