//! Configuration loading, validation, and management for OpsClaw.
//!
//! Loads configuration from `~/.opsclaw/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use opsclaw_core::provider::{ModelCapabilities, TokenLimitParam};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.opsclaw/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model backend
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature; omitted means the backend default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_temperature: Option<f32>,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Per-model capability overrides
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Ordered provider cascade; empty means the default provider alone
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Agent loop configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Operation catalog configuration
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Progress stream configuration
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Flow/audit logging configuration
    #[serde(default)]
    pub flow: FlowConfig,

    /// Reference library configuration
    #[serde(default)]
    pub references: ReferencesConfig,

    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("providers", &self.providers)
            .field("models", &self.models)
            .field("fallback", &self.fallback)
            .field("agent", &self.agent)
            .field("catalog", &self.catalog)
            .field("progress", &self.progress)
            .field("flow", &self.flow)
            .field("references", &self.references)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("api_version", &self.api_version)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// Wire dialect of a configured backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Openai,
    Azure,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL; for Azure this is the resource endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Azure `api-version` query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// Capability overrides for one model. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepts_temperature: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit_param: Option<TokenLimitParam>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepts_tools: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tools: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
}

impl ModelConfig {
    /// Apply these overrides on top of `base`.
    pub fn apply(&self, base: ModelCapabilities) -> ModelCapabilities {
        ModelCapabilities {
            accepts_temperature: self.accepts_temperature.unwrap_or(base.accepts_temperature),
            token_limit: self.token_limit_param.unwrap_or(base.token_limit),
            accepts_tools: self.accepts_tools.unwrap_or(base.accepts_tools),
            parallel_tools: self.parallel_tools.unwrap_or(base.parallel_tools),
        }
    }
}

/// Providers tried in order until one answers.
///
/// ```toml
/// [fallback]
/// timeout_secs = 60
///
/// [[fallback.chain]]
/// provider = "azure"
///
/// [[fallback.chain]]
/// provider = "openai"
/// model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<FallbackEntryConfig>,

    /// Per-attempt timeout for entries that set none
    #[serde(default = "default_fallback_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fallback_timeout_secs() -> u64 {
    120
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            timeout_secs: default_fallback_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntryConfig {
    /// Name of a `[providers.*]` entry (or the default provider)
    pub provider: String,

    /// Model to request from this provider instead of the request's own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard bound on provider calls per request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Token budget for replayed history
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,

    /// Most recent turns that are always kept
    #[serde(default = "default_preserve_last_turns")]
    pub preserve_last_turns: usize,

    /// Bundle used when a request names none
    #[serde(default = "default_bundle")]
    pub default_bundle: String,

    /// Override the base instruction block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_prompt: Option<String>,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_history_token_budget() -> usize {
    8000
}
fn default_preserve_last_turns() -> usize {
    4
}
fn default_bundle() -> String {
    "profile.default_it_assistant".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: None,
            history_token_budget: default_history_token_budget(),
            preserve_last_turns: default_preserve_last_turns(),
            default_bundle: default_bundle(),
            base_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Pending confirmations older than this are discarded; unset = never
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Consumer wait before yielding a keep-alive marker
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,

    /// Longest the producer waits on a full channel per event
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_channel_capacity() -> usize {
    64
}
fn default_keepalive_ms() -> u64 {
    500
}
fn default_send_timeout_ms() -> u64 {
    1000
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            keepalive_ms: default_keepalive_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,

    #[serde(default = "default_max_list_items")]
    pub max_list_items: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Logic version created on first use when none is active
    #[serde(default = "default_logic_version")]
    pub logic_version: String,

    #[serde(default = "default_logic_name")]
    pub logic_name: String,

    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,

    #[serde(default = "default_features")]
    pub features: Vec<String>,
}

fn default_max_string_len() -> usize {
    1000
}
fn default_max_list_items() -> usize {
    20
}
fn default_max_depth() -> usize {
    5
}
fn default_logic_version() -> String {
    "v1.0.0".into()
}
fn default_logic_name() -> String {
    "Initial AI Logic".into()
}
fn default_prompt_version() -> String {
    "v1.0".into()
}
fn default_features() -> Vec<String> {
    vec![
        "agentic_loop".into(),
        "tool_calling".into(),
        "reference_snippets".into(),
        "streaming_progress".into(),
    ]
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_string_len: default_max_string_len(),
            max_list_items: default_max_list_items(),
            max_depth: default_max_depth(),
            logic_version: default_logic_version(),
            logic_name: default_logic_name(),
            prompt_version: default_prompt_version(),
            features: default_features(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferencesConfig {
    /// TOML file with `[[fragments]]` and `[[bundles]]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database path for file-backed stores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_store_backend() -> String {
    "memory".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Also checks environment variables for API keys:
    /// - `OPSCLAW_API_KEY` (highest priority)
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides (highest priority).
    pub fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("OPSCLAW_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("OPSCLAW_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("OPSCLAW_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".opsclaw")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.default_temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ConfigError::ValidationError(
                    "default_temperature must be between 0.0 and 2.0".into(),
                ));
            }
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.progress.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "progress.channel_capacity must be at least 1".into(),
            ));
        }

        if self.fallback.timeout_secs == 0
            || self.fallback.chain.iter().any(|e| e.timeout_secs == Some(0))
        {
            return Err(ConfigError::ValidationError(
                "fallback timeouts must be at least 1 second".into(),
            ));
        }

        if self.fallback.chain.iter().any(|e| e.provider.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "fallback.chain entries need a provider name".into(),
            ));
        }

        if !matches!(self.store.backend.as_str(), "memory" | "sqlite") {
            return Err(ConfigError::ValidationError(format!(
                "store.backend must be \"memory\" or \"sqlite\", got \"{}\"",
                self.store.backend
            )));
        }

        Ok(())
    }

    /// Whether any backend has credentials (config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: None,
            providers: HashMap::new(),
            models: HashMap::new(),
            fallback: FallbackConfig::default(),
            agent: AgentConfig::default(),
            catalog: CatalogConfig::default(),
            progress: ProgressConfig::default(),
            flow: FlowConfig::default(),
            references: ReferencesConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
