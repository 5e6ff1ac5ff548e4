//! Provider router: selects the model backend based on config.
//!
//! Handles provider creation and routing requests to the right backend.

use crate::capabilities::ModelRegistry;
use crate::fallback::{CASCADE_PROVIDER, FallbackProvider};
use crate::mock::MockProvider;
use crate::openai_compat::OpenAiCompatProvider;
use opsclaw_config::{AppConfig, ProviderKind};
use opsclaw_core::provider::Provider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name the offline fallback registers under.
pub const NULL_PROVIDER: &str = "null";

/// Routes model requests to the correct provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Build providers from configuration.
///
/// Backends without an API key are skipped. When the default backend ends
/// up missing, the offline mock is registered under [`NULL_PROVIDER`] and
/// becomes the default. A non-empty `[fallback]` chain is registered under
/// [`CASCADE_PROVIDER`] and replaces the default.
pub fn build_from_config(config: &AppConfig) -> ProviderRouter {
    let registry = ModelRegistry::new().with_overrides(config.models.clone());
    let mut router = ProviderRouter::new(&config.default_provider);

    for (name, provider_config) in &config.providers {
        let Some(api_key) = provider_config
            .api_key
            .clone()
            .or_else(|| config.api_key.clone())
            .filter(|k| !k.is_empty())
        else {
            warn!(provider = %name, "No API key configured, skipping provider");
            continue;
        };

        let provider: Arc<dyn Provider> = match provider_config.kind {
            ProviderKind::Azure => {
                let Some(endpoint) = provider_config.api_url.clone() else {
                    warn!(provider = %name, "Azure provider needs api_url, skipping");
                    continue;
                };
                Arc::new(
                    OpenAiCompatProvider::azure(name, endpoint, api_key, provider_config.api_version.clone())
                        .with_registry(registry.clone()),
                )
            }
            ProviderKind::Openai => {
                let base_url = provider_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| default_base_url(name));
                Arc::new(OpenAiCompatProvider::new(name, base_url, api_key).with_registry(registry.clone()))
            }
        };

        router.register(name.clone(), provider);
    }

    // Ensure the default provider exists (even if not explicitly configured)
    if router.get(&config.default_provider).is_none() {
        match config.api_key.clone().filter(|k| !k.is_empty()) {
            Some(api_key) if config.default_provider != NULL_PROVIDER => {
                let base_url = default_base_url(&config.default_provider);
                router.register(
                    config.default_provider.clone(),
                    Arc::new(
                        OpenAiCompatProvider::new(&config.default_provider, base_url, api_key)
                            .with_registry(registry.clone()),
                    ),
                );
            }
            _ => {
                info!("No model credentials configured, using the offline mock provider");
                router.register(NULL_PROVIDER, Arc::new(MockProvider::new().with_name(NULL_PROVIDER)));
                router.default_provider = NULL_PROVIDER.to_string();
            }
        }
    }

    if !config.fallback.chain.is_empty() {
        let mut cascade = FallbackProvider::new(CASCADE_PROVIDER);
        for entry in &config.fallback.chain {
            let Some(provider) = router.get(&entry.provider) else {
                warn!(provider = %entry.provider, "Fallback entry names an unavailable provider, skipping");
                continue;
            };
            let timeout = Duration::from_secs(entry.timeout_secs.unwrap_or(config.fallback.timeout_secs));
            cascade = cascade.add_entry(provider, entry.model.clone(), timeout);
        }

        if cascade.is_empty() {
            warn!("No fallback entry is available, keeping the default provider");
        } else {
            info!(entries = cascade.len(), "Provider cascade enabled");
            router.register(CASCADE_PROVIDER, Arc::new(cascade));
            router.default_provider = CASCADE_PROVIDER.to_string();
        }
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => "https://api.openai.com/v1".into(),
    }
}
