//! Per-model capability registry.
//!
//! Lookup order: config override on top of a built-in entry, then a
//! built-in entry alone, then the prefix heuristic for unknown models.

use opsclaw_config::ModelConfig;
use opsclaw_core::provider::{ModelCapabilities, TokenLimitParam};
use std::collections::HashMap;

/// Models that take `max_completion_tokens` and a fixed temperature.
const RESTRICTED_PREFIXES: &[&str] = &["gpt-5", "gpt-4.1", "o1", "o3", "o4"];

const fn caps(
    accepts_temperature: bool,
    token_limit: TokenLimitParam,
    accepts_tools: bool,
    parallel_tools: bool,
) -> ModelCapabilities {
    ModelCapabilities {
        accepts_temperature,
        token_limit,
        accepts_tools,
        parallel_tools,
    }
}

const REASONING: ModelCapabilities = caps(false, TokenLimitParam::MaxCompletionTokens, true, true);
const REASONING_NO_TOOLS: ModelCapabilities =
    caps(false, TokenLimitParam::MaxCompletionTokens, false, false);
const CLASSIC: ModelCapabilities = caps(true, TokenLimitParam::MaxTokens, true, true);

/// Known model families with measured behaviour.
const BUILTIN: &[(&str, ModelCapabilities)] = &[
    ("gpt-5", REASONING),
    ("gpt-5-mini", REASONING),
    ("gpt-5-nano", REASONING),
    ("gpt-5-pro", REASONING),
    ("gpt-4.1", CLASSIC),
    ("gpt-4.1-mini", CLASSIC),
    ("gpt-4.1-nano", CLASSIC),
    ("gpt-4o", CLASSIC),
    ("gpt-4o-mini", CLASSIC),
    ("o4-mini", REASONING),
    ("o3-mini", REASONING),
    ("o3", REASONING),
    ("o1", REASONING_NO_TOOLS),
    ("o1-mini", REASONING_NO_TOOLS),
];

/// Capabilities for a model nobody registered.
pub fn heuristic(model: &str) -> ModelCapabilities {
    let restricted = RESTRICTED_PREFIXES.iter().any(|p| model.starts_with(p));
    ModelCapabilities {
        accepts_temperature: !restricted,
        token_limit: if restricted {
            TokenLimitParam::MaxCompletionTokens
        } else {
            TokenLimitParam::MaxTokens
        },
        accepts_tools: !model.starts_with("o1"),
        parallel_tools: !model.starts_with("o1"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    entries: HashMap<String, ModelCapabilities>,
    overrides: HashMap<String, ModelConfig>,
}

impl ModelRegistry {
    /// Registry preloaded with the built-in table.
    pub fn new() -> Self {
        Self {
            entries: BUILTIN
                .iter()
                .map(|(name, caps)| (name.to_string(), *caps))
                .collect(),
            overrides: HashMap::new(),
        }
    }

    /// Registry with `[models.*]` overrides from configuration.
    pub fn with_overrides(mut self, overrides: HashMap<String, ModelConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn lookup(&self, model: &str) -> ModelCapabilities {
        let base = self
            .entries
            .get(model)
            .copied()
            .unwrap_or_else(|| heuristic(model));
        match self.overrides.get(model) {
            Some(cfg) => cfg.apply(base),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_entry_beats_heuristic() {
        let registry = ModelRegistry::new();
        // gpt-4.1 matches a restricted prefix but is known to accept temperature
        assert!(registry.lookup("gpt-4.1").accepts_temperature);
        assert!(!heuristic("gpt-4.1").accepts_temperature);
    }

    #[test]
    fn unknown_reasoning_models_use_heuristic() {
        let registry = ModelRegistry::new();
        let caps = registry.lookup("o3-deep-research");
        assert!(!caps.accepts_temperature);
        assert_eq!(caps.token_limit, TokenLimitParam::MaxCompletionTokens);
        assert!(caps.accepts_tools);

        let o1 = registry.lookup("o1-preview");
        assert!(!o1.accepts_tools);
    }

    #[test]
    fn unknown_classic_model_is_permissive() {
        let caps = ModelRegistry::new().lookup("llama3.1:8b");
        assert_eq!(caps, ModelCapabilities::default());
    }

    #[test]
    fn config_override_applies_on_top() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "gpt-4o".to_string(),
            ModelConfig {
                accepts_tools: Some(false),
                ..Default::default()
            },
        );
        let registry = ModelRegistry::new().with_overrides(overrides);
        let caps = registry.lookup("gpt-4o");
        assert!(!caps.accepts_tools);
        assert!(caps.accepts_temperature);
    }

    #[test]
    fn o1_heuristic_only_matches_the_prefix() {
        let caps = heuristic("acme-o1-tuned");
        assert!(caps.accepts_tools);
        assert!(caps.parallel_tools);
        assert!(!heuristic("o1-2024-12-17").accepts_tools);
    }
}
