pub mod chat;
pub mod config_cmd;
pub mod logic;
pub mod operations;
pub mod serve;

use anyhow::Context;
use opsclaw_config::AppConfig;
use std::path::Path;

/// Load config from `path`, or from the default location when absent.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::debug!(path = %path.display(), "Loaded configuration");
            Ok(config)
        }
        None => AppConfig::load().context("Failed to load config"),
    }
}
