//! `opsclaw config`: Configuration management commands.

use anyhow::Context;
use clap::Subcommand;
use opsclaw_config::AppConfig;
use std::path::{Path, PathBuf};

const REDACTED: &str = "***";

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the effective configuration (secrets redacted)
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file path
    Path,
    /// Check the configuration and report problems
    Validate,
}

pub fn run(config_path: Option<&Path>, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => show(config_path),
        ConfigCommand::Init { force } => {
            let path = target_path(config_path);
            init(&path, force)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", target_path(config_path).display());
            Ok(())
        }
        ConfigCommand::Validate => validate(config_path),
    }
}

fn target_path(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

fn show(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = redacted(super::load_config(config_path)?);
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Copy of `config` with every API key replaced.
pub fn redacted(mut config: AppConfig) -> AppConfig {
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    config
}

/// Write the default config to `path`. Refuses to overwrite unless `force`.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml()).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn validate(config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Validating configuration...");
    let config = match super::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e:#}");
            return Err(e);
        }
    };
    println!("   Config parsed successfully");

    let mut warnings = Vec::new();
    if !config.has_api_key() {
        warnings.push("No API key set; the offline mock backend will answer".to_string());
    }
    if config.store.backend == "memory" {
        warnings.push("In-memory store: conversations and audit records are lost on exit".to_string());
    }
    if config.references.path.as_deref().is_some_and(|p| !Path::new(p).exists()) {
        warnings.push("references.path does not exist".to_string());
    }

    if warnings.is_empty() {
        println!("   All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   warning: {w}");
        }
    }

    println!();
    println!("   Provider:  {}", config.default_provider);
    println!("   Model:     {}", config.default_model);
    println!("   Store:     {}", config.store.backend);
    println!("   Gateway:   {}:{}", config.gateway.host, config.gateway.port);
    println!("   Max steps: {}", config.agent.max_iterations);
    Ok(())
}
