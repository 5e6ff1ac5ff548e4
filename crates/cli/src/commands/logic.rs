//! `opsclaw logic`: Logic version management.
//!
//! Versions live in the configured store, so these commands are only
//! useful with a persistent backend.

use clap::Subcommand;
use opsclaw_agent::{AssistantSettings, LogicVersions};
use opsclaw_core::LogicVersion;
use std::path::Path;

#[derive(Subcommand, Debug, Clone)]
pub enum LogicCommand {
    /// List all logic versions
    List,
    /// Register a new version from the current agent settings
    Create {
        version: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Make it the active version
        #[arg(long)]
        activate: bool,
    },
    /// Make a version the active one
    Activate { version: String },
    /// Retire a version
    Deprecate { version: String },
    /// Request, step, error, and token totals for a version
    Stats { version: String },
}

pub async fn run(config_path: Option<&Path>, command: LogicCommand) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let store = opsclaw_store::build_from_config(&config).await?;
    let versions = LogicVersions::new(store);

    match command {
        LogicCommand::List => {
            let all = versions.list().await?;
            if all.is_empty() {
                println!("No logic versions recorded.");
            }
            for version in &all {
                println!("{}", describe(version));
            }
        }
        LogicCommand::Create {
            version,
            name,
            description,
            activate,
        } => {
            let logic = AssistantSettings::from_config(&config).logic_config();
            let created = versions.create(&version, &name, description, logic, activate).await?;
            println!("Created {}", describe(&created));
        }
        LogicCommand::Activate { version } => {
            let active = versions.activate(&version).await?;
            println!("Activated {}", describe(&active));
        }
        LogicCommand::Deprecate { version } => {
            let deprecated = versions.deprecate(&version).await?;
            println!("Deprecated {}", describe(&deprecated));
        }
        LogicCommand::Stats { version } => {
            let stats = versions.stats(&version).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

fn describe(version: &LogicVersion) -> String {
    let mut status = if version.is_active { "active" } else { "inactive" }.to_string();
    if version.deprecated_at.is_some() {
        status = "deprecated".into();
    }
    format!(
        "{}  {}  [{}]  hash={}",
        version.version, version.name, status, version.config_hash
    )
}
