//! OpsClaw CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Interactive or single-message chat
//! - `serve`: Start the HTTP gateway
//! - `operations`: List the operations a caller may use
//! - `config`: Show, initialize, or validate configuration
//! - `logic`: Manage logic versions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "opsclaw",
    about = "OpsClaw — operations assistant with confirm-before-execute tooling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Config file (defaults to ~/.opsclaw/config.toml)
    #[arg(long, global = true, env = "OPSCLAW_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat(commands::chat::ChatArgs),

    /// Start the HTTP gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List operations available to a set of roles
    Operations {
        /// Roles to list for (comma-separated)
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(commands::config_cmd::ConfigCommand),

    /// Logic version management
    #[command(subcommand)]
    Logic(commands::logic::LogicCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Chat(args) => commands::chat::run(config_path, args).await?,
        Commands::Serve { port } => commands::serve::run(config_path, port).await?,
        Commands::Operations { roles } => commands::operations::run(config_path, roles).await?,
        Commands::Config(cmd) => commands::config_cmd::run(config_path, cmd)?,
        Commands::Logic(cmd) => commands::logic::run(config_path, cmd).await?,
    }

    Ok(())
}
