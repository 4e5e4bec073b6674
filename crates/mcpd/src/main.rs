mod commands;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const CLI_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "mcpd", version = CLI_VERSION, about = "MCP gateway daemon")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway.
    Serve {
        /// Gateway settings file (YAML, env-expanded).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Tell a running gateway to reload its configuration.
    Reload {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Config document to push along with the reload event.
        #[arg(short, long)]
        update: Option<PathBuf>,
    },
    /// Parse and compile config documents without serving.
    Validate {
        /// One or more config documents.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = shared::logging::configure_logging() {
        eprintln!("failed to configure logging: {e}");
    }

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve { config } => commands::cmd_serve(config).await,
        Commands::Reload { config, update } => commands::cmd_reload(config, update).await,
        Commands::Validate { files } => commands::cmd_validate(files).await,
    };

    commands::report_and_exit(result);
}
