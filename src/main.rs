use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "agentdeck")]
#[command(version, about = "Chat with a coding agent from the browser")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the chat server
    Serve {
        /// Port to serve on (overrides agentdeck.toml and AGENTDECK_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Initialize database only (don't start server)
        #[arg(long)]
        init: bool,

        /// Database path (overrides agentdeck.toml)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Auto-open browser after server starts
        #[arg(long)]
        open: bool,

        /// Enable dev mode (CORS permissive, listen on all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default agentdeck.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            init,
            db_path,
            open,
            dev,
        } => {
            let options = cmd::ServeOptions {
                port: *port,
                init: *init,
                db_path: db_path.clone(),
                open: *open,
                dev: *dev,
            };
            cmd::cmd_serve(project_dir, options, cli.verbose).await?;
        }
        Commands::Config { command } => {
            agentdeck::logging::init_cli_tracing(cli.verbose);
            cmd::cmd_config(&project_dir, command.clone())?;
        }
    }

    Ok(())
}
