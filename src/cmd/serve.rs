//! Chat server command, `agentdeck serve`.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use agentdeck::chat::server::{self, ServerConfig};
use agentdeck::config::{AgentdeckConfig, CliOverrides};

pub struct ServeOptions {
    pub port: Option<u16>,
    pub init: bool,
    pub db_path: Option<PathBuf>,
    pub open: bool,
    pub dev: bool,
}

pub async fn cmd_serve(project_dir: PathBuf, options: ServeOptions, verbose: bool) -> Result<()> {
    let config = AgentdeckConfig::new(project_dir)?.with_cli_overrides(CliOverrides {
        port: options.port,
        db_path: options.db_path,
        dev_mode: options.dev,
    });

    // Held until exit so buffered file logs get flushed
    let _log_guard = agentdeck::logging::init_tracing(&config.logging(), verbose)?;

    for warning in config.validate() {
        warn!(%warning, "configuration warning");
    }

    let db_path = config.db_path();
    if options.init {
        server::open_database(&db_path)?;
        info!(db_path = %db_path.display(), "database initialized");
        println!("Database initialized at {}", db_path.display());
        return Ok(());
    }

    let port = config.port();
    // No browser inside dev containers
    if options.open && !config.dev_mode() {
        let url = format!("http://localhost:{}", port);
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                eprintln!("Failed to open browser: {}", e);
            }
        });
    }

    server::start_server(ServerConfig {
        host: config.host(),
        port,
        db_path,
        dev_mode: config.dev_mode(),
        agent: config.agent_settings(),
        subscriber_buffer: config.subscriber_buffer(),
    })
    .await
}
