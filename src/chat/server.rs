use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::api::{self, AppState, SharedState};
use super::context::AgentSettings;
use super::db::{ChatDb, DbHandle};
use super::gateway::DEFAULT_SUBSCRIBER_BUFFER;
use super::supervisor::CliLauncher;
use super::ws;

/// Configuration for the chat server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub agent: AgentSettings,
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".agentdeck/agentdeck.db"),
            dev_mode: false,
            agent: AgentSettings::default(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Build the full application router: REST API plus the realtime socket.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open (creating if needed) the database at `path`.
pub fn open_database(path: &std::path::Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = ChatDb::new(path).context("Failed to initialize chat database")?;
    Ok(DbHandle::new(db))
}

/// Serve `state` on `listener` until `shutdown` resolves, then stop every
/// running turn.
pub async fn serve<F>(listener: TcpListener, state: SharedState, dev_mode: bool, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state.clone(), dev_mode);
    let sockets = state.shutdown.clone();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            sockets.cancel();
        })
        .await
        .context("Server error")?;

    state.coordinator.shutdown().await;
    Ok(())
}

/// Start the chat server and block until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config.db_path)?;
    let state = Arc::new(AppState::new(
        db,
        Arc::new(CliLauncher),
        config.agent.clone(),
        config.subscriber_buffer,
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr: SocketAddr = listener.local_addr()?;
    info!(
        address = %local_addr,
        db_path = %config.db_path.display(),
        agent = %config.agent.command,
        dev_mode = config.dev_mode,
        "agentdeck server listening"
    );
    println!("agentdeck running at http://{}", local_addr);

    serve(listener, state, config.dev_mode, shutdown_signal()).await?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown requested");
}
