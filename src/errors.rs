//! Typed error hierarchy for agentdeck.
//!
//! One enum per layer:
//! - `SupervisorError`: agent process spawning
//! - `CoordinatorError`: conversation actors and their store
//! - `GatewayError`: realtime client messages
//! - `ChatError`: REST API and persistence lookups

use thiserror::Error;

/// Errors from starting an agent process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn agent process '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process started without a {0} pipe")]
    MissingPipe(&'static str),
}

/// Errors from the per-conversation turn coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Conversation {0} is no longer accepting commands")]
    ActorGone(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Conversation store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors raised while handling a realtime client message.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Conversation {0} not found")]
    UnknownConversation(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Errors from the REST API and its store lookups.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Conversation {id} not found")]
    ConversationNotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}
