use std::time::Duration;

use agentdeck_protocol::{ClientMessage, ServerMessage};
use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{AppState, SharedState};
use super::coordinator::AcceptOutcome;
use super::gateway::{Connection, ConnectionId};
use super::models::PendingMessage;
use crate::errors::{CoordinatorError, GatewayError};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let connection = state.gateway.register();
    let id = connection.id;
    info!(connection = %id, "client connected");

    let running = state.coordinator.running_conversations().await;
    if state
        .gateway
        .send_to(
            id,
            ServerMessage::Streaming {
                conversation_ids: running,
            },
        )
        .is_ok()
    {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, connection, &state).await;
    }

    state.gateway.disconnect(id);
    info!(connection = %id, "client disconnected");
}

/// Socket loop with ping/pong keepalive.
///
/// Drains the connection's outbound queue, dispatches client messages, and
/// exits when the client goes away, stops answering pings, or the gateway
/// drops the connection.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut connection: Connection,
    state: &AppState,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    warn!(connection = %connection.id, "no pong received, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            outbound = connection.outbound.recv() => {
                let Some(message) = outbound else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(connection = %connection.id, error = %e, "failed to serialize server message");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            _ = connection.closed.cancelled() => break,

            _ = state.shutdown.cancelled() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(state, connection.id, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %connection.id, error = %e, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Parse and dispatch one client frame. Failures are answered with an
/// `error` message on the same connection.
pub(crate) async fn handle_text(state: &AppState, connection: ConnectionId, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection = %connection, error = %e, "unparseable client message");
            let _ = state
                .gateway
                .send_to(connection, ServerMessage::error(None, format!("Invalid message: {}", e)));
            return;
        }
    };

    let conversation_id = message.conversation_id().to_string();
    if let Err(e) = dispatch(state, connection, message).await {
        if let GatewayError::Coordinator(CoordinatorError::Store(inner)) = &e {
            warn!(connection = %connection, conversation_id, error = %format!("{:#}", inner), "store lookup failed");
        }
        let _ = state.gateway.send_to(
            connection,
            ServerMessage::error(Some(&conversation_id), e.to_string()),
        );
    }
}

async fn dispatch(
    state: &AppState,
    connection: ConnectionId,
    message: ClientMessage,
) -> Result<(), GatewayError> {
    match message {
        ClientMessage::Send {
            conversation_id,
            content,
            attachments,
            model,
            thinking,
            mode,
        } => {
            ensure_conversation(state, &conversation_id).await?;
            if content.trim().is_empty() && attachments.is_empty() {
                return Err(GatewayError::InvalidMessage("message content is empty".into()));
            }
            state.coordinator.subscribe(&conversation_id, connection).await?;
            let pending = PendingMessage {
                content,
                attachments,
                model,
                thinking,
                mode,
            };
            match state.coordinator.accept(&conversation_id, pending).await? {
                AcceptOutcome::Started { turn_id } => {
                    debug!(connection = %connection, conversation_id, turn_id, "message started a turn");
                }
                AcceptOutcome::Queued { position } => {
                    debug!(connection = %connection, conversation_id, position, "message queued");
                }
                // Already published to every subscriber, this connection included
                AcceptOutcome::Failed { .. } => {}
            }
            Ok(())
        }
        ClientMessage::Stop { conversation_id } => {
            ensure_conversation(state, &conversation_id).await?;
            if !state.coordinator.stop(&conversation_id).await? {
                debug!(connection = %connection, conversation_id, "stop with nothing running");
            }
            Ok(())
        }
        ClientMessage::Subscribe { conversation_id } => {
            ensure_conversation(state, &conversation_id).await?;
            state.coordinator.subscribe(&conversation_id, connection).await?;
            Ok(())
        }
        ClientMessage::Unsubscribe { conversation_id } => {
            state.gateway.unsubscribe(connection, &conversation_id);
            Ok(())
        }
    }
}

async fn ensure_conversation(state: &AppState, conversation_id: &str) -> Result<(), GatewayError> {
    let exists = state
        .coordinator
        .store()
        .conversation_exists(conversation_id)
        .await
        .map_err(|e| GatewayError::Coordinator(CoordinatorError::Store(e)))?;
    if exists {
        Ok(())
    } else {
        Err(GatewayError::UnknownConversation(conversation_id.to_string()))
    }
}
