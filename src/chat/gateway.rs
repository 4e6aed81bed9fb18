//! Realtime gateway: client connections and per-conversation fan-out.
//!
//! Every connection owns a bounded outbound queue drained by its socket
//! writer. Publishing never waits on a connection: if a queue is full or
//! its receiver is gone, that connection is dropped and its `closed` token
//! is tripped so the socket loop shuts down.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use agentdeck_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::GatewayError;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The receiving half handed to a socket loop on registration.
pub struct Connection {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the gateway drops this connection.
    pub closed: CancellationToken,
}

struct ConnectionSlot {
    tx: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionSlot>,
    subscribers: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(slot) = self.connections.remove(&id) else {
            return false;
        };
        for conversation_id in &slot.subscriptions {
            if let Some(set) = self.subscribers.get_mut(conversation_id) {
                set.remove(&id);
                if set.is_empty() {
                    self.subscribers.remove(conversation_id);
                }
            }
        }
        slot.closed.cancel();
        true
    }
}

pub struct Gateway {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl Gateway {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> Connection {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, outbound) = mpsc::channel(self.buffer);
        let closed = CancellationToken::new();
        self.lock().connections.insert(
            id,
            ConnectionSlot {
                tx,
                closed: closed.clone(),
                subscriptions: HashSet::new(),
            },
        );
        debug!(connection = %id, "connection registered");
        Connection {
            id,
            outbound,
            closed,
        }
    }

    pub fn subscribe(&self, id: ConnectionId, conversation_id: &str) -> Result<(), GatewayError> {
        let mut registry = self.lock();
        let slot = registry
            .connections
            .get_mut(&id)
            .ok_or(GatewayError::ConnectionClosed(id.0))?;
        slot.subscriptions.insert(conversation_id.to_string());
        registry
            .subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .insert(id);
        Ok(())
    }

    /// Drop one subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, id: ConnectionId, conversation_id: &str) -> bool {
        let mut registry = self.lock();
        let removed = registry
            .connections
            .get_mut(&id)
            .is_some_and(|slot| slot.subscriptions.remove(conversation_id));
        if let Some(set) = registry.subscribers.get_mut(conversation_id) {
            set.remove(&id);
            if set.is_empty() {
                registry.subscribers.remove(conversation_id);
            }
        }
        removed
    }

    /// Forget a connection and all of its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) {
        if self.lock().remove(id) {
            debug!(connection = %id, "connection closed");
        }
    }

    /// Deliver `message` to every subscriber of `conversation_id`.
    ///
    /// Returns how many connections accepted it.
    pub fn publish(&self, conversation_id: &str, message: &ServerMessage) -> usize {
        let mut registry = self.lock();
        let Some(ids) = registry.subscribers.get(conversation_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in ids {
            let Some(slot) = registry.connections.get(id) else {
                continue;
            };
            match slot.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %id, conversation_id, "outbound buffer full, dropping connection");
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            registry.remove(id);
        }
        delivered
    }

    /// Deliver to one connection, under the same overflow rule as `publish`.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> Result<(), GatewayError> {
        let mut registry = self.lock();
        let slot = registry
            .connections
            .get(&id)
            .ok_or(GatewayError::ConnectionClosed(id.0))?;
        match slot.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, "outbound buffer full, dropping connection");
                registry.remove(id);
                Err(GatewayError::ConnectionClosed(id.0))
            }
            Err(TrySendError::Closed(_)) => {
                registry.remove(id);
                Err(GatewayError::ConnectionClosed(id.0))
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.lock()
            .subscribers
            .get(conversation_id)
            .map_or(0, HashSet::len)
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_subscribed(&self, id: ConnectionId, conversation_id: &str) -> bool {
        self.lock()
            .subscribers
            .get(conversation_id)
            .is_some_and(|set| set.contains(&id))
    }
}
