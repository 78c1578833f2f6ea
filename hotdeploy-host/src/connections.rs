//! Live connection set and event fan-out

use hotdeploy::frame;
use hotdeploy::Outbound;
use hotdeploy_api::{Envelope, Notification, UnitAction, UnitEvent, UNIT_CHANGED_EVENT};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Identifier assigned to each accepted connection
pub type ConnectionId = u64;

/// Outbound queues of every connected client
#[derive(Clone, Default)]
pub struct ConnectionSet {
    next_id: Arc<AtomicU64>,
    connections: Arc<RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection's queue, returning its id
    pub async fn insert(&self, outbound: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.write().await.insert(id, outbound);
        id
    }

    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queue `text` on every connection; returns how many accepted it
    pub async fn broadcast_text(&self, text: &str) -> usize {
        let connections = self.connections.read().await;
        connections
            .values()
            .filter(|tx| tx.send(Outbound::Text(text.to_string())).is_ok())
            .count()
    }

    /// Queue a close frame on every connection
    pub async fn close_all(&self, code: u16, reason: &str) {
        let connections = self.connections.read().await;
        for tx in connections.values() {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Broadcasts host events to all clients, best effort
#[derive(Debug, Clone)]
pub struct EventPublisher {
    connections: ConnectionSet,
}

impl EventPublisher {
    pub fn new(connections: ConnectionSet) -> Self {
        Self { connections }
    }

    /// Send a notification to every client.
    ///
    /// A client whose queue is gone is skipped; publishing never fails.
    pub async fn publish(&self, notification: Notification) -> usize {
        let method = notification.method.clone();
        match frame::encode(&Envelope::from(notification)) {
            Ok(text) => {
                let delivered = self.connections.broadcast_text(&text).await;
                tracing::debug!(method = %method, delivered, "Event published");
                delivered
            }
            Err(e) => {
                tracing::error!(method = %method, error = %e, "Failed to encode event");
                0
            }
        }
    }

    /// Broadcast `unitChanged` for one unit
    pub async fn unit_changed(&self, id: &str, action: UnitAction) -> usize {
        let event = UnitEvent {
            id: id.to_string(),
            action,
        };
        let params = match serde_json::to_value(&event) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!(unit = %id, error = %e, "Failed to encode unit event");
                return 0;
            }
        };
        self.publish(Notification::new(UNIT_CHANGED_EVENT, params)).await
    }
}
