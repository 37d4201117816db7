//! Connected peers and topic fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use modlink_core::Response;
use serde_json::Value;
use tokio::sync::{RwLock, oneshot};
use tracing::{debug, warn};

use crate::connection::PeerConnection;
use crate::tasks::TaskOp;

/// Connections of one server, indexed by connection id.
#[derive(Debug, Default)]
pub struct PeerSet {
    connections: RwLock<HashMap<String, Arc<PeerConnection>>>,
}

impl PeerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<PeerConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.conn_id.clone(), connection);
    }

    /// Remove a connection by id.
    pub async fn remove(&self, conn_id: &str) -> Option<Arc<PeerConnection>> {
        self.connections.write().await.remove(conn_id)
    }

    /// Send `[PUBLISH, topic, data]` to every peer, or only to the peers
    /// whose handshake id is in `peer_ids`. Returns whether any peer got it.
    pub async fn publish(&self, topic: &str, data: &Value, peer_ids: Option<&[String]>) -> bool {
        let frame = Response::publish(topic, data.clone());
        let conns = self.connections.read().await;
        let mut recipients = 0usize;
        for conn in conns.values() {
            if peer_ids.is_some_and(|ids| !ids.iter().any(|id| *id == conn.peer_id)) {
                continue;
            }
            if conn.send(frame.clone()) {
                recipients += 1;
            } else {
                warn!(conn_id = %conn.conn_id, topic, "failed to publish to peer");
            }
        }
        debug!(topic, recipients, "published");
        recipients > 0
    }

    /// Handshake ids of the connected peers, sorted.
    pub async fn peer_ids(&self) -> Vec<String> {
        let conns = self.connections.read().await;
        let mut ids: Vec<String> = conns.values().map(|c| c.peer_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Number of connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no peer is connected.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Suspended generator tasks across all connections.
    pub async fn suspended_tasks(&self) -> usize {
        let conns = self.connections.read().await;
        conns.values().map(|c| c.suspended_tasks()).sum()
    }

    /// Force-return every suspended task and wait for the workers to
    /// acknowledge. Running plain calls are detached. Returns how many
    /// generators were returned.
    pub async fn force_return_all(&self) -> usize {
        let conns: Vec<Arc<PeerConnection>> = self.connections.read().await.values().cloned().collect();
        let mut acks = Vec::new();
        for conn in conns {
            for handle in conn.take_tasks() {
                if !handle.is_suspended() {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                if handle.send(TaskOp::ForceReturn(tx)) {
                    acks.push(rx);
                }
            }
        }
        let count = acks.len();
        let _ = futures::future::join_all(acks).await;
        count
    }

    /// Ask every writer to close its socket and forget all connections.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<PeerConnection>> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in &drained {
            let _ = conn.close();
        }
        drained.len()
    }
}
