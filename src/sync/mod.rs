//! Server-to-server federation: handshake, burst, topology, routing,
//! netsplit handling.

pub mod burst;
pub mod handshake;
pub mod link;
pub mod split;
pub mod topology;

use dashmap::DashMap;
use lattice_proto::ident::ServerId;
use lattice_proto::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use handshake::{LinkHandshake, LinkPhase};
pub use topology::{LinkedServer, Topology};

/// Outbound handle to one directly connected peer.
#[derive(Clone)]
pub struct PeerHandle {
    pub sid: ServerId,
    pub name: String,
    pub tx: mpsc::Sender<Arc<Message>>,
}

/// Peer links and the routing table.
pub struct SyncManager {
    /// Directly connected peers, keyed by their SID.
    pub peers: DashMap<ServerId, PeerHandle>,
    /// Every known server, direct or learned.
    pub topology: Topology,
}

impl SyncManager {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            topology: Topology::new(),
        }
    }

    /// The direct peer through which `target` is reached.
    pub fn peer_for(&self, target: &ServerId) -> Option<PeerHandle> {
        let next_hop = self.topology.route_to(target)?;
        self.peers.get(&next_hop).map(|p| p.clone())
    }

    /// Queue a message toward a target server, forwarding exactly once.
    pub async fn route(&self, target: &ServerId, msg: Arc<Message>) {
        match self.peer_for(target) {
            Some(peer) => {
                let _ = peer.tx.send(msg).await;
            }
            None => {
                tracing::warn!(target = %target, "No route to server");
            }
        }
    }

    /// Send to every direct peer except the one the message arrived from.
    /// The spanning tree guarantees no duplicates.
    pub async fn broadcast(&self, msg: Arc<Message>, except: Option<&ServerId>) {
        let peers: Vec<PeerHandle> = self
            .peers
            .iter()
            .filter(|p| Some(&p.sid) != except)
            .map(|p| p.clone())
            .collect();
        for peer in peers {
            let _ = peer.tx.send(msg.clone()).await;
        }
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}
