//! Netsplit handling.
//!
//! Losing a direct peer removes that server and every server learned
//! through it, then mass-quits all users those servers hosted. The
//! cascade runs to completion before the link task accepts anything else
//! from any peer message already queued behind it, which keeps stale UIDs
//! from racing the cleanup.

use crate::state::Fabric;
use lattice_proto::ident::ServerId;
use lattice_proto::Message;
use std::sync::Arc;

/// The conventional netsplit quit message both sides of the split show.
pub const SPLIT_QUIT: &str = "*.net *.split";

/// Tear down a dead link: cascade over the subtree, mass-quit its users,
/// and tell the rest of the mesh.
pub async fn handle_netsplit(fabric: &Arc<Fabric>, dead_sid: &ServerId) {
    let cascade = fabric.sync.topology.subtree(dead_sid);
    if cascade.is_empty() && !fabric.sync.peers.contains_key(dead_sid) {
        return;
    }
    tracing::info!(
        dead = %dead_sid,
        servers = cascade.len(),
        "Netsplit: removing unreachable servers"
    );

    // Collect every user hosted by a server in the cascade.
    let affected: Vec<String> = fabric
        .users
        .iter()
        .map(|e| e.key().clone())
        .filter(|uid| {
            uid.get(..3)
                .and_then(|sid| ServerId::parse(sid).ok())
                .is_some_and(|sid| cascade.contains(&sid))
        })
        .collect();

    tracing::info!(users = affected.len(), "Netsplit: mass quit");
    for uid in &affected {
        if let Some(removed) = fabric.remove_user(uid).await {
            let quit = Message::cmd("QUIT", [SPLIT_QUIT]).with_source(removed.source);
            for local in removed.audience {
                fabric.send_to_uid(&local, quit.clone());
            }
        }
    }

    fabric.sync.topology.remove_many(&cascade);
    fabric.sync.peers.remove(dead_sid);
    crate::metrics::LINKED_SERVERS.set(fabric.sync.topology.len() as i64);

    // The rest of the mesh learns about the split once, from us.
    let squit = Message::cmd("SQUIT", [dead_sid.as_str(), SPLIT_QUIT])
        .with_source(lattice_proto::message::Source::Name(
            fabric.server.sid.as_str().to_string(),
        ));
    fabric.broadcast_network(squit, Some(dead_sid)).await;
}
