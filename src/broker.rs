//! Router & broker: every path a message takes out of this server.
//!
//! The broker owns nothing — it operates on the graph's sender handles —
//! but all fan-out funnels through here so delivery rules live in one
//! place: per-recipient `server-time` stamping, `echo-message` handling at
//! the call sites, bounded send queues with the Sendq disconnect policy,
//! and forwarding to peer servers through the spanning tree.

use crate::state::{ClientHandle, Fabric, UserEvent, UserEventKind};
use lattice_proto::ident::ServerId;
use lattice_proto::message::Source;
use lattice_proto::Message;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;

/// ISO-8601 UTC with millisecond precision, per the server-time spec.
pub fn server_time_now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Random reference token for BATCH blocks.
pub fn batch_ref() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Wrap a reply set in a labeled-response batch. One message is tagged
/// directly; several get a `BATCH` envelope with the label on the opener.
pub fn labeled_batch(server: &str, label: &str, replies: Vec<Message>) -> Vec<Message> {
    match replies.len() {
        0 => {
            // Empty ack per the labeled-response spec.
            vec![Message::cmd("ACK", [] as [&str; 0])
                .from_server(server)
                .with_tag("label", Some(label))]
        }
        1 => {
            let mut replies = replies;
            vec![replies.remove(0).with_tag("label", Some(label))]
        }
        _ => {
            let token = batch_ref();
            let mut out = Vec::with_capacity(replies.len() + 2);
            out.push(
                Message::cmd("BATCH", [format!("+{}", token), "labeled-response".to_string()])
                    .from_server(server)
                    .with_tag("label", Some(label)),
            );
            for reply in replies {
                out.push(reply.with_tag("batch", Some(&token)));
            }
            out.push(Message::cmd("BATCH", [format!("-{}", token)]).from_server(server));
            out
        }
    }
}

impl Fabric {
    /// Deliver one message to one local connection, decorating per the
    /// recipient's capabilities. Overflowing the bounded queue invokes the
    /// Sendq policy: the connection is torn down.
    pub fn deliver(&self, uid: &str, handle: &ClientHandle, msg: &Arc<Message>) {
        let decorated = {
            let caps = handle.caps.read();
            if caps.contains("server-time") && msg.tag("time").is_none() {
                Arc::new(
                    (**msg)
                        .clone()
                        .with_tag("time", Some(&server_time_now())),
                )
            } else {
                msg.clone()
            }
        };
        match handle.tx.try_send(decorated) {
            Ok(()) => {
                crate::metrics::MESSAGES_SENT.inc();
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(uid = %uid, "Send queue exceeded, disconnecting");
                let fabric = self.arc();
                let uid = uid.to_string();
                tokio::spawn(async move {
                    fabric.disconnect_user(&uid, "Send queue exceeded").await;
                });
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Send to a single local user.
    pub fn send_to_uid(&self, uid: &str, msg: Message) {
        let msg = Arc::new(msg);
        if let Some(handle) = self.senders.get(uid) {
            self.deliver(uid, &handle, &msg);
        }
    }

    /// Fan a message out to every local member of a channel.
    ///
    /// `except` is excluded unconditionally — callers that want
    /// echo-message semantics pass `None` when the sender negotiated the
    /// capability. The enqueue loop runs under the channel's write lock
    /// (it never suspends), which serializes concurrent publishes so
    /// every member observes them in the same relative order.
    pub async fn send_to_channel(&self, folded: &str, msg: Message, except: Option<&str>) {
        let Some(chan_arc) = self.channel(folded) else {
            return;
        };
        let msg = Arc::new(msg);
        let chan = chan_arc.write().await;
        for uid in chan.members.keys() {
            if Some(uid.as_str()) == except {
                continue;
            }
            if let Some(handle) = self.senders.get(uid) {
                self.deliver(uid, &handle, &msg);
            }
        }
    }

    /// Forward a channel-scoped message to the peers hosting its remote
    /// members, once per next-hop link.
    pub async fn relay_to_channel_peers(
        &self,
        folded: &str,
        msg: Message,
        arrived_from: Option<&ServerId>,
    ) {
        let Some(chan_arc) = self.channel(folded) else {
            return;
        };
        let members: Vec<String> = {
            let chan = chan_arc.read().await;
            chan.members.keys().cloned().collect()
        };
        let mut next_hops: Vec<ServerId> = Vec::new();
        for uid in members {
            if self.is_local(&uid) {
                continue;
            }
            let Ok(sid) = ServerId::parse(&uid[..3]) else {
                continue;
            };
            if let Some(peer) = self.sync.peer_for(&sid) {
                if Some(&peer.sid) != arrived_from && !next_hops.contains(&peer.sid) {
                    next_hops.push(peer.sid);
                }
            }
        }
        let msg = Arc::new(msg);
        for sid in next_hops {
            if let Some(peer) = self.sync.peers.get(&sid) {
                let _ = peer.tx.send(msg.clone()).await;
            }
        }
    }

    /// Every connection logged in to an account.
    pub async fn send_to_account(&self, account: &str, msg: Message) {
        let msg = Arc::new(msg);
        let user_arcs: Vec<(String, _)> = self
            .users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (uid, user_arc) in user_arcs {
            let matches = {
                let user = user_arc.read().await;
                user.account.as_deref() == Some(account)
            };
            if matches {
                if let Some(handle) = self.senders.get(&uid) {
                    self.deliver(&uid, &handle, &msg);
                }
            }
        }
    }

    /// Network-wide broadcast through the spanning tree.
    pub async fn broadcast_network(&self, msg: Message, except: Option<&ServerId>) {
        self.sync.broadcast(Arc::new(msg), except).await;
    }

    /// Users sharing at least one channel with `uid`, local side only.
    pub async fn local_peers_of(&self, uid: &str) -> Vec<String> {
        let Some(user_arc) = self.user_by_uid(uid) else {
            return Vec::new();
        };
        let channels: Vec<String> = {
            let user = user_arc.read().await;
            user.channels.iter().cloned().collect()
        };
        let mut peers = std::collections::HashSet::new();
        for folded in channels {
            if let Some(chan_arc) = self.channel(&folded) {
                let chan = chan_arc.read().await;
                for member in chan.members.keys() {
                    if member != uid && self.senders.contains_key(member) {
                        peers.insert(member.clone());
                    }
                }
            }
        }
        peers.into_iter().collect()
    }

    /// Remove a user and announce the departure: QUIT to every local user
    /// who shared a channel, QUIT to the peer mesh, ERROR to the client
    /// itself. The single exit path for kills, floods, sendq overflows,
    /// ping timeouts, and ordinary QUIT.
    pub async fn disconnect_user(&self, uid: &str, reason: &str) {
        // Tell the client first; after remove_user the handle is gone.
        let was_local = self.is_local(uid);
        if was_local {
            self.send_to_uid(
                uid,
                Message::irc_error(&format!("Closing Link: {}", reason)),
            );
        }

        let Some(removed) = self.remove_user(uid).await else {
            return;
        };

        let quit = Message::cmd("QUIT", [reason]).with_source(removed.source.clone());
        let quit_arc = Arc::new(quit.clone());
        for peer_uid in &removed.audience {
            if let Some(handle) = self.senders.get(peer_uid) {
                self.deliver(peer_uid, &handle, &quit_arc);
            }
        }

        if was_local {
            let s2s = Message::cmd("QUIT", [reason]).with_source(Source::Name(uid.to_string()));
            self.broadcast_network(s2s, None).await;
        }

        self.events.publish(
            UserEvent::now(
                UserEventKind::Disconnected,
                &removed.nick,
                removed.source.to_string().as_str(),
            )
            .with_details(reason),
        );
        tracing::info!(uid = %uid, nick = %removed.nick, reason = %reason, "User disconnected");
    }
}
