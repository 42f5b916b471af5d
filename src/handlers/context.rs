//! Handler context.

use super::registry::Registry;
use crate::state::{Fabric, Session, User};
use lattice_proto::{Message, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything a handler can touch, threaded through the dispatcher.
///
/// Replies to the *requesting* client accumulate in `replies`; the
/// connection loop flushes them after the handler returns, wrapping them
/// in a labeled-response batch when the incoming message carried a
/// `label` tag. Messages to anyone else go through the broker directly.
pub struct Context<'a> {
    /// Connection id; equals the user's UID once registered.
    pub uid: &'a str,
    pub fabric: &'a Arc<Fabric>,
    pub session: &'a mut Session,
    pub addr: SocketAddr,
    /// `label` tag of the incoming message, when the client negotiated
    /// labeled-response.
    pub label: Option<String>,
    /// The command registry, for STATS m usage counters.
    pub registry: &'a Registry,
    /// Replies queued for this client, in order.
    pub replies: Vec<Message>,
}

impl<'a> Context<'a> {
    pub fn new(
        uid: &'a str,
        fabric: &'a Arc<Fabric>,
        session: &'a mut Session,
        addr: SocketAddr,
        label: Option<String>,
        registry: &'a Registry,
    ) -> Self {
        Self {
            uid,
            fabric,
            session,
            addr,
            label,
            registry,
            replies: Vec::new(),
        }
    }

    /// The client's nick, or `*` before one is set.
    pub fn nick(&self) -> &str {
        self.session.nick.as_deref().unwrap_or("*")
    }

    pub fn server_name(&self) -> &str {
        &self.fabric.server.name
    }

    /// Queue a raw reply to this client.
    pub fn reply(&mut self, msg: Message) {
        self.replies.push(msg);
    }

    /// Queue a server-sourced numeric reply to this client.
    pub fn numeric<S: Into<String>>(
        &mut self,
        response: Response,
        params: impl IntoIterator<Item = S>,
    ) {
        let mut all = vec![self.nick().to_string()];
        all.extend(params.into_iter().map(Into::into));
        let msg =
            Message::cmd(&response.as_command(), all).from_server(&self.fabric.server.name);
        self.replies.push(msg);
    }

    /// This connection's user entity, once registered.
    pub fn user(&self) -> Option<Arc<RwLock<User>>> {
        self.fabric.user_by_uid(self.uid)
    }

    /// Snapshot of (nick, user, visible host) for building sources.
    pub async fn source_parts(&self) -> Option<(String, String, String)> {
        let user_arc = self.user()?;
        let user = user_arc.read().await;
        Some((
            user.nick.clone(),
            user.user.clone(),
            user.visible_host.clone(),
        ))
    }

    /// Whether this connection's user holds network operator status.
    pub async fn is_oper(&self) -> bool {
        match self.user() {
            Some(user_arc) => user_arc.read().await.is_oper(),
            None => false,
        }
    }
}
