//! Read-only observability surface.
//!
//! The admin/observability contract: a broadcast stream of user lifecycle
//! events plus point-in-time snapshots of the aggregate counters. Nothing
//! here can mutate the graph.

use serde::Serialize;
use tokio::sync::broadcast;

/// One user lifecycle event for the real-time push channel.
#[derive(Debug, Clone, Serialize)]
pub struct UserEvent {
    /// Unix millis.
    pub timestamp: i64,
    pub kind: UserEventKind,
    pub nickname: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UserEventKind {
    Connected,
    Disconnected,
    NickChange,
    Join,
    Part,
    Kick,
}

impl UserEvent {
    pub fn now(kind: UserEventKind, nickname: &str, hostname: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            nickname: nickname.to_string(),
            hostname: hostname.to_string(),
            channel: None,
            details: None,
        }
    }

    pub fn in_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

/// Aggregate counters for the admin panel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FabricSnapshot {
    pub user_count: usize,
    pub channel_count: usize,
    pub operators_online: usize,
    pub active_connections: usize,
    pub tls_connections: usize,
    pub linked_servers: usize,
}

/// Fan-out hub for [`UserEvent`]s. Slow consumers lag and drop, never
/// block the graph.
pub struct EventHub {
    tx: broadcast::Sender<UserEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish(&self, event: UserEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
