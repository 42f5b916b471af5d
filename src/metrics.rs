//! Prometheus metric sink.
//!
//! The core only emits counters and gauges into this registry; serving the
//! scrape endpoint is an external concern. `gather_metrics` renders the
//! text exposition format for whoever does.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Registry holding every metric the daemon emits.
    pub static ref REGISTRY: Registry = Registry::new();

    // Counters

    /// Total messages delivered to client connections.
    pub static ref MESSAGES_SENT: IntCounter = IntCounter::new(
        "irc_messages_sent_total",
        "Total messages sent to clients"
    ).unwrap();

    /// Rate limit hits, labeled by bucket type (`connection` or `command`).
    pub static ref RATE_LIMIT_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("irc_rate_limit_hits_total", "Rate limit hits"),
        &["type"]
    ).unwrap();

    /// Channel-ban JOIN rejections.
    pub static ref BANS_TRIGGERED: IntCounter = IntCounter::new(
        "irc_bans_triggered_total",
        "Channel ban enforcement events"
    ).unwrap();

    /// K/G/Z-line rejections at connection or registration time.
    pub static ref XLINES_ENFORCED: IntCounter = IntCounter::new(
        "irc_xlines_enforced_total",
        "Server ban enforcement events"
    ).unwrap();

    /// Trigger firings suppressed by a cooldown.
    pub static ref TRIGGER_COOLDOWN_BLOCKED: IntCounter = IntCounter::new(
        "irc_trigger_cooldown_blocked_total",
        "Trigger activations blocked by cooldown"
    ).unwrap();

    // Gauges

    /// Currently connected (registered) users.
    pub static ref CONNECTED_USERS: IntGauge = IntGauge::new(
        "irc_connected_users",
        "Currently connected users"
    ).unwrap();

    /// Live channels.
    pub static ref ACTIVE_CHANNELS: IntGauge = IntGauge::new(
        "irc_active_channels",
        "Active channels"
    ).unwrap();

    /// Network operators online.
    pub static ref OPERATORS_ONLINE: IntGauge = IntGauge::new(
        "irc_operators_online",
        "Network operators online"
    ).unwrap();

    /// Directly and indirectly linked peer servers.
    pub static ref LINKED_SERVERS: IntGauge = IntGauge::new(
        "irc_linked_servers",
        "Linked peer servers"
    ).unwrap();
}

/// Register every metric. Call once at startup.
pub fn init() {
    REGISTRY.register(Box::new(MESSAGES_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(RATE_LIMIT_HITS.clone())).unwrap();
    REGISTRY.register(Box::new(BANS_TRIGGERED.clone())).unwrap();
    REGISTRY.register(Box::new(XLINES_ENFORCED.clone())).unwrap();
    REGISTRY
        .register(Box::new(TRIGGER_COOLDOWN_BLOCKED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(CONNECTED_USERS.clone())).unwrap();
    REGISTRY.register(Box::new(ACTIVE_CHANNELS.clone())).unwrap();
    REGISTRY.register(Box::new(OPERATORS_ONLINE.clone())).unwrap();
    REGISTRY.register(Box::new(LINKED_SERVERS.clone())).unwrap();
}

/// Render all metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
