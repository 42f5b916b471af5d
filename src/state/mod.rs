//! The authoritative in-memory state graph.
//!
//! [`Fabric`] owns every user, channel, and server the daemon knows about.
//! Sharded maps (dashmap) hold the entities; each user and channel sits
//! behind its own async `RwLock`. Cross-references are ids and names only
//! — users store channel *names*, channels store member *uids* — so
//! removal never chases dangling pointers and reads never observe a
//! half-updated membership set.

pub mod channel;
pub mod graph;
pub mod observer;
pub mod registration;
pub mod uid;
pub mod user;

use crate::config::Config;
use crate::db::Database;
use crate::security::{BanTable, Cloaker, RateLimiter};
use crate::sync::SyncManager;
use crate::triggers::TriggerEngine;
use dashmap::DashMap;
use lattice_proto::ident::ServerId;
use lattice_proto::{irc_to_lower, Message};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

pub use channel::{Channel, ListEntry, Member, Topic};
pub use observer::{EventHub, FabricSnapshot, UserEvent, UserEventKind};
pub use registration::{RegPhase, SaslPhase, Session};
pub use uid::UidAllocator;
pub use user::{OperPrivileges, User, WhowasEntry};

/// This server's identity, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub sid: ServerId,
    pub description: String,
    pub network: String,
    pub admin_name: String,
    pub admin_email: String,
}

/// Outbound handle to one local client connection.
///
/// Carries a mirror of the client's negotiated capability set so fan-out
/// paths can decorate per-recipient (server-time, account-tag) without
/// touching the user lock.
#[derive(Clone)]
pub struct ClientHandle {
    pub tx: mpsc::Sender<Arc<Message>>,
    pub caps: Arc<parking_lot::RwLock<HashSet<String>>>,
    /// Connection arrived on a TLS listener.
    pub secure: bool,
}

/// How many WHOWAS entries are kept per nickname.
const WHOWAS_DEPTH: usize = 8;

/// The state graph. One per process; injected everywhere, never a global.
pub struct Fabric {
    pub server: ServerIdentity,
    config: parking_lot::RwLock<Arc<Config>>,
    /// Where the config was loaded from, for REHASH. Empty in tests.
    config_path: parking_lot::RwLock<String>,
    /// uid → user.
    pub users: DashMap<String, Arc<RwLock<User>>>,
    /// folded nick → uid. The uniqueness authority.
    pub nicks: DashMap<String, String>,
    /// folded name → channel.
    pub channels: DashMap<String, Arc<RwLock<Channel>>>,
    /// folded name → founder account, for channels that survive emptiness.
    pub registered_channels: DashMap<String, String>,
    /// uid → outbound queue, local users only.
    pub senders: DashMap<String, ClientHandle>,
    /// folded nick → departed-user history.
    whowas: parking_lot::Mutex<HashMap<String, VecDeque<WhowasEntry>>>,
    pub uid_gen: UidAllocator,
    pub sync: SyncManager,
    pub rate_limiter: RateLimiter,
    pub cloak: Cloaker,
    pub bans: BanTable,
    pub triggers: TriggerEngine,
    pub db: Database,
    pub events: EventHub,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub motd: Vec<String>,
    /// Broadcast shutdown signal for every task.
    pub shutdown: broadcast::Sender<()>,
    /// Weak self-reference so sync code paths can recover the owning Arc
    /// when they need to spawn (see the broker's Sendq policy).
    pub(crate) self_ref: std::sync::Weak<Fabric>,
}

impl Fabric {
    pub fn new(config: Arc<Config>, db: Database) -> Arc<Self> {
        let sid = ServerId::parse(&config.server.sid).expect("config validated before Fabric::new");
        let (shutdown, _) = broadcast::channel(4);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            server: ServerIdentity {
                name: config.server.name.clone(),
                sid: sid.clone(),
                description: config.server.description.clone(),
                network: config.server.network.clone(),
                admin_name: config.server.admin_name.clone(),
                admin_email: config.server.admin_email.clone(),
            },
            users: DashMap::new(),
            nicks: DashMap::new(),
            channels: DashMap::new(),
            registered_channels: DashMap::new(),
            senders: DashMap::new(),
            whowas: parking_lot::Mutex::new(HashMap::new()),
            uid_gen: UidAllocator::new(sid),
            sync: SyncManager::new(),
            rate_limiter: RateLimiter::new(config.security.rate_limit.clone()),
            cloak: Cloaker::new(&config.security.cloak_secret, &config.security.cloak_suffix),
            bans: BanTable::new(),
            triggers: TriggerEngine::from_config(&config.triggers),
            db,
            events: EventHub::new(),
            started_at: chrono::Utc::now(),
            motd: config.motd.load_lines(),
            config: parking_lot::RwLock::new(config),
            config_path: parking_lot::RwLock::new(String::new()),
            shutdown,
        })
    }

    pub fn set_config_path(&self, path: &str) {
        *self.config_path.write() = path.to_string();
    }

    pub fn config_path(&self) -> String {
        self.config_path.read().clone()
    }

    /// Recover the owning `Arc` from a `&self` context.
    pub fn arc(&self) -> Arc<Fabric> {
        self.self_ref
            .upgrade()
            .expect("Fabric is always owned by an Arc")
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Swap in a reloaded configuration (REHASH). Identity fields are
    /// fixed for the process lifetime; only tunables take effect.
    pub fn replace_config(&self, config: Arc<Config>) {
        *self.config.write() = config;
    }

    /// Whether this UID names a user hosted by this server.
    pub fn is_local(&self, uid: &str) -> bool {
        uid.starts_with(self.server.sid.as_str())
    }

    /// Resolve a nickname (any casing) to a UID.
    pub fn uid_by_nick(&self, nick: &str) -> Option<String> {
        self.nicks.get(&irc_to_lower(nick)).map(|r| r.clone())
    }

    pub fn user_by_uid(&self, uid: &str) -> Option<Arc<RwLock<User>>> {
        self.users.get(uid).map(|r| r.clone())
    }

    pub async fn user_by_nick(&self, nick: &str) -> Option<(String, Arc<RwLock<User>>)> {
        let uid = self.uid_by_nick(nick)?;
        let user = self.user_by_uid(&uid)?;
        Some((uid, user))
    }

    pub fn channel(&self, folded: &str) -> Option<Arc<RwLock<Channel>>> {
        self.channels.get(folded).map(|r| r.clone())
    }

    /// Record a departed user for WHOWAS.
    pub fn remember_whowas(&self, entry: WhowasEntry) {
        let mut map = self.whowas.lock();
        let ring = map.entry(irc_to_lower(&entry.nick)).or_default();
        ring.push_front(entry);
        ring.truncate(WHOWAS_DEPTH);
    }

    pub fn whowas_of(&self, nick: &str) -> Vec<WhowasEntry> {
        self.whowas
            .lock()
            .get(&irc_to_lower(nick))
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop WHOWAS entries older than the cutoff (unix millis).
    pub fn prune_whowas(&self, cutoff_millis: i64) {
        let mut map = self.whowas.lock();
        map.retain(|_, ring| {
            ring.retain(|e| e.logout_time >= cutoff_millis);
            !ring.is_empty()
        });
    }

    /// Aggregate counters for the admin contract.
    pub async fn snapshot(&self) -> FabricSnapshot {
        let mut operators = 0;
        let user_arcs: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        for user in user_arcs {
            if user.read().await.is_oper() {
                operators += 1;
            }
        }
        let tls = self.senders.iter().filter(|h| h.secure).count();
        FabricSnapshot {
            user_count: self.users.len(),
            channel_count: self.channels.len(),
            operators_online: operators,
            active_connections: self.senders.len(),
            tls_connections: tls,
            linked_servers: self.sync.topology.len(),
        }
    }
}

#[cfg(test)]
pub mod testutil {
    //! Helpers for building an isolated Fabric in unit tests.

    use super::*;

    pub async fn test_fabric() -> Arc<Fabric> {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "irc.lattice.test"
            sid = "0LT"

            [[listeners]]
            address = "127.0.0.1"
            port = 6667

            [security]
            cloak_secret = "unit-test-secret-0123456789abcdef"
            "#,
        )
        .unwrap();
        let db = Database::in_memory().await.unwrap();
        Fabric::new(Arc::new(config), db)
    }
}
