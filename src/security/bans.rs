//! Server bans: K-lines, G-lines, Z-lines.
//!
//! Bans are pushed into this table from the persistence layer at startup
//! and whenever an operator changes them; the table is the only thing the
//! hot path consults. Evaluation order when a connection matches several
//! classes: `Z (IP) > G (user@host, global) > K (user@host, local)` —
//! first match wins.

use dashmap::DashMap;
use ipnet::IpNet;
use lattice_proto::ident::Hostmask;
use std::net::IpAddr;

/// Ban class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanKind {
    /// `user@host`, local to this server.
    KLine,
    /// `user@host`, network-wide (carried in the burst).
    GLine,
    /// IP address or CIDR prefix.
    ZLine,
}

impl BanKind {
    pub fn letter(self) -> char {
        match self {
            BanKind::KLine => 'K',
            BanKind::GLine => 'G',
            BanKind::ZLine => 'Z',
        }
    }
}

/// One server ban.
#[derive(Debug, Clone)]
pub struct ServerBan {
    pub kind: BanKind,
    pub pattern: String,
    pub reason: String,
    pub set_by: String,
    pub created_at: i64,
    /// Unix seconds; `None` is permanent.
    pub expires_at: Option<i64>,
}

impl ServerBan {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory ban table, keyed by `(kind, pattern)`.
pub struct BanTable {
    entries: DashMap<(BanKind, String), ServerBan>,
}

impl BanTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, ban: ServerBan) {
        self.entries.insert((ban.kind, ban.pattern.clone()), ban);
    }

    pub fn remove(&self, kind: BanKind, pattern: &str) -> bool {
        self.entries.remove(&(kind, pattern.to_string())).is_some()
    }

    pub fn of_kind(&self, kind: BanKind) -> Vec<ServerBan> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn prune_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, ban| !ban.is_expired(now));
        before - self.entries.len()
    }

    /// Check a connection against all classes in precedence order.
    /// Returns the first matching ban.
    pub fn check(&self, user: &str, host: &str, ip: IpAddr, now: i64) -> Option<ServerBan> {
        self.check_kind(BanKind::ZLine, user, host, ip, now)
            .or_else(|| self.check_kind(BanKind::GLine, user, host, ip, now))
            .or_else(|| self.check_kind(BanKind::KLine, user, host, ip, now))
    }

    fn check_kind(
        &self,
        kind: BanKind,
        user: &str,
        host: &str,
        ip: IpAddr,
        now: i64,
    ) -> Option<ServerBan> {
        self.entries.iter().find_map(|entry| {
            let ban = entry.value();
            if ban.kind != kind || ban.is_expired(now) {
                return None;
            }
            let hit = match kind {
                BanKind::ZLine => ip_matches(&ban.pattern, ip),
                BanKind::KLine | BanKind::GLine => userhost_matches(&ban.pattern, user, host, ip),
            };
            hit.then(|| ban.clone())
        })
    }
}

impl Default for BanTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `user@host` wildcard match, tried against both the hostname and the IP.
fn userhost_matches(pattern: &str, user: &str, host: &str, ip: IpAddr) -> bool {
    let by_host = Hostmask::new("*", user, host);
    let by_ip = Hostmask::new("*", user, &ip.to_string());
    let pattern = if pattern.contains('!') {
        pattern.to_string()
    } else {
        format!("*!{}", pattern)
    };
    by_host.matches(&pattern) || by_ip.matches(&pattern)
}

/// A Z-line pattern is an exact IP or a CIDR prefix.
fn ip_matches(pattern: &str, ip: IpAddr) -> bool {
    if let Ok(net) = pattern.parse::<IpNet>() {
        return net.contains(&ip);
    }
    pattern.parse::<IpAddr>().is_ok_and(|banned| banned == ip)
}
