//! User state.

use lattice_proto::ident::{Hostmask, ServerId};
use lattice_proto::message::Source;
use lattice_proto::UserModes;
use std::collections::HashSet;

/// Operator privilege bits. This bitflag set is the canonical form;
/// anything presenting privileges as strings is a view over it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperPrivileges(u32);

impl OperPrivileges {
    pub const KILL: u32 = 1 << 0;
    pub const KLINE: u32 = 1 << 1;
    pub const REHASH: u32 = 1 << 2;
    pub const DIE: u32 = 1 << 3;
    pub const WALLOPS: u32 = 1 << 4;
    pub const SQUIT: u32 = 1 << 5;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn grant(&mut self, bit: u32) {
        self.0 |= bit;
    }

    /// Map configured privilege names onto bits; unknown names are ignored
    /// with a warning so a typo cannot silently widen access.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut privs = Self::default();
        for name in names {
            match name.as_ref() {
                "kill" => privs.grant(Self::KILL),
                "kline" => privs.grant(Self::KLINE),
                "rehash" => privs.grant(Self::REHASH),
                "die" => privs.grant(Self::DIE),
                "wallops" => privs.grant(Self::WALLOPS),
                "squit" => privs.grant(Self::SQUIT),
                other => tracing::warn!(privilege = other, "Unknown oper privilege"),
            }
        }
        privs
    }
}

/// A user in the network graph — local (hosted by this server) or remote
/// (hosted by a peer, learned from a UID burst).
///
/// Users carry channel *names*, never channel references; all traversal
/// resolves through the channel map so removal stays O(degree).
#[derive(Debug)]
pub struct User {
    /// 9-character TS6 id. The first three characters name the hosting
    /// server, which is how local vs. remote is decided.
    pub uid: String,
    pub nick: String,
    /// Ident (username).
    pub user: String,
    pub realname: String,
    /// Real host (reverse DNS result, or the IP as text).
    pub host: String,
    pub ip: String,
    /// Cloaked host shown on the wire.
    pub visible_host: String,
    pub modes: UserModes,
    pub account: Option<String>,
    pub away: Option<String>,
    /// Folded names of joined channels.
    pub channels: HashSet<String>,
    /// Negotiated IRCv3 capabilities (wire identifiers).
    pub caps: HashSet<String>,
    /// TLS client certificate fingerprint, when the transport provides one.
    pub certfp: Option<String>,
    /// TS6 nick timestamp: seconds, reset on every nick change. Collision
    /// resolution compares these.
    pub nick_ts: i64,
    pub connected_at: i64,
    /// Unix seconds of the last command, for WHOIS idle.
    pub last_activity: i64,
    /// Operator privileges; empty unless `modes` has +o.
    pub privileges: OperPrivileges,
}

impl User {
    /// Whether this user is hosted by the given server.
    pub fn hosted_by(&self, sid: &ServerId) -> bool {
        self.uid.starts_with(sid.as_str())
    }

    /// The SID prefix of this user's UID.
    pub fn host_sid(&self) -> Option<ServerId> {
        ServerId::parse(self.uid.get(..3)?).ok()
    }

    /// The user's wire-visible hostmask.
    pub fn hostmask(&self) -> Hostmask {
        Hostmask::new(&self.nick, &self.user, &self.visible_host)
    }

    /// The hostmask against which bans are matched: visible host and, as a
    /// second chance, the real host and IP (so cloaking cannot dodge bans).
    pub fn ban_masks(&self) -> [Hostmask; 3] {
        [
            Hostmask::new(&self.nick, &self.user, &self.visible_host),
            Hostmask::new(&self.nick, &self.user, &self.host),
            Hostmask::new(&self.nick, &self.user, &self.ip),
        ]
    }

    /// Message source for lines originating from this user.
    pub fn source(&self) -> Source {
        Source::User {
            nick: self.nick.clone(),
            user: self.user.clone(),
            host: self.visible_host.clone(),
        }
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.contains(cap)
    }

    pub fn is_oper(&self) -> bool {
        self.modes.has(UserModes::OPER)
    }
}

/// A departed user, retained for WHOWAS.
#[derive(Debug, Clone)]
pub struct WhowasEntry {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub server: String,
    /// Unix millis of the disconnect.
    pub logout_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileges_from_names() {
        let privs = OperPrivileges::from_names(&["kill", "rehash", "nonsense"]);
        assert!(privs.has(OperPrivileges::KILL));
        assert!(privs.has(OperPrivileges::REHASH));
        assert!(!privs.has(OperPrivileges::DIE));
    }

    #[test]
    fn sid_prefix_decides_hosting() {
        let user = User {
            uid: "0LTAAAAAA".into(),
            nick: "alice".into(),
            user: "a".into(),
            realname: "Alice".into(),
            host: "host.example".into(),
            ip: "192.0.2.1".into(),
            visible_host: "cloak.lattice".into(),
            modes: UserModes::default(),
            account: None,
            away: None,
            channels: HashSet::new(),
            caps: HashSet::new(),
            certfp: None,
            nick_ts: 100,
            connected_at: 100,
            last_activity: 100,
            privileges: OperPrivileges::default(),
        };
        assert!(user.hosted_by(&ServerId::parse("0LT").unwrap()));
        assert!(!user.hosted_by(&ServerId::parse("9ZZ").unwrap()));
        assert_eq!(user.hostmask().to_string(), "alice!a@cloak.lattice");
    }
}
