//! Validated identity value types.
//!
//! Each type validates at construction and compares ASCII
//! case-insensitively, so the rest of the server never re-checks syntax.
//! The folded form is cached for hashing.

use crate::casemap::{irc_eq, irc_to_lower};
use crate::error::IdentError;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Maximum nickname length accepted by this implementation.
pub const MAX_NICK_LEN: usize = 30;

/// Maximum channel name length, including the prefix sigil.
pub const MAX_CHANNEL_LEN: usize = 50;

/// A validated nickname.
///
/// Grammar: first char in `[A-Za-z_\[\]\\`^{}|]`, subsequent chars also
/// allow digits and `-`. Never starts with a digit, never contains `.`.
#[derive(Debug, Clone, Eq)]
pub struct Nickname {
    display: String,
    folded: String,
}

fn is_nick_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '[' | ']' | '\\' | '`' | '^' | '{' | '}' | '|')
}

fn is_nick_char(c: char) -> bool {
    is_nick_start(c) || c.is_ascii_digit() || c == '-'
}

impl Nickname {
    pub fn parse(raw: &str) -> Result<Self, IdentError> {
        let mut chars = raw.chars();
        let valid = match chars.next() {
            Some(first) => is_nick_start(first) && chars.all(is_nick_char),
            None => false,
        };
        if !valid || raw.len() > MAX_NICK_LEN {
            return Err(IdentError::BadNickname(raw.to_string()));
        }
        Ok(Self {
            folded: irc_to_lower(raw),
            display: raw.to_string(),
        })
    }

    /// The nickname as the user typed it.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// The casemapped lookup key.
    pub fn folded(&self) -> &str {
        &self.folded
    }
}

impl PartialEq for Nickname {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Hash for Nickname {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl fmt::Display for Nickname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// A validated channel name: `#` or `&` prefix, 2–50 chars, no space,
/// NUL, BEL, or comma.
#[derive(Debug, Clone, Eq)]
pub struct ChannelName {
    display: String,
    folded: String,
}

impl ChannelName {
    pub fn parse(raw: &str) -> Result<Self, IdentError> {
        let ok = matches!(raw.chars().next(), Some('#') | Some('&'))
            && raw.len() >= 2
            && raw.len() <= MAX_CHANNEL_LEN
            && !raw.chars().any(|c| matches!(c, ' ' | '\0' | '\x07' | ','));
        if !ok {
            return Err(IdentError::BadChannelName(raw.to_string()));
        }
        Ok(Self {
            folded: irc_to_lower(raw),
            display: raw.to_string(),
        })
    }

    /// Whether a raw string looks like a channel target at all.
    pub fn is_channel_like(raw: &str) -> bool {
        matches!(raw.chars().next(), Some('#') | Some('&'))
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    pub fn folded(&self) -> &str {
        &self.folded
    }
}

impl PartialEq for ChannelName {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Hash for ChannelName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// A `nick!user@host` triple with wildcard matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hostmask {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Hostmask {
    pub fn new(nick: &str, user: &str, host: &str) -> Self {
        Self {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        }
    }

    /// Parse from `nick!user@host`. Missing segments become `*`.
    pub fn parse(raw: &str) -> Self {
        let (nick, rest) = match raw.split_once('!') {
            Some((n, r)) => (n, r),
            None => match raw.split_once('@') {
                // `user@host` with no nick portion.
                Some(_) => ("*", raw),
                None => (raw, "*@*"),
            },
        };
        let (user, host) = rest.split_once('@').unwrap_or((rest, "*"));
        Self::new(
            if nick.is_empty() { "*" } else { nick },
            if user.is_empty() { "*" } else { user },
            if host.is_empty() { "*" } else { host },
        )
    }

    /// Test this hostmask against a `*`/`?` wildcard pattern.
    ///
    /// Matching is ASCII case-insensitive and uses an
    /// iterative matcher with single-star backtracking: worst case
    /// O(text × pattern), never exponential, so hostile ban masks cannot
    /// burn CPU.
    pub fn matches(&self, pattern: &str) -> bool {
        wildcard_match(&irc_to_lower(&self.to_string()), &irc_to_lower(pattern))
    }
}

impl fmt::Display for Hostmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}@{}", self.nick, self.user, self.host)
    }
}

/// Iterative `*`/`?` glob match over byte strings.
pub fn wildcard_match(text: &str, pattern: &str) -> bool {
    let t = text.as_bytes();
    let p = pattern.as_bytes();
    let (mut ti, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            ti += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Retry: let the last star absorb one more character.
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// A 3-character TS6 server id: `[0-9][0-9A-Z][0-9A-Z]` is the strict
/// form; we accept any three uppercase alphanumerics as peers do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(String);

impl ServerId {
    pub fn parse(raw: &str) -> Result<Self, IdentError> {
        let ok = raw.len() == 3
            && raw
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase());
        if !ok {
            return Err(IdentError::BadServerId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 9-character TS6 user id: SID + 6 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid(String);

impl Uid {
    pub fn parse(raw: &str) -> Result<Self, IdentError> {
        if raw.len() != 9 {
            return Err(IdentError::BadUid(raw.to_string()));
        }
        ServerId::parse(&raw[..3]).map_err(|_| IdentError::BadUid(raw.to_string()))?;
        Ok(Self(raw.to_string()))
    }

    /// The SID of the server hosting this user.
    pub fn sid(&self) -> ServerId {
        ServerId(self.0[..3].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_validation() {
        assert!(Nickname::parse("alice").is_ok());
        assert!(Nickname::parse("[away]`_^").is_ok());
        assert!(Nickname::parse("a-b-c").is_ok());
        assert!(Nickname::parse("9abc").is_err(), "leading digit");
        assert!(Nickname::parse("a.b").is_err(), "dot");
        assert!(Nickname::parse("").is_err());
        assert!(Nickname::parse("-dash").is_err(), "leading dash");
    }

    #[test]
    fn nickname_length_boundary() {
        let thirty = "a".repeat(30);
        assert!(Nickname::parse(&thirty).is_ok());
        let thirty_one = "a".repeat(31);
        assert!(Nickname::parse(&thirty_one).is_err());
    }

    #[test]
    fn nickname_equality_is_ascii_folded() {
        let a = Nickname::parse("Nick[1]").unwrap();
        let b = Nickname::parse("NICK[1]").unwrap();
        assert_eq!(a, b);
        // ASCII only: the rfc1459 bracket pairs are distinct characters.
        let c = Nickname::parse("nick{1}").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn channel_validation() {
        assert!(ChannelName::parse("#lobby").is_ok());
        assert!(ChannelName::parse("&local").is_ok());
        assert!(ChannelName::parse("lobby").is_err());
        assert!(ChannelName::parse("#").is_err(), "too short");
        assert!(ChannelName::parse("#a b").is_err(), "space");
        assert!(ChannelName::parse("#a,b").is_err(), "comma");
        assert!(ChannelName::parse("#a\x07b").is_err(), "BEL");
    }

    #[test]
    fn channel_length_boundary() {
        let fifty = format!("#{}", "c".repeat(49));
        assert!(ChannelName::parse(&fifty).is_ok());
        let fifty_one = format!("#{}", "c".repeat(50));
        assert!(ChannelName::parse(&fifty_one).is_err());
    }

    #[test]
    fn hostmask_parse_forms() {
        let full = Hostmask::parse("alice!a@host.example");
        assert_eq!(full.nick, "alice");
        assert_eq!(full.user, "a");
        assert_eq!(full.host, "host.example");

        let bare = Hostmask::parse("alice");
        assert_eq!(bare.to_string(), "alice!*@*");

        let userhost = Hostmask::parse("a@host");
        assert_eq!(userhost.to_string(), "*!a@host");
    }

    #[test]
    fn wildcard_matching() {
        let hm = Hostmask::new("alice", "a", "bad.evil.example");
        assert!(!hm.matches("*!*@evil.example"));
        assert!(hm.matches("*!*@*.evil.example"));
        assert!(hm.matches("alice!*@*"));
        assert!(hm.matches("ALICE!?@*"));
        assert!(hm.matches("*"));
        assert!(!hm.matches("bob!*@*"));
    }

    #[test]
    fn wildcard_is_deterministic_and_bounded() {
        // A pathological pattern terminates quickly and matches nothing odd.
        let text = "a".repeat(64);
        let pattern = "*a".repeat(32);
        assert!(wildcard_match(&text, &pattern));
        assert!(!wildcard_match(&text, &format!("{}b", pattern)));
    }

    #[test]
    fn server_and_user_ids() {
        assert!(ServerId::parse("0AB").is_ok());
        assert!(ServerId::parse("0ab").is_err());
        assert!(ServerId::parse("ABCD").is_err());
        let uid = Uid::parse("0ABAAAAAB").unwrap();
        assert_eq!(uid.sid().as_str(), "0AB");
        assert!(Uid::parse("0ABAAAA").is_err());
    }
}
