//! Mode bitsets and the mode-character tables.
//!
//! Channel, member, and user modes are bitsets behind newtypes. The tables
//! in this module are the single source of truth: the `MODE` parser, the
//! mode formatter, the NAMES prefix logic, and the ISUPPORT `PREFIX=` /
//! `CHANMODES=` tokens are all derived from them.

use std::fmt;

// ============================================================================
// User modes
// ============================================================================

/// User mode bitset (`+iwoZRB`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes(u16);

const USER_MODE_TABLE: &[(char, u16)] = &[
    ('i', 1 << 0), // invisible
    ('w', 1 << 1), // receives WALLOPS
    ('o', 1 << 2), // network operator
    ('r', 1 << 3), // identified to an account
    ('Z', 1 << 4), // TLS connection
    ('R', 1 << 5), // only registered users may PM
    ('B', 1 << 6), // marked as a bot
];

impl UserModes {
    pub const INVISIBLE: char = 'i';
    pub const WALLOPS: char = 'w';
    pub const OPER: char = 'o';
    pub const REGISTERED: char = 'r';
    pub const SECURE: char = 'Z';
    pub const REGISTERED_ONLY: char = 'R';
    pub const BOT: char = 'B';

    fn bit(mode: char) -> Option<u16> {
        USER_MODE_TABLE
            .iter()
            .find(|(c, _)| *c == mode)
            .map(|(_, b)| *b)
    }

    /// Test a mode character. Unknown characters are never set.
    pub fn has(self, mode: char) -> bool {
        Self::bit(mode).is_some_and(|b| self.0 & b != 0)
    }

    /// Set or clear a mode character. Returns false for unknown modes.
    pub fn set(&mut self, mode: char, on: bool) -> bool {
        match Self::bit(mode) {
            Some(b) => {
                if on {
                    self.0 |= b;
                } else {
                    self.0 &= !b;
                }
                true
            }
            None => false,
        }
    }

    /// All supported user mode characters, for ISUPPORT / 004.
    pub fn supported() -> String {
        USER_MODE_TABLE.iter().map(|(c, _)| *c).collect()
    }
}

impl fmt::Display for UserModes {
    /// Format as `+iw`; a bare `+` when no modes are set.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("+")?;
        for (c, b) in USER_MODE_TABLE {
            if self.0 & b != 0 {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Member ranks (channel membership prefixes)
// ============================================================================

/// Channel membership rank, in strict dominance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MemberRank {
    #[default]
    None,
    Voice,
    HalfOp,
    Op,
    Admin,
    Owner,
}

/// `(rank, mode char, prefix sigil)`, highest first. The ISUPPORT
/// `PREFIX=(qaohv)~&@%+` token is derived from this table.
const RANK_TABLE: &[(MemberRank, char, char)] = &[
    (MemberRank::Owner, 'q', '~'),
    (MemberRank::Admin, 'a', '&'),
    (MemberRank::Op, 'o', '@'),
    (MemberRank::HalfOp, 'h', '%'),
    (MemberRank::Voice, 'v', '+'),
];

impl MemberRank {
    pub fn from_mode_char(c: char) -> Option<Self> {
        RANK_TABLE.iter().find(|(_, m, _)| *m == c).map(|(r, _, _)| *r)
    }

    pub fn from_prefix_char(c: char) -> Option<Self> {
        RANK_TABLE.iter().find(|(_, _, p)| *p == c).map(|(r, _, _)| *r)
    }

    pub fn prefix_char(self) -> Option<char> {
        RANK_TABLE.iter().find(|(r, _, _)| *r == self).map(|(_, _, p)| *p)
    }

    pub fn mode_char(self) -> Option<char> {
        RANK_TABLE.iter().find(|(r, _, _)| *r == self).map(|(_, m, _)| *m)
    }

    /// The ISUPPORT PREFIX token.
    pub fn isupport_prefix() -> String {
        let modes: String = RANK_TABLE.iter().map(|(_, m, _)| *m).collect();
        let prefixes: String = RANK_TABLE.iter().map(|(_, _, p)| *p).collect();
        format!("({}){}", modes, prefixes)
    }
}

/// A member's full rank set. A member may hold several ranks at once
/// (e.g. `+ov`); the highest one is publicly advertised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberModes(u8);

impl MemberModes {
    fn bit(rank: MemberRank) -> u8 {
        match rank {
            MemberRank::None => 0,
            MemberRank::Voice => 1 << 0,
            MemberRank::HalfOp => 1 << 1,
            MemberRank::Op => 1 << 2,
            MemberRank::Admin => 1 << 3,
            MemberRank::Owner => 1 << 4,
        }
    }

    pub fn with(rank: MemberRank) -> Self {
        let mut m = Self::default();
        m.grant(rank);
        m
    }

    pub fn grant(&mut self, rank: MemberRank) {
        self.0 |= Self::bit(rank);
    }

    pub fn revoke(&mut self, rank: MemberRank) {
        self.0 &= !Self::bit(rank);
    }

    pub fn holds(self, rank: MemberRank) -> bool {
        rank != MemberRank::None && self.0 & Self::bit(rank) != 0
    }

    /// The highest rank held.
    pub fn highest(self) -> MemberRank {
        for (rank, _, _) in RANK_TABLE {
            if self.holds(*rank) {
                return *rank;
            }
        }
        MemberRank::None
    }

    /// Dominance test against a floor: `at_least(HalfOp)` is the "HalfOp+"
    /// check used by TOPIC/KICK/MODE authorization.
    pub fn at_least(self, floor: MemberRank) -> bool {
        self.highest() >= floor
    }

    /// Highest prefix sigil, if any.
    pub fn prefix_char(self) -> Option<char> {
        self.highest().prefix_char()
    }

    /// All prefix sigils, highest first — for `multi-prefix` clients.
    pub fn all_prefix_chars(self) -> String {
        RANK_TABLE
            .iter()
            .filter(|(r, _, _)| self.holds(*r))
            .map(|(_, _, p)| *p)
            .collect()
    }
}

// ============================================================================
// Channel modes
// ============================================================================

/// Channel mode bitset for the flag (Type D) modes, plus the mode-character
/// table for every type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelModes(u16);

const CHANNEL_FLAG_TABLE: &[(char, u16)] = &[
    ('n', 1 << 0), // no external messages
    ('t', 1 << 1), // topic settable by halfop+ only
    ('i', 1 << 2), // invite only
    ('m', 1 << 3), // moderated
    ('s', 1 << 4), // secret
    ('p', 1 << 5), // private
    ('R', 1 << 6), // registered users only
    ('c', 1 << 7), // strip color codes
    ('C', 1 << 8), // block CTCP (except ACTION)
    ('S', 1 << 9), // strip all formatting
];

/// How a channel mode consumes its argument, per RFC 2812 CHANMODES types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArgKind {
    /// Type A: list modes (`b`, `e`, `I`) — always take a mask argument
    /// when modifying; a bare query lists.
    List,
    /// Type B: always take a parameter (`k`, and the member rank modes).
    AlwaysParam,
    /// Type C: parameter only when setting (`l`).
    ParamWhenSet,
    /// Type D: never a parameter (the flag table above).
    Flag,
}

/// Classify a channel mode character. Unknown characters return `None`
/// (the dispatcher answers 472).
pub fn channel_mode_kind(c: char) -> Option<ModeArgKind> {
    if matches!(c, 'b' | 'e' | 'I') {
        return Some(ModeArgKind::List);
    }
    if c == 'k' || MemberRank::from_mode_char(c).is_some() {
        return Some(ModeArgKind::AlwaysParam);
    }
    if c == 'l' {
        return Some(ModeArgKind::ParamWhenSet);
    }
    if CHANNEL_FLAG_TABLE.iter().any(|(fc, _)| *fc == c) {
        return Some(ModeArgKind::Flag);
    }
    None
}

/// The ISUPPORT `CHANMODES=` token, derived from the tables.
pub fn isupport_chanmodes() -> String {
    let flags: String = CHANNEL_FLAG_TABLE.iter().map(|(c, _)| *c).collect();
    format!("beI,k,l,{}", flags)
}

impl ChannelModes {
    pub const NO_EXTERNAL: char = 'n';
    pub const TOPIC_LOCK: char = 't';
    pub const INVITE_ONLY: char = 'i';
    pub const MODERATED: char = 'm';
    pub const SECRET: char = 's';
    pub const REGISTERED_ONLY: char = 'R';
    pub const STRIP_COLOR: char = 'c';
    pub const BLOCK_CTCP: char = 'C';
    pub const STRIP_FORMAT: char = 'S';

    fn bit(mode: char) -> Option<u16> {
        CHANNEL_FLAG_TABLE
            .iter()
            .find(|(c, _)| *c == mode)
            .map(|(_, b)| *b)
    }

    /// The `+nt` default applied at channel creation.
    pub fn defaults() -> Self {
        let mut m = Self::default();
        m.set('n', true);
        m.set('t', true);
        m
    }

    pub fn has(self, mode: char) -> bool {
        Self::bit(mode).is_some_and(|b| self.0 & b != 0)
    }

    pub fn set(&mut self, mode: char, on: bool) -> bool {
        match Self::bit(mode) {
            Some(b) => {
                if on {
                    self.0 |= b;
                } else {
                    self.0 &= !b;
                }
                true
            }
            None => false,
        }
    }
}

impl fmt::Display for ChannelModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("+")?;
        for (c, b) in CHANNEL_FLAG_TABLE {
            if self.0 & b != 0 {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Mode change parsing
// ============================================================================

/// One `±mode [arg]` item from a MODE command, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub adding: bool,
    pub mode: char,
    pub arg: Option<String>,
}

/// Parse a channel mode string plus its argument words into ordered
/// [`ModeChange`] items. Arguments are consumed per mode type; modes whose
/// required argument is missing are dropped; unknown mode characters are
/// kept (with `arg: None`) so the caller can answer 472 in order.
pub fn parse_channel_modes<S: AsRef<str>>(modestring: &str, args: &[S]) -> Vec<ModeChange> {
    let mut out = Vec::new();
    let mut adding = true;
    let mut next_arg = 0usize;
    let mut take = |next_arg: &mut usize| -> Option<String> {
        let a = args.get(*next_arg).map(|s| s.as_ref().to_string());
        if a.is_some() {
            *next_arg += 1;
        }
        a
    };

    for c in modestring.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            _ => {
                let arg = match channel_mode_kind(c) {
                    Some(ModeArgKind::List) | Some(ModeArgKind::AlwaysParam) => {
                        take(&mut next_arg)
                    }
                    Some(ModeArgKind::ParamWhenSet) if adding => take(&mut next_arg),
                    _ => None,
                };
                // A list mode with no argument is a list query, which is
                // legal; other param modes without their argument are not.
                let needs_arg = matches!(
                    channel_mode_kind(c),
                    Some(ModeArgKind::AlwaysParam)
                ) || (adding && channel_mode_kind(c) == Some(ModeArgKind::ParamWhenSet));
                if needs_arg && arg.is_none() {
                    continue;
                }
                out.push(ModeChange {
                    adding,
                    mode: c,
                    arg,
                });
            }
        }
    }
    out
}
