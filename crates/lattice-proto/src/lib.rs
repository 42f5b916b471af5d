//! # lattice-proto
//!
//! Wire protocol library for the Lattice IRC daemon.
//!
//! This crate owns everything that can be specified without reference to
//! server state: message framing and parsing (including IRCv3 message tags),
//! validated identity types (nicknames, channel names, hostmasks, server
//! ids), numeric replies, mode tables, capability identifiers, and SASL
//! payload handling.
//!
//! The same framer and [`Message`] type serve both the client protocol and
//! the TS6-style server-to-server protocol; the only difference is what the
//! source of a message means (`nick!user@host` vs. a SID or UID).
//!
//! ## Parsing
//!
//! ```rust
//! use lattice_proto::Message;
//!
//! let msg: Message = "@label=abc :nick!u@h PRIVMSG #rust :hello".parse().unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.params, vec!["#rust", "hello"]);
//! assert_eq!(msg.tag("label"), Some("abc"));
//! ```

pub mod caps;
pub mod casemap;
#[cfg(feature = "tokio")]
pub mod codec;
pub mod error;
pub mod ident;
pub mod message;
pub mod modes;
pub mod response;
pub mod sasl;
pub mod tags;

pub use self::caps::{Capability, SERVER_CAPABILITIES};
pub use self::casemap::{irc_eq, irc_to_lower};
#[cfg(feature = "tokio")]
pub use self::codec::LineCodec;
pub use self::error::ParseError;
pub use self::ident::{ChannelName, Hostmask, Nickname, ServerId, Uid};
pub use self::message::{Message, Source, Tag};
pub use self::modes::{
    ChannelModes, MemberModes, MemberRank, ModeArgKind, ModeChange, UserModes,
};
pub use self::response::Response;

/// Maximum length of the legacy portion of a line, excluding CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum length of the `@tags ` prefix, including the `@` and the
/// trailing space, per the IRCv3 message-tags specification.
pub const MAX_TAGS_LEN: usize = 8191;
