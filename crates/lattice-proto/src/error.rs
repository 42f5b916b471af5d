//! Parse error taxonomy.
//!
//! `parse` never panics on malformed input; it returns a [`ParseError`]
//! with a specific kind so the caller can decide whether to reply with a
//! numeric, drop the line, or disconnect (only oversized lines warrant the
//! latter).

use thiserror::Error;

/// Errors produced by the wire parser.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The line contained no command at all.
    #[error("empty message")]
    EmptyMessage,

    /// A `@` tag section was present but never terminated by a space.
    #[error("unterminated tag section")]
    UnterminatedTags,

    /// The tag section exceeded the 8191-byte IRCv3 budget.
    #[error("tag section too long: {0} bytes")]
    TagsTooLong(usize),

    /// The legacy portion of the line exceeded 512 bytes.
    #[error("line too long: {0} bytes")]
    LineTooLong(usize),

    /// A source (`:prefix`) was present but the command after it was missing.
    #[error("missing command after source")]
    MissingCommand,

    /// The command contained characters outside `[A-Za-z]` / `[0-9]{3}`.
    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    /// The line contained a NUL byte, which is never legal on the wire.
    #[error("embedded NUL byte")]
    EmbeddedNul,

    /// The bytes were not valid UTF-8.
    #[error("invalid utf-8 at byte {0}")]
    InvalidUtf8(usize),
}

/// Errors produced by the identity value types at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum IdentError {
    /// Nickname failed validation (charset, leading digit, dot, length).
    #[error("erroneous nickname: {0:?}")]
    BadNickname(String),

    /// Channel name failed validation (prefix, length, forbidden bytes).
    #[error("bad channel name: {0:?}")]
    BadChannelName(String),

    /// SID was not three uppercase alphanumeric characters.
    #[error("bad server id: {0:?}")]
    BadServerId(String),

    /// UID was not `SID + 6` characters.
    #[error("bad user id: {0:?}")]
    BadUid(String),
}
