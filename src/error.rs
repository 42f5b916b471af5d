//! Daemon error taxonomy.
//!
//! Handlers signal protocol outcomes by returning structured errors; the
//! dispatcher translates them into numeric replies. Only a handful of
//! variants are fatal to the connection — everything else leaves the
//! session running.

use lattice_proto::Message;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by command handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Translated to 461 by the dispatcher.
    #[error("not enough parameters")]
    NeedMoreParams,

    /// Translated to 451.
    #[error("you have not registered")]
    NotRegistered,

    /// Translated to 481.
    #[error("permission denied - you're not an IRC operator")]
    NoPrivileges,

    /// Translated to 412.
    #[error("no text to send")]
    NoTextToSend,

    /// Command dropped by the per-connection token bucket. Not an error
    /// reply; the connection loop counts these toward the flood threshold.
    #[error("rate limited")]
    RateLimited,

    /// The client asked to leave; the payload is the quit reason.
    #[error("client quit")]
    Quit(Option<String>),

    /// Fatal: the connection must be closed (ERROR line already queued).
    #[error("access denied")]
    AccessDenied,

    /// Outbound queue to this client has gone away.
    #[error("send error: {0}")]
    Send(#[from] mpsc::error::SendError<std::sync::Arc<Message>>),

    /// A bug or an unavailable collaborator (e.g. the account store).
    /// Logged at error level; the connection survives.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Errors on a server-to-server link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("password mismatch")]
    PasswordMismatch,

    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("unexpected command during handshake: {0}")]
    UnexpectedCommand(String),

    #[error("handshake timeout")]
    HandshakeTimeout,

    #[error("peer sent ERROR: {0}")]
    PeerError(String),

    #[error("malformed {0} from peer")]
    Malformed(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
