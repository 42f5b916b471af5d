//! Per-connection registration state.
//!
//! The handshake phase machine:
//!
//! ```text
//! None → CapNegotiating? → (PassReceived?) → NickReceived → UserReceived → Registered
//! ```
//!
//! NICK and USER may arrive in either order; CAP negotiation, once opened,
//! blocks completion until CAP END; an in-flight SASL exchange does the
//! same. The connection loop enforces the registration timeout.

use lattice_proto::sasl::ChunkBuffer;
use std::collections::HashSet;
use std::time::Instant;

/// Where a SASL exchange currently stands.
#[derive(Debug, Default)]
pub enum SaslPhase {
    /// No exchange started or the previous one concluded.
    #[default]
    Idle,
    /// `AUTHENTICATE <mech>` accepted; waiting for payload chunks.
    AwaitingPayload {
        mechanism: String,
        buffer: ChunkBuffer,
    },
}

impl SaslPhase {
    pub fn in_flight(&self) -> bool {
        matches!(self, SaslPhase::AwaitingPayload { .. })
    }
}

/// Registration phases, for logging and tests. Derived from the session
/// fields rather than stored, so it can never disagree with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPhase {
    None,
    CapNegotiating,
    NickReceived,
    UserReceived,
    Registered,
}

/// Mutable per-connection session state, owned by the connection task.
#[derive(Debug)]
pub struct Session {
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    pub registered: bool,
    /// CAP LS/REQ seen without CAP END.
    pub cap_negotiating: bool,
    /// 301 or 302.
    pub cap_version: u32,
    /// Capabilities the client has enabled.
    pub caps: HashSet<String>,
    pub sasl: SaslPhase,
    /// Account bound by a completed SASL exchange.
    pub account: Option<String>,
    /// PASS argument, held until registration completes.
    pub pass: Option<String>,
    /// Transport-level security flag from the listener.
    pub secure: bool,
    /// Client certificate fingerprint from the transport, if any.
    pub certfp: Option<String>,
    pub last_activity: Instant,
    pub ping_pending: bool,
    pub ping_sent_at: Option<Instant>,
}

impl Session {
    pub fn new(secure: bool, certfp: Option<String>) -> Self {
        Self {
            nick: None,
            user: None,
            realname: None,
            registered: false,
            cap_negotiating: false,
            cap_version: 301,
            caps: HashSet::new(),
            sasl: SaslPhase::Idle,
            account: None,
            pass: None,
            secure,
            certfp,
            last_activity: Instant::now(),
            ping_pending: false,
            ping_sent_at: None,
        }
    }

    /// Both halves of the identity present, CAP closed, no SASL pending.
    pub fn can_register(&self) -> bool {
        self.nick.is_some()
            && self.user.is_some()
            && !self.registered
            && !self.cap_negotiating
            && !self.sasl.in_flight()
    }

    pub fn phase(&self) -> RegPhase {
        if self.registered {
            RegPhase::Registered
        } else if self.cap_negotiating {
            RegPhase::CapNegotiating
        } else if self.user.is_some() {
            RegPhase::UserReceived
        } else if self.nick.is_some() {
            RegPhase::NickReceived
        } else {
            RegPhase::None
        }
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.contains(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_progress() {
        let mut s = Session::new(false, None);
        assert_eq!(s.phase(), RegPhase::None);
        assert!(!s.can_register());

        s.nick = Some("alice".into());
        assert_eq!(s.phase(), RegPhase::NickReceived);
        assert!(!s.can_register());

        s.user = Some("a".into());
        assert_eq!(s.phase(), RegPhase::UserReceived);
        assert!(s.can_register());
    }

    #[test]
    fn cap_negotiation_blocks_registration() {
        let mut s = Session::new(false, None);
        s.nick = Some("alice".into());
        s.user = Some("a".into());
        s.cap_negotiating = true;
        assert_eq!(s.phase(), RegPhase::CapNegotiating);
        assert!(!s.can_register());
        s.cap_negotiating = false;
        assert!(s.can_register());
    }

    #[test]
    fn sasl_in_flight_blocks_registration() {
        let mut s = Session::new(false, None);
        s.nick = Some("alice".into());
        s.user = Some("a".into());
        s.sasl = SaslPhase::AwaitingPayload {
            mechanism: "PLAIN".into(),
            buffer: Default::default(),
        };
        assert!(!s.can_register());
    }

    #[test]
    fn user_before_nick_is_fine() {
        let mut s = Session::new(false, None);
        s.user = Some("a".into());
        s.nick = Some("alice".into());
        assert!(s.can_register());
    }
}
