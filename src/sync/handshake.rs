//! Peer link handshake state machine.
//!
//! Both directions exchange `PASS <password> TS 6 <sid>`, `CAPAB`, and
//! `SERVER <name> 1 :<description>`. The machine only collects and
//! verifies; the link driver owns the socket and the timers.
//!
//! ```text
//! Listening → PassExchanged → CapabExchanged → ServerExchanged → Bursting
//!           → Linked → Terminated
//! ```

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::state::ServerIdentity;
use lattice_proto::ident::ServerId;
use lattice_proto::Message;
use subtle::ConstantTimeEq;

/// Capabilities we advertise on a link.
pub const LINK_CAPABS: &[&str] = &["QS", "EX", "IE", "KLN", "UNKLN", "TB", "ENCAP", "HOPS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Listening,
    PassExchanged,
    CapabExchanged,
    ServerExchanged,
    Bursting,
    Linked,
    Terminated,
}

/// What one handshake step produced.
#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Still collecting.
    Progress,
    /// PASS, CAPAB, and SERVER all verified; time to burst.
    Complete,
}

#[derive(Debug)]
pub struct LinkHandshake {
    pub phase: LinkPhase,
    pub remote_pass: Option<String>,
    pub remote_capab: Vec<String>,
    pub remote_name: Option<String>,
    pub remote_sid: Option<ServerId>,
    pub remote_desc: Option<String>,
}

impl LinkHandshake {
    pub fn new() -> Self {
        Self {
            phase: LinkPhase::Listening,
            remote_pass: None,
            remote_capab: Vec::new(),
            remote_name: None,
            remote_sid: None,
            remote_desc: None,
        }
    }

    /// The three lines we open with.
    pub fn greeting(link: &LinkConfig, identity: &ServerIdentity) -> Vec<Message> {
        vec![
            Message::cmd(
                "PASS",
                [
                    link.send_password.as_str(),
                    "TS",
                    "6",
                    identity.sid.as_str(),
                ],
            ),
            Message::cmd("CAPAB", [LINK_CAPABS.join(" ")]),
            Message::cmd(
                "SERVER",
                [
                    identity.name.as_str(),
                    "1",
                    identity.description.as_str(),
                ],
            ),
        ]
    }

    /// Feed one handshake message. `links` is the configured link table;
    /// verification runs once all three lines are in.
    pub fn step(
        &mut self,
        msg: &Message,
        links: &[LinkConfig],
    ) -> Result<StepOutcome, LinkError> {
        if self.phase == LinkPhase::Terminated {
            return Err(LinkError::UnexpectedCommand(msg.command.clone()));
        }
        match msg.command.as_str() {
            "PASS" => {
                self.remote_pass = msg.arg(0).map(str::to_string);
                if let Some(sid_raw) = msg.arg(3) {
                    self.remote_sid = Some(
                        ServerId::parse(sid_raw).map_err(|_| LinkError::Malformed("PASS"))?,
                    );
                }
                self.phase = LinkPhase::PassExchanged;
            }
            "CAPAB" => {
                self.remote_capab = msg
                    .arg(0)
                    .map(|caps| caps.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                self.phase = LinkPhase::CapabExchanged;
            }
            "SERVER" => {
                let name = msg.arg(0).ok_or(LinkError::Malformed("SERVER"))?;
                if !name.contains('.') {
                    return Err(LinkError::Malformed("SERVER"));
                }
                self.remote_name = Some(name.to_string());
                self.remote_desc = msg.arg(2).map(str::to_string);
                self.phase = LinkPhase::ServerExchanged;
            }
            "ERROR" => {
                self.phase = LinkPhase::Terminated;
                return Err(LinkError::PeerError(
                    msg.arg(0).unwrap_or("no reason").to_string(),
                ));
            }
            other => return Err(LinkError::UnexpectedCommand(other.to_string())),
        }

        if self.remote_pass.is_some() && self.remote_name.is_some() && self.remote_sid.is_some()
        {
            self.verify(links)?;
            self.phase = LinkPhase::Bursting;
            return Ok(StepOutcome::Complete);
        }
        Ok(StepOutcome::Progress)
    }

    /// The link block for the peer, once verified.
    pub fn link_config<'a>(&self, links: &'a [LinkConfig]) -> Option<&'a LinkConfig> {
        let name = self.remote_name.as_deref()?;
        links.iter().find(|l| l.name == name)
    }

    fn verify(&self, links: &[LinkConfig]) -> Result<(), LinkError> {
        let name = self
            .remote_name
            .as_deref()
            .ok_or(LinkError::Malformed("SERVER"))?;
        let link = links
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| LinkError::UnknownServer(name.to_string()))?;
        let pass = self
            .remote_pass
            .as_deref()
            .ok_or(LinkError::PasswordMismatch)?;
        if !bool::from(pass.as_bytes().ct_eq(link.receive_password.as_bytes())) {
            return Err(LinkError::PasswordMismatch);
        }
        Ok(())
    }
}

impl Default for LinkHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links() -> Vec<LinkConfig> {
        vec![LinkConfig {
            name: "peer.lattice.test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7000,
            send_password: "out-secret".to_string(),
            receive_password: "in-secret".to_string(),
            auto_connect: false,
            use_tls: false,
            certificate_fingerprint: None,
        }]
    }

    fn pass(password: &str) -> Message {
        Message::cmd("PASS", [password, "TS", "6", "9ZZ"])
    }

    #[test]
    fn full_exchange_completes() {
        let mut hs = LinkHandshake::new();
        assert_eq!(
            hs.step(&pass("in-secret"), &links()).unwrap(),
            StepOutcome::Progress
        );
        assert_eq!(hs.phase, LinkPhase::PassExchanged);

        assert_eq!(
            hs.step(&Message::cmd("CAPAB", ["QS EX IE"]), &links()).unwrap(),
            StepOutcome::Progress
        );
        assert_eq!(hs.phase, LinkPhase::CapabExchanged);

        let server = Message::cmd("SERVER", ["peer.lattice.test", "1", "A peer"]);
        assert_eq!(hs.step(&server, &links()).unwrap(), StepOutcome::Complete);
        assert_eq!(hs.phase, LinkPhase::Bursting);
        assert_eq!(hs.remote_sid.as_ref().unwrap().as_str(), "9ZZ");
        assert_eq!(hs.remote_capab, vec!["QS", "EX", "IE"]);
    }

    #[test]
    fn password_mismatch_rejected() {
        let mut hs = LinkHandshake::new();
        hs.step(&pass("wrong"), &links()).unwrap();
        hs.step(&Message::cmd("CAPAB", ["QS"]), &links()).unwrap();
        let server = Message::cmd("SERVER", ["peer.lattice.test", "1", "A peer"]);
        assert!(matches!(
            hs.step(&server, &links()),
            Err(LinkError::PasswordMismatch)
        ));
    }

    #[test]
    fn unknown_server_rejected() {
        let mut hs = LinkHandshake::new();
        hs.step(&pass("in-secret"), &links()).unwrap();
        let server = Message::cmd("SERVER", ["rogue.lattice.test", "1", "?"]);
        assert!(matches!(
            hs.step(&server, &links()),
            Err(LinkError::UnknownServer(_))
        ));
    }

    #[test]
    fn error_terminates() {
        let mut hs = LinkHandshake::new();
        let error = Message::cmd("ERROR", ["Closing Link: nope"]);
        assert!(matches!(
            hs.step(&error, &links()),
            Err(LinkError::PeerError(_))
        ));
        assert_eq!(hs.phase, LinkPhase::Terminated);
    }

    #[test]
    fn ordinary_traffic_rejected_during_handshake() {
        let mut hs = LinkHandshake::new();
        let msg = Message::cmd("PRIVMSG", ["#x", "hi"]);
        assert!(matches!(
            hs.step(&msg, &links()),
            Err(LinkError::UnexpectedCommand(_))
        ));
    }
}
