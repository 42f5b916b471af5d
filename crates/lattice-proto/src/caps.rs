//! IRCv3 capability identifiers.

use std::fmt;

/// A capability this server can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Capability {
    MessageTags,
    ServerTime,
    AccountTag,
    AccountNotify,
    AwayNotify,
    Chghost,
    InviteNotify,
    ExtendedJoin,
    MultiPrefix,
    UserhostInNames,
    CapNotify,
    EchoMessage,
    Batch,
    LabeledResponse,
    Sasl,
    Chathistory,
}

/// Every capability the server publishes in `CAP LS`.
pub const SERVER_CAPABILITIES: &[Capability] = &[
    Capability::MessageTags,
    Capability::ServerTime,
    Capability::AccountTag,
    Capability::AccountNotify,
    Capability::AwayNotify,
    Capability::Chghost,
    Capability::InviteNotify,
    Capability::ExtendedJoin,
    Capability::MultiPrefix,
    Capability::UserhostInNames,
    Capability::CapNotify,
    Capability::EchoMessage,
    Capability::Batch,
    Capability::LabeledResponse,
    Capability::Sasl,
    Capability::Chathistory,
];

impl Capability {
    /// The wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::MessageTags => "message-tags",
            Capability::ServerTime => "server-time",
            Capability::AccountTag => "account-tag",
            Capability::AccountNotify => "account-notify",
            Capability::AwayNotify => "away-notify",
            Capability::Chghost => "chghost",
            Capability::InviteNotify => "invite-notify",
            Capability::ExtendedJoin => "extended-join",
            Capability::MultiPrefix => "multi-prefix",
            Capability::UserhostInNames => "userhost-in-names",
            Capability::CapNotify => "cap-notify",
            Capability::EchoMessage => "echo-message",
            Capability::Batch => "batch",
            Capability::LabeledResponse => "labeled-response",
            Capability::Sasl => "sasl",
            Capability::Chathistory => "draft/chathistory",
        }
    }

    /// Look up a capability by its wire identifier.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        SERVER_CAPABILITIES.iter().copied().find(|c| c.as_str() == s)
    }

    /// The `CAP LS 302` value suffix, if the capability advertises one.
    pub fn ls_value(self, sasl_mechs: &[&str]) -> Option<String> {
        match self {
            Capability::Sasl if !sasl_mechs.is_empty() => Some(sasl_mechs.join(",")),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_identifiers() {
        for cap in SERVER_CAPABILITIES {
            assert_eq!(Capability::from_str_opt(cap.as_str()), Some(*cap));
        }
    }

    #[test]
    fn sasl_advertises_mechanisms() {
        assert_eq!(
            Capability::Sasl.ls_value(&["PLAIN", "EXTERNAL"]),
            Some("PLAIN,EXTERNAL".to_string())
        );
        assert_eq!(Capability::ServerTime.ls_value(&["PLAIN"]), None);
    }
}
