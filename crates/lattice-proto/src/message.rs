//! IRC message type, wire parsing and serialization.
//!
//! One [`Message`] type serves both protocol variants. The grammar, per
//! RFC 1459 with the IRCv3 message-tags extension:
//!
//! ```text
//! ['@' <tags> SPACE] [':' <source> SPACE] <command> [params...] [':' trailing]
//! ```
//!
//! Parsing is strict about structure but lenient where the installed base
//! is: a lone LF terminates a line, runs of spaces collapse, and unknown
//! tag escapes decode leniently. Size limits are enforced by the caller
//! (the [`codec`](crate::codec) layer) for streams and by [`Message::parse_bytes`]
//! for one-shot input.

use crate::error::ParseError;
use crate::tags::{escape_tag_value, unescape_tag_value};
use crate::{MAX_LINE_LEN, MAX_TAGS_LEN};
use nom::{
    bytes::complete::{take_until, take_while1},
    character::complete::char,
    combinator::opt,
    sequence::preceded,
    IResult,
};
use std::fmt;
use std::str::FromStr;

/// A single message tag: key with optional value.
///
/// Order is preserved from the wire; keys are not deduplicated (last one
/// wins on lookup, matching the spec's "last occurrence" rule).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            key: key.into(),
            value: value.map(str::to_owned),
        }
    }
}

/// The source of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A server name, SID, or UID — anything without `!`/`@` structure.
    Name(String),
    /// A full `nick!user@host` client source.
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl Source {
    /// Parse a wire source string into its structured form.
    pub fn parse(raw: &str) -> Self {
        if let Some(bang) = raw.find('!') {
            if let Some(at) = raw[bang + 1..].find('@') {
                return Source::User {
                    nick: raw[..bang].to_string(),
                    user: raw[bang + 1..bang + 1 + at].to_string(),
                    host: raw[bang + 2 + at..].to_string(),
                };
            }
        }
        Source::Name(raw.to_string())
    }

    /// The nickname (or bare name) portion.
    pub fn name(&self) -> &str {
        match self {
            Source::Name(n) => n,
            Source::User { nick, .. } => nick,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Name(n) => f.write_str(n),
            Source::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 tags in wire order, values already unescaped.
    pub tags: Vec<Tag>,
    /// Message source, if any.
    pub source: Option<Source>,
    /// Command, normalized to uppercase.
    pub command: String,
    /// Parameters; the trailing parameter (if any) is the last element.
    pub params: Vec<String>,
}

fn scan_tags(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_until(" "))(input)
}

fn scan_source(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

fn scan_command(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric())(input)
}

fn skip_spaces(mut s: &str) -> &str {
    while s.as_bytes().first() == Some(&b' ') {
        s = &s[1..];
    }
    s
}

impl Message {
    /// Construct a message with no tags or source.
    pub fn cmd<S: Into<String>>(command: &str, params: impl IntoIterator<Item = S>) -> Self {
        Self {
            tags: Vec::new(),
            source: None,
            command: command.to_ascii_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach or replace a tag (builder style).
    pub fn with_tag(mut self, key: &str, value: Option<&str>) -> Self {
        self.tags.retain(|t| t.key != key);
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Attach a source (builder style).
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach a server-name source (builder style).
    pub fn from_server(self, server: &str) -> Self {
        self.with_source(Source::Name(server.to_string()))
    }

    /// Look up a tag value by key. Returns the last occurrence.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .rev()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// Parameter accessor.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// `PRIVMSG <target> :<text>`
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::cmd("PRIVMSG", [target, text])
    }

    /// `NOTICE <target> :<text>`
    pub fn notice(target: &str, text: &str) -> Self {
        Self::cmd("NOTICE", [target, text])
    }

    /// `PING :<token>`
    pub fn ping(token: &str) -> Self {
        Self::cmd("PING", [token])
    }

    /// `PONG <server> :<token>`
    pub fn pong(server: &str, token: &str) -> Self {
        Self::cmd("PONG", [server, token])
    }

    /// `ERROR :<reason>` — sent before closing a link or a client.
    pub fn irc_error(reason: &str) -> Self {
        Self::cmd("ERROR", [reason])
    }

    /// Parse from raw bytes, validating UTF-8 and both size budgets.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.contains(&0) {
            return Err(ParseError::EmbeddedNul);
        }
        let s = std::str::from_utf8(bytes)
            .map_err(|e| ParseError::InvalidUtf8(e.valid_up_to()))?;
        let (tag_len, legacy_len) = split_budget(s);
        if tag_len > MAX_TAGS_LEN {
            return Err(ParseError::TagsTooLong(tag_len));
        }
        if legacy_len > MAX_LINE_LEN {
            return Err(ParseError::LineTooLong(legacy_len));
        }
        s.parse()
    }

    /// Serialize to the wire form, without the trailing CRLF.
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

/// Split a raw line into (tag-section length, legacy length), where the tag
/// section includes the `@` and its terminating space.
fn split_budget(line: &str) -> (usize, usize) {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(rest) = line.strip_prefix('@') {
        if let Some(space) = rest.find(' ') {
            let tag_len = 1 + space + 1;
            return (tag_len, line.len() - tag_len);
        }
    }
    (0, line.len())
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::EmptyMessage);
        }

        // Tag section.
        let (rest, raw_tags) = if line.starts_with('@') {
            match scan_tags(line) {
                Ok((rest, tags)) => (rest, Some(tags)),
                Err(_) => return Err(ParseError::UnterminatedTags),
            }
        } else {
            (line, None)
        };
        let rest = skip_spaces(rest);

        // Source.
        let (rest, raw_source) = match opt(scan_source)(rest) {
            Ok((rest, src)) => (rest, src),
            Err(nom::Err::Incomplete(_)) | Err(_) => (rest, None),
        };
        let rest = skip_spaces(rest);

        // Command.
        let (rest, command) = match scan_command(rest) {
            Ok((rest, cmd)) => (rest, cmd),
            Err(_) if raw_source.is_some() => return Err(ParseError::MissingCommand),
            Err(_) => return Err(ParseError::EmptyMessage),
        };
        if !is_valid_command(command) {
            return Err(ParseError::InvalidCommand(command.to_string()));
        }

        // Parameters: space-separated words; ':' introduces the trailing
        // parameter which consumes the remainder verbatim.
        let mut params = Vec::new();
        let mut rest = rest;
        loop {
            rest = skip_spaces(rest);
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            let end = rest.find(' ').unwrap_or(rest.len());
            params.push(rest[..end].to_string());
            rest = &rest[end..];
        }

        let tags = raw_tags.map(parse_tag_section).unwrap_or_default();

        Ok(Message {
            tags,
            source: raw_source.map(Source::parse),
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

/// A command is a word of letters or exactly three digits.
fn is_valid_command(cmd: &str) -> bool {
    if cmd.chars().all(|c| c.is_ascii_alphabetic()) {
        return !cmd.is_empty();
    }
    cmd.len() == 3 && cmd.chars().all(|c| c.is_ascii_digit())
}

fn parse_tag_section(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => Tag {
                key: key.to_string(),
                // `key=` (empty value) is distinct from a valueless key on
                // the wire but decodes to a missing value per the spec.
                value: if value.is_empty() {
                    None
                } else {
                    Some(unescape_tag_value(value))
                },
            },
            None => Tag {
                key: part.to_string(),
                value: None,
            },
        })
        .collect()
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, tag) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(&tag.key)?;
                if let Some(value) = &tag.value {
                    write!(f, "={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(source) = &self.source {
            write!(f, ":{} ", source)?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.starts_with(':') || param.contains(' ')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_command() {
        let msg: Message = "PING".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert!(msg.tags.is_empty());
        assert!(msg.source.is_none());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parses_trailing() {
        let msg: Message = "PRIVMSG #lobby :hello there".parse().unwrap();
        assert_eq!(msg.params, vec!["#lobby", "hello there"]);
    }

    #[test]
    fn parses_empty_trailing() {
        let msg: Message = "TOPIC #lobby :".parse().unwrap();
        assert_eq!(msg.params, vec!["#lobby", ""]);
    }

    #[test]
    fn parses_user_source() {
        let msg: Message = ":alice!a@host.example JOIN #lobby".parse().unwrap();
        assert_eq!(
            msg.source,
            Some(Source::User {
                nick: "alice".into(),
                user: "a".into(),
                host: "host.example".into(),
            })
        );
    }

    #[test]
    fn parses_sid_source() {
        let msg: Message = ":0AB SJOIN 12345 #lobby +nt :@0ABAAAAAB".parse().unwrap();
        assert_eq!(msg.source, Some(Source::Name("0AB".into())));
        assert_eq!(msg.command, "SJOIN");
    }

    #[test]
    fn parses_tags_and_unescapes() {
        let msg: Message = "@label=x;time=2024-01-01T00:00:00.000Z;k=a\\sb PING :tok"
            .parse()
            .unwrap();
        assert_eq!(msg.tag("label"), Some("x"));
        assert_eq!(msg.tag("k"), Some("a b"));
    }

    #[test]
    fn valueless_and_empty_tags() {
        let msg: Message = "@draft/x;empty= PING".parse().unwrap();
        assert_eq!(msg.tags.len(), 2);
        assert_eq!(msg.tag("draft/x"), None);
        assert_eq!(msg.tag("empty"), None);
    }

    #[test]
    fn command_case_normalized() {
        let msg: Message = "privmsg #a :b".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn numeric_command() {
        let msg: Message = ":irc.example 001 alice :Welcome".parse().unwrap();
        assert_eq!(msg.command, "001");
    }

    #[test]
    fn rejects_empty_and_bad_commands() {
        assert_eq!("".parse::<Message>(), Err(ParseError::EmptyMessage));
        assert_eq!("   ".parse::<Message>(), Err(ParseError::EmptyMessage));
        assert!(matches!(
            "12 a".parse::<Message>(),
            Err(ParseError::InvalidCommand(_))
        ));
        assert_eq!(
            ":src.example".parse::<Message>(),
            Err(ParseError::MissingCommand)
        );
    }

    #[test]
    fn rejects_unterminated_tags() {
        assert_eq!(
            "@only-tags".parse::<Message>(),
            Err(ParseError::UnterminatedTags)
        );
    }

    #[test]
    fn rejects_nul_and_oversize() {
        assert_eq!(
            Message::parse_bytes(b"PING \0"),
            Err(ParseError::EmbeddedNul)
        );
        let long = format!("PRIVMSG #a :{}", "x".repeat(600));
        assert!(matches!(
            Message::parse_bytes(long.as_bytes()),
            Err(ParseError::LineTooLong(_))
        ));
    }

    #[test]
    fn boundary_512_accepted() {
        // Exactly 512 bytes of legacy line parses; 513 does not.
        let pad = MAX_LINE_LEN - "PRIVMSG #a :".len();
        let exact = format!("PRIVMSG #a :{}", "y".repeat(pad));
        assert_eq!(exact.len(), MAX_LINE_LEN);
        assert!(Message::parse_bytes(exact.as_bytes()).is_ok());
        let over = format!("PRIVMSG #a :{}", "y".repeat(pad + 1));
        assert!(Message::parse_bytes(over.as_bytes()).is_err());
    }

    #[test]
    fn tag_budget_separate_from_legacy() {
        let tags = format!("@k={} ", "v".repeat(500));
        let line = format!("{}PRIVMSG #a :hi", tags);
        assert!(Message::parse_bytes(line.as_bytes()).is_ok());
    }

    #[test]
    fn collapses_space_runs() {
        let msg: Message = "MODE   #lobby  +o   alice".parse().unwrap();
        assert_eq!(msg.params, vec!["#lobby", "+o", "alice"]);
    }

    #[test]
    fn serialize_round_trips() {
        let cases = [
            "PING",
            "PRIVMSG #lobby :hello there",
            ":alice!a@host.example JOIN #lobby",
            "@label=x :irc.example BATCH +abc labeled-response",
            "TOPIC #lobby :",
            ":0AB UID dave 1 100 +i a host 1.2.3.4 0ABAAAAAB * :Dave the Brave",
        ];
        for case in cases {
            let msg: Message = case.parse().unwrap();
            assert_eq!(msg.to_wire(), case, "round trip of {case:?}");
        }
    }

    #[test]
    fn serializer_quotes_trailing() {
        let msg = Message::cmd("PRIVMSG", ["#a", ":starts-with-colon"]);
        assert_eq!(msg.to_wire(), "PRIVMSG #a ::starts-with-colon");
        let reparsed: Message = msg.to_wire().parse().unwrap();
        assert_eq!(reparsed.params, vec!["#a", ":starts-with-colon"]);
    }
}
