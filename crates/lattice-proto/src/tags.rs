//! IRCv3 message tag value escaping.

/// Escape a tag value for the wire.
///
/// Per the message-tags spec: `;` → `\:`, space → `\s`, `\` → `\\`,
/// CR → `\r`, LF → `\n`.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_tag_value`].
///
/// An unknown escape sequence drops the backslash and keeps the character;
/// a trailing lone backslash is dropped. Both behaviors follow the spec's
/// lenient decoding rules.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let raw = "a; b\\c\r\n";
        assert_eq!(unescape_tag_value(&escape_tag_value(raw)), raw);
    }

    #[test]
    fn escaped_forms() {
        assert_eq!(escape_tag_value("a;b c"), "a\\:b\\sc");
    }

    #[test]
    fn lenient_unknown_escape() {
        assert_eq!(unescape_tag_value("\\x"), "x");
        assert_eq!(unescape_tag_value("trailing\\"), "trailing");
    }
}
