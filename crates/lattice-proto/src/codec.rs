//! Tokio codec for CRLF-framed IRC lines.
//!
//! Decoding splits on LF (tolerating a bare LF per RFC leniency), strips
//! the optional CR, and enforces both size budgets before handing bytes to
//! the parser: 512 bytes for the legacy portion and 8191 bytes for the
//! `@tags ` prefix. An oversized line yields a [`ParseError`] for that
//! frame only; the stream stays usable so the caller can answer with a
//! protocol error and keep or drop the connection as policy dictates.

use crate::error::ParseError;
use crate::message::Message;
use crate::{MAX_LINE_LEN, MAX_TAGS_LEN};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Hard ceiling on buffered bytes before we give up on ever seeing a LF.
/// Tag budget + legacy budget + CRLF.
const MAX_FRAME_LEN: usize = MAX_TAGS_LEN + MAX_LINE_LEN + 2;

/// Framing codec: `Decoder` yields `Result<Message, ParseError>` per line
/// so a single bad line does not poison the stream; `Encoder` appends CRLF.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Set when the current frame already overflowed and is being skipped
    /// to the next LF.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = Result<Message, ParseError>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discarding {
                match src.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                        return Ok(Some(Err(ParseError::LineTooLong(pos))));
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
            }

            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_LEN {
                    self.discarding = true;
                    continue;
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos + 1);
            // Strip LF and optional CR.
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                // Empty lines between messages are silently skipped.
                continue;
            }
            return Ok(Some(Message::parse_bytes(&line)));
        }
    }
}

impl Encoder<&Message> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = msg.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> Vec<Result<Message, ParseError>> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn frames_crlf_and_bare_lf() {
        let mut codec = LineCodec::new();
        let items = decode_all(&mut codec, b"PING :a\r\nPING :b\nPING :c\r\n");
        assert_eq!(items.len(), 3);
        for item in items {
            assert!(item.is_ok());
        }
    }

    #[test]
    fn partial_line_waits() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"PRIVMSG #a :incompl"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"ete\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(msg.params[1], "incomplete");
    }

    #[test]
    fn oversize_line_reported_not_fatal() {
        let mut codec = LineCodec::new();
        let long = format!("PRIVMSG #a :{}\r\nPING :ok\r\n", "z".repeat(600));
        let items = decode_all(&mut codec, long.as_bytes());
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert!(items[1].is_ok());
    }

    #[test]
    fn runaway_frame_discarded_to_next_lf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_FRAME_LEN + 100]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"tail\nPING :ok\r\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.command, "PING");
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(&Message::privmsg("#a", "hi there"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PRIVMSG #a :hi there\r\n");
    }
}
