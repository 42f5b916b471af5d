//! SASL payload handling.
//!
//! The server side of `AUTHENTICATE`: reassembling the base64 chunk
//! stream (400 bytes per line, `+` for an empty or final chunk) and
//! splitting the PLAIN credential payload.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use thiserror::Error;

/// Maximum length of one `AUTHENTICATE` argument line.
pub const MAX_CHUNK_LEN: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SaslError {
    #[error("chunk longer than {MAX_CHUNK_LEN} bytes")]
    ChunkTooLong,
    #[error("invalid base64 payload")]
    BadBase64,
    #[error("malformed PLAIN payload")]
    BadPlainPayload,
}

/// Accumulates `AUTHENTICATE` chunks until the payload is complete.
///
/// A line of exactly 400 bytes signals continuation; anything shorter
/// (including a bare `+`) terminates the payload.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    encoded: String,
}

impl ChunkBuffer {
    /// Feed one argument line. Returns `Some(decoded)` once the payload is
    /// complete, `None` while more chunks are expected.
    pub fn push(&mut self, line: &str) -> Result<Option<Vec<u8>>, SaslError> {
        if line.len() > MAX_CHUNK_LEN {
            return Err(SaslError::ChunkTooLong);
        }
        if line != "+" {
            self.encoded.push_str(line);
        }
        if line.len() == MAX_CHUNK_LEN {
            return Ok(None);
        }
        let decoded = B64
            .decode(std::mem::take(&mut self.encoded))
            .map_err(|_| SaslError::BadBase64)?;
        Ok(Some(decoded))
    }
}

/// Decoded `PLAIN` credentials: `[authzid] \0 authcid \0 password`.
#[derive(Debug, PartialEq, Eq)]
pub struct PlainCredentials {
    pub authzid: Option<String>,
    pub authcid: String,
    pub password: String,
}

impl PlainCredentials {
    pub fn parse(payload: &[u8]) -> Result<Self, SaslError> {
        let mut parts = payload.split(|b| *b == 0);
        let authzid = parts.next().ok_or(SaslError::BadPlainPayload)?;
        let authcid = parts.next().ok_or(SaslError::BadPlainPayload)?;
        let password = parts.next().ok_or(SaslError::BadPlainPayload)?;
        if parts.next().is_some() || authcid.is_empty() {
            return Err(SaslError::BadPlainPayload);
        }
        let to_string = |b: &[u8]| {
            String::from_utf8(b.to_vec()).map_err(|_| SaslError::BadPlainPayload)
        };
        Ok(Self {
            authzid: if authzid.is_empty() {
                None
            } else {
                Some(to_string(authzid)?)
            },
            authcid: to_string(authcid)?,
            password: to_string(password)?,
        })
    }
}

/// Encode a server-to-client payload as `AUTHENTICATE` chunk lines.
pub fn encode_chunks(payload: &[u8]) -> Vec<String> {
    if payload.is_empty() {
        return vec!["+".to_string()];
    }
    let encoded = B64.encode(payload);
    let mut out: Vec<String> = encoded
        .as_bytes()
        .chunks(MAX_CHUNK_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    // A full final chunk needs an explicit empty terminator.
    if encoded.len() % MAX_CHUNK_LEN == 0 {
        out.push("+".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_with_authzid() {
        let creds = PlainCredentials::parse(b"admin\0alice\0pw").unwrap();
        assert_eq!(creds.authzid.as_deref(), Some("admin"));
        assert_eq!(creds.authcid, "alice");
        assert_eq!(creds.password, "pw");
    }

    #[test]
    fn plain_payload_without_authzid() {
        let creds = PlainCredentials::parse(b"\0alice\0pw").unwrap();
        assert_eq!(creds.authzid, None);
        assert_eq!(creds.authcid, "alice");
    }

    #[test]
    fn plain_payload_malformed() {
        assert!(PlainCredentials::parse(b"alice").is_err());
        assert!(PlainCredentials::parse(b"\0\0pw").is_err(), "empty authcid");
        assert!(PlainCredentials::parse(b"a\0b\0c\0d").is_err(), "extra NUL");
    }

    #[test]
    fn single_chunk_completes() {
        let mut buf = ChunkBuffer::default();
        let encoded = B64.encode(b"\0alice\0pw");
        let out = buf.push(&encoded).unwrap();
        assert_eq!(out, Some(b"\0alice\0pw".to_vec()));
    }

    #[test]
    fn plus_is_empty_payload() {
        let mut buf = ChunkBuffer::default();
        assert_eq!(buf.push("+").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn full_chunk_continues() {
        let mut buf = ChunkBuffer::default();
        let payload = vec![b'x'; 600];
        let chunks = encode_chunks(&payload);
        assert!(chunks.len() >= 2);
        let mut result = None;
        for chunk in &chunks {
            result = buf.push(chunk).unwrap();
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn oversized_chunk_rejected() {
        let mut buf = ChunkBuffer::default();
        assert_eq!(
            buf.push(&"a".repeat(401)),
            Err(SaslError::ChunkTooLong)
        );
    }
}
