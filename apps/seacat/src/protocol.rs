//! Wire-level constants and line-token messages.
//!
//! Everything exchanged before the multiplexer comes up is a UTF-8,
//! newline-terminated token on the raw (or freshly encrypted) socket. The
//! formats here must match on both peers byte-for-byte; there is no
//! negotiation beyond the banner suffix.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::AuthError;

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Banner written by a plain listener immediately on accept.
pub const PLAIN_BANNER: &str = "SEACAT/1.0.0\n";
/// Banner written by a listener that requires authentication.
pub const SECURE_BANNER: &str = "SEACAT/1.0.0+SEC\n";

/// The only authentication method defined by the protocol.
pub const AUTH_METHOD_PASSWORD: &str = "password";

/// Upper bound on any line-based token, including the newline.
pub const MAX_LINE_LEN: usize = 256;

/// Access level the connecting peer requests for the hosted session. The
/// value is advisory at the transport layer: it is exported to the spawned
/// shell's environment, and enforcement (if any) happens there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Pair,
    View,
    Rogue,
}

impl Mode {
    /// Unrecognized tokens map to `Pair` rather than failing, so older peers
    /// keep working against newer hosts.
    pub fn parse(token: &str) -> Self {
        match token.trim() {
            "view" => Mode::View,
            "rogue" => Mode::Rogue,
            _ => Mode::Pair,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Pair => "pair",
            Mode::View => "view",
            Mode::Rogue => "rogue",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal geometry reported by the connecting peer on the control stream.
/// Fixed-size record: rows then cols, each u32 big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryUpdate {
    pub rows: u32,
    pub cols: u32,
}

impl GeometryUpdate {
    pub const WIRE_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[..4].copy_from_slice(&self.rows.to_be_bytes());
        buf[4..].copy_from_slice(&self.cols.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_LEN]) -> Self {
        Self {
            rows: u32::from_be_bytes(buf[..4].try_into().unwrap()),
            cols: u32::from_be_bytes(buf[4..].try_into().unwrap()),
        }
    }
}

pub fn format_auth(method: &str) -> String {
    format!("AUTH:{method}\n")
}

pub fn parse_auth(line: &str) -> Result<&str, AuthError> {
    let method = line
        .trim()
        .strip_prefix("AUTH:")
        .ok_or(AuthError::Malformed("auth"))?;
    if method.is_empty() {
        return Err(AuthError::Malformed("auth"));
    }
    Ok(method)
}

pub fn format_challenge(nonce: &[u8]) -> String {
    format!("CHALLENGE:{}\n", STANDARD.encode(nonce))
}

pub fn parse_challenge(line: &str) -> Result<Vec<u8>, AuthError> {
    let encoded = line
        .trim()
        .strip_prefix("CHALLENGE:")
        .ok_or(AuthError::Malformed("challenge"))?;
    STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::BadBase64("challenge"))
}

pub fn format_response(response: &[u8]) -> String {
    format!("RESPONSE:{}\n", STANDARD.encode(response))
}

pub fn parse_response(line: &str) -> Result<Vec<u8>, AuthError> {
    let encoded = line
        .trim()
        .strip_prefix("RESPONSE:")
        .ok_or(AuthError::Malformed("response"))?;
    STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::BadBase64("response"))
}

pub fn format_mode(mode: Mode) -> String {
    format!("MODE:{mode}\n")
}

/// Parse a `MODE:<value>` line. A missing prefix or unknown value falls back
/// to the default mode instead of failing.
pub fn parse_mode(line: &str) -> Mode {
    match line.trim().strip_prefix("MODE:") {
        Some(value) => Mode::parse(value),
        None => Mode::default(),
    }
}

/// Read one newline-terminated token, byte by byte.
///
/// Deliberately unbuffered: during the handshake the phase after a line may
/// switch framing entirely (encryption, multiplexing), so no bytes beyond the
/// newline may be consumed from the socket.
pub async fn read_line<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() >= MAX_LINE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "protocol line too long",
            ));
        }
    }
    String::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "protocol line is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banners_differ_in_length() {
        // A client expecting the plain banner reads exactly PLAIN_BANNER.len()
        // bytes; against a secure listener that prefix can never match.
        assert_ne!(PLAIN_BANNER.len(), SECURE_BANNER.len());
        assert!(!SECURE_BANNER.starts_with(PLAIN_BANNER));
    }

    #[test]
    fn mode_parse_defaults_to_pair() {
        assert_eq!(Mode::parse("view"), Mode::View);
        assert_eq!(Mode::parse("rogue"), Mode::Rogue);
        assert_eq!(Mode::parse("pair"), Mode::Pair);
        assert_eq!(Mode::parse("turbo"), Mode::Pair);
        assert_eq!(Mode::parse(""), Mode::Pair);
    }

    #[test]
    fn mode_line_round_trip() {
        assert_eq!(parse_mode(&format_mode(Mode::View)), Mode::View);
        assert_eq!(parse_mode("MODE:unknown\n"), Mode::Pair);
        assert_eq!(parse_mode("garbage"), Mode::Pair);
    }

    #[test]
    fn auth_line_round_trip() {
        let line = format_auth(AUTH_METHOD_PASSWORD);
        assert_eq!(parse_auth(&line).unwrap(), "password");
        assert!(parse_auth("AUTH:").is_err());
        assert!(parse_auth("HELLO:password").is_err());
    }

    #[test]
    fn challenge_and_response_round_trip() {
        let nonce = [7u8; 32];
        let parsed = parse_challenge(&format_challenge(&nonce)).unwrap();
        assert_eq!(parsed, nonce);

        let response = [9u8; 32];
        let parsed = parse_response(&format_response(&response)).unwrap();
        assert_eq!(parsed, response);

        assert!(matches!(
            parse_challenge("CHALLENGE:!!!"),
            Err(AuthError::BadBase64(_))
        ));
        assert!(matches!(
            parse_response("CHALLENGE:AAAA"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn geometry_codec() {
        let update = GeometryUpdate { rows: 40, cols: 120 };
        let wire = update.encode();
        assert_eq!(GeometryUpdate::decode(&wire), update);
        assert_eq!(wire, [0, 0, 0, 40, 0, 0, 0, 120]);
    }

    #[tokio::test]
    async fn read_line_stops_at_newline() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"MODE:view\nextra")
            .await
            .unwrap();
        let line = read_line(&mut server).await.unwrap();
        assert_eq!(line, "MODE:view");
        // The bytes after the newline must still be in the stream.
        let mut rest = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut rest)
            .await
            .unwrap();
        assert_eq!(&rest, b"extra");
    }

    #[tokio::test]
    async fn read_line_rejects_unterminated_runs() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[b'a'; MAX_LINE_LEN + 1])
            .await
            .unwrap();
        let err = read_line(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
