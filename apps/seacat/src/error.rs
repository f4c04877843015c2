use std::io;
use thiserror::Error;

/// Banner mismatch during the initial protocol exchange. Always fatal for the
/// connection; there is no retry path.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid handshake banner: {0:?}")]
    BadBanner(String),
    #[error("io error during handshake: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unsupported auth method: {0:?}")]
    UnsupportedMethod(String),
    #[error("malformed {0} message")]
    Malformed(&'static str),
    #[error("invalid base64 in {0} message")]
    BadBase64(&'static str),
    #[error("challenge nonce too short: {0} bytes")]
    ShortNonce(usize),
    #[error("authentication rejected")]
    Rejected,
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("io error during authentication: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the encrypted record layer. These are fatal and silent: once a
/// record fails to parse or authenticate the channel is no longer trustworthy,
/// so nothing is written back before the connection is dropped.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("invalid record length: {0}")]
    BadLength(u32),
    #[error("record authentication failed")]
    Aead,
    #[error("record counter exhausted")]
    CounterExhausted,
    #[error("io error on framed connection: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("unknown frame kind: {0}")]
    BadKind(u8),
    #[error("oversized frame payload: {0} bytes")]
    Oversized(u32),
    #[error("frame for unknown stream {0}")]
    BadStream(u32),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// PTY allocation or shell spawn failure. Fatal for the connection that hit
/// it; the listener keeps accepting others.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to open pty: {0}")]
    Open(String),
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
    #[error("failed to resize pty: {0}")]
    Resize(String),
}
