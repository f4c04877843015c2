//! Challenge-response exchange over the still-unencrypted socket.
//!
//! The host cannot know which logical session a peer intends to join, so it
//! verifies the single response against every configured password candidate
//! (global first, then session-scoped) and accepts the first constant-time
//! match. Nothing about near-misses is revealed to the peer: any failure is
//! exactly `AUTH_FAIL` followed by connection close.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::auth::crypto::{self, KdfParams, SessionKey, NONCE_LEN};
use crate::config::SecurityConfig;
use crate::error::AuthError;
use crate::protocol::{self, AUTH_METHOD_PASSWORD};

const AUTH_OK: &[u8] = b"AUTH_OK\n";
const AUTH_FAIL: &[u8] = b"AUTH_FAIL\n";

#[derive(Debug)]
pub struct ServerAuthOutcome {
    pub session_key: SessionKey,
    /// Name of the session whose password matched, if it was session-scoped.
    pub session: Option<String>,
}

/// Host side of the exchange. On success both sides hold the same derived
/// session key; on any failure the caller must close the connection.
pub async fn authenticate_server<S>(
    stream: &mut S,
    security: &SecurityConfig,
) -> Result<ServerAuthOutcome, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = protocol::read_line(stream).await?;
    let method = protocol::parse_auth(&line)?;
    if method != AUTH_METHOD_PASSWORD {
        return Err(AuthError::UnsupportedMethod(method.to_string()));
    }

    let nonce = crypto::generate_nonce();
    stream
        .write_all(protocol::format_challenge(&nonce).as_bytes())
        .await?;
    stream.flush().await?;

    let line = protocol::read_line(stream).await?;
    let response = protocol::parse_response(&line)?;

    for (session, password) in security.password_candidates() {
        if crypto::verify_response(password, &nonce, &response, &security.kdf) {
            let session_key = crypto::derive_session_key(password, &nonce, &security.kdf)?;
            stream.write_all(AUTH_OK).await?;
            stream.flush().await?;
            debug!(session = session.unwrap_or("<global>"), "peer authenticated");
            return Ok(ServerAuthOutcome {
                session_key,
                session: session.map(str::to_string),
            });
        }
    }

    stream.write_all(AUTH_FAIL).await?;
    stream.flush().await?;
    Err(AuthError::Rejected)
}

/// Connecting side of the exchange.
pub async fn authenticate_client<S>(
    stream: &mut S,
    password: &str,
    kdf: &KdfParams,
) -> Result<SessionKey, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(protocol::format_auth(AUTH_METHOD_PASSWORD).as_bytes())
        .await?;
    stream.flush().await?;

    let line = protocol::read_line(stream).await?;
    let nonce = protocol::parse_challenge(&line)?;
    if nonce.len() < NONCE_LEN {
        return Err(AuthError::ShortNonce(nonce.len()));
    }

    let response = crypto::auth_response(password, &nonce, kdf)?;
    stream
        .write_all(protocol::format_response(&response).as_bytes())
        .await?;
    stream.flush().await?;

    let result = protocol::read_line(stream).await?;
    if result.trim() != "AUTH_OK" {
        return Err(AuthError::Rejected);
    }
    crypto::derive_session_key(password, &nonce, kdf)
}
