use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Per-connection challenge nonce length. The first half salts the
/// authentication key, the second half salts the session key.
pub const NONCE_LEN: usize = 32;
pub const KEY_LEN: usize = 32;

/// Symmetric key derived once per connection; never persisted.
pub type SessionKey = [u8; KEY_LEN];

/// Argon2id cost parameters. Both peers must use identical values; a mismatch
/// surfaces as an ordinary response mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MiB
            iterations: 3,
            parallelism: 4,
        }
    }
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> Result<SessionKey, AuthError> {
    let params = ParamsBuilder::new()
        .m_cost(kdf.memory_kib)
        .t_cost(kdf.iterations)
        .p_cost(kdf.parallelism)
        .output_len(KEY_LEN)
        .build()
        .map_err(|err| AuthError::Kdf(err.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|err| AuthError::Kdf(err.to_string()))?;
    Ok(key)
}

/// HMAC-SHA256 over the full nonce, keyed by Argon2id(password, nonce[0..16]).
pub fn auth_response(
    password: &str,
    nonce: &[u8],
    kdf: &KdfParams,
) -> Result<[u8; 32], AuthError> {
    if nonce.len() < NONCE_LEN {
        return Err(AuthError::ShortNonce(nonce.len()));
    }
    let auth_key = derive_key(password, &nonce[..16], kdf)?;
    let mut mac = HmacSha256::new_from_slice(&auth_key)
        .map_err(|err| AuthError::Kdf(err.to_string()))?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check of a peer's response against one candidate password.
pub fn verify_response(password: &str, nonce: &[u8], response: &[u8], kdf: &KdfParams) -> bool {
    let auth_key = match derive_key(password, &nonce[..16.min(nonce.len())], kdf) {
        Ok(key) if nonce.len() >= NONCE_LEN => key,
        _ => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(&auth_key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(nonce);
    mac.verify_slice(response).is_ok()
}

/// Session key = Argon2id(password, nonce[16..32]). Derived independently on
/// both sides after a successful exchange.
pub fn derive_session_key(
    password: &str,
    nonce: &[u8],
    kdf: &KdfParams,
) -> Result<SessionKey, AuthError> {
    if nonce.len() < NONCE_LEN {
        return Err(AuthError::ShortNonce(nonce.len()));
    }
    derive_key(password, &nonce[16..32], kdf)
}

#[cfg(test)]
pub(crate) fn test_kdf_params() -> KdfParams {
    // Keep tests fast; production defaults are deliberately expensive.
    KdfParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_deterministic() {
        let kdf = test_kdf_params();
        let nonce = [42u8; NONCE_LEN];
        let a = derive_session_key("hunter2", &nonce, &kdf).unwrap();
        let b = derive_session_key("hunter2", &nonce, &kdf).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn session_key_differs_per_nonce_and_password() {
        let kdf = test_kdf_params();
        let nonce_a = [1u8; NONCE_LEN];
        let nonce_b = [2u8; NONCE_LEN];
        let base = derive_session_key("hunter2", &nonce_a, &kdf).unwrap();
        assert_ne!(base, derive_session_key("hunter2", &nonce_b, &kdf).unwrap());
        assert_ne!(base, derive_session_key("hunter3", &nonce_a, &kdf).unwrap());
    }

    #[test]
    fn auth_and_session_keys_use_different_salt_halves() {
        let kdf = test_kdf_params();
        let nonce = [7u8; NONCE_LEN];
        let response = auth_response("pw", &nonce, &kdf).unwrap();
        let session = derive_session_key("pw", &nonce, &kdf).unwrap();
        assert_ne!(response, session);
    }

    #[test]
    fn verify_accepts_matching_response() {
        let kdf = test_kdf_params();
        let nonce = generate_nonce();
        let response = auth_response("correct", &nonce, &kdf).unwrap();
        assert!(verify_response("correct", &nonce, &response, &kdf));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let kdf = test_kdf_params();
        let nonce = generate_nonce();
        let response = auth_response("wrong", &nonce, &kdf).unwrap();
        assert!(!verify_response("correct", &nonce, &response, &kdf));
    }

    #[test]
    fn verify_rejects_short_nonce() {
        let kdf = test_kdf_params();
        let nonce = [0u8; 16];
        assert!(!verify_response("pw", &nonce, &[0u8; 32], &kdf));
        assert!(matches!(
            auth_response("pw", &nonce, &kdf),
            Err(AuthError::ShortNonce(16))
        ));
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
