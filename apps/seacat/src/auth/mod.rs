//! Password authentication: key derivation and the challenge-response
//! exchange that runs on the raw socket before encryption starts.

pub mod crypto;
pub mod exchange;

pub use crypto::{KdfParams, SessionKey};
pub use exchange::{authenticate_client, authenticate_server, ServerAuthOutcome};
