//! Seacat: a remote-terminal transport over TCP.
//!
//! A listener hands each authenticated connection a fresh PTY running a
//! shell; a joining client bridges that shell to its local terminal. The wire
//! goes through three layers: a versioned banner handshake, an optional
//! password-derived encryption layer, and a two-stream multiplexer carrying
//! terminal geometry and terminal bytes separately.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod mux;
pub mod protocol;
pub mod server;
pub mod terminal;

pub use config::{JoinConfig, ListenerConfig, SecurityConfig};
pub use protocol::Mode;
pub use server::SeacatServer;
