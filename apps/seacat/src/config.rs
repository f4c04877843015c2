//! Runtime configuration, passed explicitly into the listener and client
//! constructors so the core stays testable in isolation.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::auth::KdfParams;
use crate::mux::MuxConfig;
use crate::protocol::Mode;

/// The read-only password set a secure listener verifies against, plus the
/// KDF cost parameters both peers must share. Loadable from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Password accepted for any session hosted by this listener.
    pub global_password: Option<String>,
    /// Session-scoped passwords, keyed by session name.
    pub session_passwords: BTreeMap<String, String>,
    pub kdf: KdfParams,
}

impl SecurityConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading security config {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("parsing security config {}", path.display()))
    }

    pub fn has_passwords(&self) -> bool {
        self.global_password.is_some() || !self.session_passwords.is_empty()
    }

    /// Password to present when joining `session` (session-scoped wins over
    /// global).
    pub fn password_for_session(&self, session: Option<&str>) -> Option<&str> {
        if let Some(name) = session {
            if let Some(password) = self.session_passwords.get(name) {
                return Some(password);
            }
        }
        self.global_password.as_deref()
    }

    /// Verification order on the hosting side: the global password first,
    /// then session-scoped passwords in deterministic (sorted) order. The
    /// host cannot know which session the peer wants, so it has to try them
    /// all.
    pub fn password_candidates(&self) -> impl Iterator<Item = (Option<&str>, &str)> {
        self.global_password
            .iter()
            .map(|password| (None, password.as_str()))
            .chain(
                self.session_passwords
                    .iter()
                    .map(|(name, password)| (Some(name.as_str()), password.as_str())),
            )
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind, e.g. `0.0.0.0:7070`.
    pub listen_addr: String,
    /// Optional rc file sourced by the spawned shell before going
    /// interactive.
    pub rcfile: Option<PathBuf>,
    /// Override for the hosted command; `None` spawns an interactive bash.
    pub command: Option<Vec<String>>,
    /// `Some` makes this a secure listener (the `+SEC` banner).
    pub security: Option<SecurityConfig>,
    pub mux: MuxConfig,
}

impl ListenerConfig {
    pub fn plain(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            rcfile: None,
            command: None,
            security: None,
            mux: MuxConfig::default(),
        }
    }

    pub fn secure(listen_addr: impl Into<String>, security: SecurityConfig) -> Self {
        Self {
            security: Some(security),
            ..Self::plain(listen_addr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub connect_addr: String,
    pub mode: Mode,
    /// `Some` expects the secure banner and drives the key exchange; `None`
    /// expects the plain banner.
    pub password: Option<String>,
    pub kdf: KdfParams,
    pub mux: MuxConfig,
}

impl JoinConfig {
    pub fn plain(connect_addr: impl Into<String>, mode: Mode) -> Self {
        Self {
            connect_addr: connect_addr.into(),
            mode,
            password: None,
            kdf: KdfParams::default(),
            mux: MuxConfig::default(),
        }
    }

    pub fn secure(connect_addr: impl Into<String>, mode: Mode, password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..Self::plain(connect_addr, mode)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn security_config_from_toml() {
        let parsed: SecurityConfig = toml::from_str(
            r#"
            global_password = "global-pw"

            [session_passwords]
            demo = "demo-pw"
            work = "work-pw"

            [kdf]
            memory_kib = 65536
            iterations = 3
            parallelism = 4
            "#,
        )
        .unwrap();

        assert_eq!(parsed.global_password.as_deref(), Some("global-pw"));
        assert_eq!(parsed.session_passwords.len(), 2);
        assert_eq!(parsed.kdf, KdfParams::default());
    }

    #[test]
    fn missing_sections_use_defaults() {
        let parsed: SecurityConfig = toml::from_str(r#"global_password = "pw""#).unwrap();
        assert!(parsed.session_passwords.is_empty());
        assert_eq!(parsed.kdf, KdfParams::default());
        assert!(parsed.has_passwords());
    }

    #[test]
    fn candidate_order_is_global_then_sorted_sessions() {
        let mut config = SecurityConfig {
            global_password: Some("g".into()),
            ..SecurityConfig::default()
        };
        config.session_passwords.insert("zeta".into(), "z".into());
        config.session_passwords.insert("alpha".into(), "a".into());

        let order: Vec<_> = config.password_candidates().collect();
        assert_eq!(
            order,
            vec![(None, "g"), (Some("alpha"), "a"), (Some("zeta"), "z")]
        );
    }

    #[test]
    fn session_password_wins_over_global_for_clients() {
        let mut config = SecurityConfig {
            global_password: Some("g".into()),
            ..SecurityConfig::default()
        };
        config.session_passwords.insert("demo".into(), "d".into());

        assert_eq!(config.password_for_session(Some("demo")), Some("d"));
        assert_eq!(config.password_for_session(Some("other")), Some("g"));
        assert_eq!(config.password_for_session(None), Some("g"));
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"global_password = "from-disk""#).unwrap();
        let config = SecurityConfig::load(file.path()).unwrap();
        assert_eq!(config.global_password.as_deref(), Some("from-disk"));
    }
}
