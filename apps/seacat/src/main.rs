use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use seacat::config::{JoinConfig, ListenerConfig, SecurityConfig};
use seacat::protocol::Mode;
use seacat::server::SeacatServer;

#[derive(Parser, Debug)]
#[command(name = "seacat", version, about = "Remote terminal over TCP")]
struct Cli {
    /// Log filter, e.g. `info` or `seacat=debug`.
    #[arg(long, env = "SEACAT_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for connections and hand each one a shell.
    Host {
        /// Address to listen on.
        #[arg(long, default_value = "0.0.0.0:7070")]
        listen: String,

        /// rc file sourced by the spawned shell before it goes interactive.
        #[arg(long)]
        rcfile: Option<PathBuf>,

        /// Program to run instead of an interactive shell (after `--`).
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,

        /// Global password; connections must authenticate.
        #[arg(long, env = "SEACAT_PASSWORD")]
        password: Option<String>,

        /// TOML file with global and per-session passwords.
        #[arg(long)]
        security_file: Option<PathBuf>,
    },
    /// Connect to a host and attach the local terminal.
    Join {
        /// Host address, e.g. `example.org:7070`.
        addr: String,

        /// Requested access mode: pair, view, or rogue.
        #[arg(long, default_value = "pair")]
        mode: String,

        /// Password for a secure host.
        #[arg(long, env = "SEACAT_PASSWORD")]
        password: Option<String>,

        /// TOML security file to take the password and KDF parameters from.
        #[arg(long, conflicts_with = "password")]
        security_file: Option<PathBuf>,

        /// Session name whose password to present (from the security file).
        #[arg(long, requires = "security_file")]
        session: Option<String>,
    },
}


#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Host {
            listen,
            rcfile,
            command,
            password,
            security_file,
        } => {
            let security = match (password, security_file) {
                (Some(_), Some(_)) => {
                    bail!("--password and --security-file are mutually exclusive")
                }
                (Some(password), None) => Some(SecurityConfig {
                    global_password: Some(password),
                    ..SecurityConfig::default()
                }),
                (None, Some(path)) => {
                    let security = SecurityConfig::load(&path)
                        .with_context(|| format!("failed to load {}", path.display()))?;
                    if !security.has_passwords() {
                        bail!("{} configures no passwords", path.display());
                    }
                    Some(security)
                }
                (None, None) => None,
            };

            let mut config = match security {
                Some(security) => ListenerConfig::secure(listen, security),
                None => ListenerConfig::plain(listen),
            };
            config.rcfile = rcfile;
            config.command = (!command.is_empty()).then_some(command);

            SeacatServer::bind(config).await?.serve().await
        }
        Command::Join {
            addr,
            mode,
            password,
            security_file,
            session,
        } => {
            let mode = Mode::parse(&mode);
            let config = match (password, security_file) {
                (_, Some(path)) => {
                    let security = SecurityConfig::load(&path)
                        .with_context(|| format!("failed to load {}", path.display()))?;
                    let password = security
                        .password_for_session(session.as_deref())
                        .with_context(|| match session {
                            Some(name) => {
                                format!("{} has no password for session {name:?}", path.display())
                            }
                            None => format!("{} has no global password", path.display()),
                        })?
                        .to_string();
                    let mut config = JoinConfig::secure(addr, mode, password);
                    config.kdf = security.kdf;
                    config
                }
                (Some(password), None) => JoinConfig::secure(addr, mode, password),
                (None, None) => JoinConfig::plain(addr, mode),
            };
            seacat::client::run(config).await
        }
    }
}
