//! Joining side: connect, verify the banner, authenticate when a password is
//! configured, then wire the local terminal to the remote shell.

use anyhow::Context;
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::authenticate_client;
use crate::config::JoinConfig;
use crate::error::HandshakeError;
use crate::framing::{ConnReader, ConnWriter, SecureReader, SecureWriter};
use crate::mux::{MuxRole, MuxStreamWriter, Session};
use crate::protocol::{self, GeometryUpdate, PLAIN_BANNER, SECURE_BANNER};
use crate::terminal::{detect_terminal_size, stdin_is_terminal, RawModeGuard};

const COPY_BUF_LEN: usize = 8192;
/// A listener writes its banner immediately on accept, so a slow or short
/// banner read means a mismatched peer, not a slow network.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect to a listener and run the interactive session until either side
/// ends it.
pub async fn run(config: JoinConfig) -> anyhow::Result<()> {
    let mut socket = TcpStream::connect(&config.connect_addr)
        .await
        .with_context(|| format!("failed to connect to {}", config.connect_addr))?;
    socket.set_nodelay(true)?;

    match config.password.clone() {
        Some(password) => {
            expect_banner(&mut socket, SECURE_BANNER).await?;
            let key = authenticate_client(&mut socket, &password, &config.kdf).await?;
            info!(addr = %config.connect_addr, "authenticated");
            let (read_half, write_half) = socket.into_split();
            run_joined(
                ConnReader::Secure(SecureReader::new(read_half, &key)),
                ConnWriter::Secure(SecureWriter::new(write_half, &key)),
                config,
            )
            .await
        }
        None => {
            expect_banner(&mut socket, PLAIN_BANNER).await?;
            let (read_half, write_half) = socket.into_split();
            run_joined(
                ConnReader::Plain(read_half),
                ConnWriter::Plain(write_half),
                config,
            )
            .await
        }
    }
}

/// Read exactly the expected banner and compare byte for byte. Reading the
/// exact length means a plain client against a secure listener (or the other
/// way around) fails here instead of hanging.
async fn expect_banner<S>(socket: &mut S, expected: &str) -> Result<(), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; expected.len()];
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.read_exact(&mut buf)).await {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            return Err(HandshakeError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for the handshake banner",
            )));
        }
    }
    if buf != expected.as_bytes() {
        return Err(HandshakeError::BadBanner(
            String::from_utf8_lossy(&buf).into_owned(),
        ));
    }
    Ok(())
}

async fn run_joined<R, W>(
    reader: ConnReader<R>,
    writer: ConnWriter<W>,
    config: JoinConfig,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Session::new(reader, writer, MuxRole::Opener, config.mux.clone());

    // Stream order is a protocol constant: control first, then data.
    let control = session.open().await?;
    let mut data = session.open().await?;

    data.write_all(protocol::format_mode(config.mode).as_bytes())
        .await?;
    debug!(mode = %config.mode, "mode sent");

    // Raw mode only when stdin is a real terminal, so piped input still works.
    let raw_guard = stdin_is_terminal().then(RawModeGuard::new);

    let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(8);

    let (_control_reader, control_writer) = control.split();
    let (mut data_reader, data_writer) = data.split();

    spawn_geometry_reporter(control_writer);
    spawn_stdin_bridge(data_writer, done_tx.clone());

    // Remote shell output -> local stdout, written on a blocking thread.
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout();
        while let Some(chunk) = stdout_rx.blocking_recv() {
            if stdout.write_all(&chunk).is_err() {
                break;
            }
            let _ = stdout.flush();
        }
    });
    {
        let done = done_tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; COPY_BUF_LEN];
            loop {
                let n = data_reader.read(&mut buf).await;
                if n == 0 {
                    let _ = done.send("remote closed the session").await;
                    break;
                }
                if stdout_tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(done_tx);

    let reason = done_rx.recv().await.unwrap_or("session finished");
    session.close();
    drop(raw_guard);
    info!(reason, "disconnected");
    Ok(())
}

/// Send the current geometry immediately, then again on every SIGWINCH.
fn spawn_geometry_reporter(mut control: MuxStreamWriter) {
    tokio::spawn(async move {
        if control.write_all(&current_geometry()).await.is_err() {
            return;
        }

        let mut winch = match signal(SignalKind::window_change()) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, "cannot watch for resize signals");
                return;
            }
        };
        while winch.recv().await.is_some() {
            if control.write_all(&current_geometry()).await.is_err() {
                break;
            }
        }
    });
}

fn current_geometry() -> [u8; GeometryUpdate::WIRE_LEN] {
    let (cols, rows) = detect_terminal_size();
    GeometryUpdate {
        rows: rows as u32,
        cols: cols as u32,
    }
    .encode()
}

/// Local stdin -> data stream. Stdin reads block with no cancellation path,
/// so they run on a detached thread (not a blocking task: runtime shutdown
/// waits for blocking tasks, and a parked stdin read would pin the process
/// after the remote ends the session).
fn spawn_stdin_bridge(mut data: MuxStreamWriter, done: mpsc::Sender<&'static str>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; COPY_BUF_LEN];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if data.write_all(&chunk).await.is_err() {
                break;
            }
        }
        // Half-close so the remote shell sees stdin EOF while its output
        // still drains to us.
        data.close().await;
        let _ = done.send("stdin closed").await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn matching_banner_is_accepted() {
        let (mut peer, mut local) = tokio::io::duplex(64);
        peer.write_all(PLAIN_BANNER.as_bytes()).await.unwrap();
        expect_banner(&mut local, PLAIN_BANNER).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn short_banner_times_out_instead_of_hanging() {
        // A plain listener sends fewer bytes than the secure banner; the
        // secure-expecting read must fail promptly, not wait for keepalive
        // traffic to pad out the missing bytes.
        let (mut peer, mut local) = tokio::io::duplex(64);
        peer.write_all(PLAIN_BANNER.as_bytes()).await.unwrap();
        let err = expect_banner(&mut local, SECURE_BANNER).await.unwrap_err();
        match err {
            HandshakeError::Io(err) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_banner_is_rejected_without_overreading() {
        let (mut peer, mut local) = tokio::io::duplex(64);
        peer.write_all(SECURE_BANNER.as_bytes()).await.unwrap();
        let err = expect_banner(&mut local, PLAIN_BANNER).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadBanner(_)));
    }
}
