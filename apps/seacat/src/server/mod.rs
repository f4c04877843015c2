//! Hosting side: accept connections, run the handshake, and bridge the
//! multiplexed streams onto a freshly spawned PTY.

pub mod pty;

use anyhow::Context;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::authenticate_server;
use crate::config::ListenerConfig;
use crate::error::MuxError;
use crate::framing::{ConnReader, ConnWriter, SecureReader, SecureWriter};
use crate::mux::{MuxRole, MuxStreamReader, MuxStreamWriter, Session, CONTROL_STREAM, DATA_STREAM};
use crate::protocol::{self, GeometryUpdate, PLAIN_BANNER, SECURE_BANNER};
use pty::{PtySession, ShellRequest};

const COPY_BUF_LEN: usize = 8192;
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct SeacatServer {
    listener: TcpListener,
    config: Arc<ListenerConfig>,
}

impl SeacatServer {
    pub async fn bind(config: ListenerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. One failed connection never takes the listener down.
    pub async fn serve(self) -> anyhow::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let secure = self
            .config
            .security
            .as_ref()
            .is_some_and(|security| security.has_passwords());
        info!(%local_addr, secure, "listening");

        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            debug!(%peer, "connection accepted");
            let config = Arc::clone(&self.config);
            let local_port = local_addr.port();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(socket, peer, local_port, config).await {
                    warn!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    local_port: u16,
    config: Arc<ListenerConfig>,
) -> anyhow::Result<()> {
    socket.set_nodelay(true)?;

    match config.security.as_ref().filter(|s| s.has_passwords()) {
        Some(security) => {
            socket.write_all(SECURE_BANNER.as_bytes()).await?;
            socket.flush().await?;
            let outcome = authenticate_server(&mut socket, security).await?;
            let (read_half, write_half) = socket.into_split();
            run_session(
                ConnReader::Secure(SecureReader::new(read_half, &outcome.session_key)),
                ConnWriter::Secure(SecureWriter::new(write_half, &outcome.session_key)),
                peer,
                local_port,
                config,
            )
            .await
        }
        None => {
            socket.write_all(PLAIN_BANNER.as_bytes()).await?;
            socket.flush().await?;
            let (read_half, write_half) = socket.into_split();
            run_session(
                ConnReader::Plain(read_half),
                ConnWriter::Plain(write_half),
                peer,
                local_port,
                config,
            )
            .await
        }
    }
}

/// Bring up the multiplexer, read the mode line, spawn the shell, and run the
/// copy loops until any of them reports done.
async fn run_session<R, W>(
    reader: ConnReader<R>,
    writer: ConnWriter<W>,
    peer: SocketAddr,
    local_port: u16,
    config: Arc<ListenerConfig>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Session::new(reader, writer, MuxRole::Acceptor, config.mux.clone());

    let control = session.accept().await?;
    let mut data = session.accept().await?;
    if control.id() != CONTROL_STREAM || data.id() != DATA_STREAM {
        warn!(
            control = control.id(),
            data = data.id(),
            "peer opened streams out of order"
        );
        return Err(MuxError::BadStream(control.id()).into());
    }

    // The first line on the data stream selects the mode; everything after it
    // is raw terminal bytes.
    let mode = protocol::parse_mode(&data.read_line().await?);
    info!(%peer, %mode, "session starting");

    let (pty, pty_reader, pty_writer) = PtySession::spawn(&ShellRequest {
        peer_addr: peer.ip().to_string(),
        peer_port: peer.port(),
        local_port,
        mode,
        rcfile: config.rcfile.clone(),
        command: config.command.clone(),
        rows: 24,
        cols: 80,
    })?;
    let pty = Arc::new(pty);

    // Every bridging task reports why it stopped; the first report wins and
    // triggers teardown of everything else.
    let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(8);

    let (control_reader, _control_writer) = control.split();
    let (data_reader, data_writer) = data.split();

    spawn_resize_loop(control_reader, Arc::clone(&pty), done_tx.clone());
    spawn_input_bridge(data_reader, pty_writer, done_tx.clone());
    spawn_output_bridge(pty_reader, data_writer, done_tx.clone());
    spawn_child_watcher(Arc::clone(&pty), done_tx.clone());
    drop(done_tx);

    let reason = done_rx.recv().await.unwrap_or("all tasks finished");
    info!(%peer, reason, "session ending");

    pty.shutdown();
    session.close();
    Ok(())
}

/// Control stream carries fixed-size geometry records; each one resizes the
/// PTY and signals the child.
fn spawn_resize_loop(
    mut control: MuxStreamReader,
    pty: Arc<PtySession>,
    done: mpsc::Sender<&'static str>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; GeometryUpdate::WIRE_LEN];
        loop {
            match control.read_exact_or_eof(&mut buf).await {
                Ok(true) => {
                    let update = GeometryUpdate::decode(&buf);
                    let rows = update.rows.min(u16::MAX as u32) as u16;
                    let cols = update.cols.min(u16::MAX as u32) as u16;
                    match pty.resize(rows, cols) {
                        Ok(()) => debug!(rows, cols, "applied geometry update"),
                        Err(err) => warn!(error = %err, "resize failed"),
                    }
                }
                Ok(false) => {
                    let _ = done.send("control stream closed").await;
                    break;
                }
                Err(err) => {
                    debug!(error = %err, "control stream failed");
                    let _ = done.send("control stream failed").await;
                    break;
                }
            }
        }
    });
}

/// Data stream -> PTY stdin. The PTY writer is blocking, so the async reader
/// feeds it through a channel drained on a blocking thread.
fn spawn_input_bridge(
    mut data: MuxStreamReader,
    mut pty_writer: Box<dyn Write + Send>,
    done: mpsc::Sender<&'static str>,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        while let Some(chunk) = rx.blocking_recv() {
            if pty_writer.write_all(&chunk).is_err() {
                break;
            }
            let _ = pty_writer.flush();
        }
    });

    tokio::spawn(async move {
        let mut buf = [0u8; COPY_BUF_LEN];
        loop {
            let n = data.read(&mut buf).await;
            if n == 0 {
                let _ = done.send("data stream closed").await;
                break;
            }
            if tx.send(buf[..n].to_vec()).await.is_err() {
                let _ = done.send("pty input closed").await;
                break;
            }
        }
    });
}

/// PTY stdout -> data stream. The blocking PTY read runs on its own thread;
/// it unblocks with an error once the child is gone.
fn spawn_output_bridge(
    mut pty_reader: Box<dyn Read + Send>,
    mut data: MuxStreamWriter,
    done: mpsc::Sender<&'static str>,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; COPY_BUF_LEN];
        loop {
            match pty_reader.read(&mut buf) {
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
        // Drain any buffered output to the peer, then half-close so the peer
        // sees EOF on its terminal stream.
        data.close().await;
        let _ = done.send("pty output ended").await;
    });
}

fn spawn_child_watcher(pty: Arc<PtySession>, done: mpsc::Sender<&'static str>) {
    tokio::spawn(async move {
        loop {
            if pty.has_exited() {
                let _ = done.send("shell exited").await;
                break;
            }
            tokio::time::sleep(CHILD_POLL_INTERVAL).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_the_ephemeral_port() {
        let server = SeacatServer::bind(ListenerConfig::plain("127.0.0.1:0"))
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
