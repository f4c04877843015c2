//! End-to-end tests over real TCP against the plain (unauthenticated)
//! listener, driving the wire protocol directly.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use seacat::config::{JoinConfig, ListenerConfig};
use seacat::framing::{ConnReader, ConnWriter};
use seacat::mux::{MuxConfig, MuxRole, MuxStream, Session};
use seacat::protocol::{GeometryUpdate, Mode, PLAIN_BANNER};
use seacat::server::SeacatServer;

/// Start a plain listener that runs `command` instead of an interactive
/// shell, and return its address.
async fn start_server(command: Vec<&str>) -> std::net::SocketAddr {
    let mut config = ListenerConfig::plain("127.0.0.1:0");
    config.command = Some(command.into_iter().map(str::to_string).collect());
    let server = SeacatServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

/// Connect, check the banner, bring up the multiplexer, and open both
/// streams in protocol order.
async fn connect(addr: std::net::SocketAddr, mode_line: &str) -> (Session, MuxStream, MuxStream) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut banner = [0u8; PLAIN_BANNER.len()];
    socket.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, PLAIN_BANNER.as_bytes());

    let (read_half, write_half) = socket.into_split();
    let session = Session::new(
        ConnReader::Plain(read_half),
        ConnWriter::Plain(write_half),
        MuxRole::Opener,
        MuxConfig::default(),
    );
    let control = session.open().await.unwrap();
    let mut data = session.open().await.unwrap();
    data.write_all(mode_line.as_bytes()).await.unwrap();
    (session, control, data)
}

/// Read from the data stream until the collected output satisfies `pred` or
/// the stream ends.
async fn collect_until(data: &mut MuxStream, pred: impl Fn(&str) -> bool) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let text = String::from_utf8_lossy(&collected).into_owned();
        if pred(&text) {
            return text;
        }
        let n = timeout(Duration::from_secs(10), data.read(&mut buf))
            .await
            .expect("timed out waiting for output");
        if n == 0 {
            return String::from_utf8_lossy(&collected).into_owned();
        }
        collected.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn shell_output_reaches_the_peer() {
    let addr = start_server(vec!["/bin/sh", "-c", "echo ready; sleep 2"]).await;
    let (_session, _control, mut data) = connect(addr, "MODE:view\n").await;

    let output = collect_until(&mut data, |text| text.contains("ready")).await;
    assert!(output.contains("ready"), "got {output:?}");
}

#[tokio::test]
async fn peer_input_reaches_the_shell() {
    let addr = start_server(vec!["/bin/sh", "-c", "read line; echo \"got:$line\""]).await;
    let (_session, _control, mut data) = connect(addr, "MODE:pair\n").await;

    data.write_all(b"hi\n").await.unwrap();
    let output = collect_until(&mut data, |text| text.contains("got:hi")).await;
    assert!(output.contains("got:hi"), "got {output:?}");
}

#[tokio::test]
async fn geometry_updates_resize_the_remote_pty() {
    // The shell reports its own size after the update has had time to land.
    let addr = start_server(vec!["/bin/sh", "-c", "sleep 1; stty size"]).await;
    let (_session, mut control, mut data) = connect(addr, "MODE:pair\n").await;

    control
        .write_all(&GeometryUpdate { rows: 40, cols: 120 }.encode())
        .await
        .unwrap();

    let output = collect_until(&mut data, |text| text.contains("40 120")).await;
    assert!(output.contains("40 120"), "got {output:?}");
}

#[tokio::test]
async fn requested_mode_is_exported_to_the_shell() {
    let addr = start_server(vec!["/bin/sh", "-c", "printf 'mode=%s' \"$SEACAT_MODE\""]).await;
    let (_session, _control, mut data) = connect(addr, "MODE:view\n").await;

    let output = collect_until(&mut data, |text| text.contains("mode=view")).await;
    assert!(output.contains("mode=view"), "got {output:?}");
}

#[tokio::test]
async fn unknown_mode_falls_back_to_pair() {
    let addr = start_server(vec!["/bin/sh", "-c", "printf 'mode=%s' \"$SEACAT_MODE\""]).await;
    let (_session, _control, mut data) = connect(addr, "MODE:turbo\n").await;

    let output = collect_until(&mut data, |text| text.contains("mode=pair")).await;
    assert!(output.contains("mode=pair"), "got {output:?}");
}

#[tokio::test]
async fn client_returns_after_the_remote_ends_the_session() {
    // The shell exits immediately; the full client (including its stdin
    // thread, which never sees input) must still return.
    let addr = start_server(vec!["/bin/sh", "-c", "echo bye"]).await;
    let config = JoinConfig::plain(addr.to_string(), Mode::View);
    timeout(Duration::from_secs(10), seacat::client::run(config))
        .await
        .expect("client did not return after remote teardown")
        .unwrap();
}

#[tokio::test]
async fn listener_survives_a_misbehaving_connection() {
    let addr = start_server(vec!["/bin/sh", "-c", "echo ready; sleep 2"]).await;

    // First connection disappears right after the banner.
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut banner = [0u8; PLAIN_BANNER.len()];
    socket.read_exact(&mut banner).await.unwrap();
    drop(socket);

    // Listener must still serve the next connection.
    let (_session, _control, mut data) = connect(addr, "MODE:view\n").await;
    let output = collect_until(&mut data, |text| text.contains("ready")).await;
    assert!(output.contains("ready"), "got {output:?}");
}
