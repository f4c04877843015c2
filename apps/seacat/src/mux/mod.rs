//! Two-stream multiplexer over a single connection.
//!
//! The connecting peer always opens the streams, in a fixed order that is a
//! protocol constant: first Control (id 1), then Data (id 2). The hosting
//! peer accepts them in arrival order. The layer supports half-close (FIN on
//! one stream leaves the other running), keepalive probing, and tears every
//! stream down when the underlying connection goes away.
//!
//! Flow control is per-stream credit windows: a sender may have at most
//! [`INITIAL_WINDOW`] bytes unconsumed at the receiver, and the receiver
//! returns credit in WINDOW frames as its consumer reads. A stalled consumer
//! therefore stalls only its own sender; the sibling stream and keepalive
//! traffic keep flowing.

pub mod frame;

use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::error::MuxError;
use crate::framing::{ConnReader, ConnWriter};
use crate::protocol::MAX_LINE_LEN;
use frame::{Frame, FrameKind, MAX_FRAME_PAYLOAD};

/// Stream carrying geometry updates. Opened first.
pub const CONTROL_STREAM: u32 = 1;
/// Stream carrying raw terminal bytes. Opened second.
pub const DATA_STREAM: u32 = 2;

const OUTBOUND_DEPTH: usize = 64;
/// Bytes a sender may have in flight per stream before it must wait for the
/// receiver to return credit.
pub const INITIAL_WINDOW: usize = 256 * 1024;
/// Consumed bytes are batched into one WINDOW frame at this granularity.
const WINDOW_UPDATE_THRESHOLD: usize = INITIAL_WINDOW / 2;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How often to probe an idle connection.
    pub keepalive_interval: Duration,
    /// Number of silent keepalive windows tolerated before the connection is
    /// declared dead.
    pub keepalive_misses: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_misses: 3,
        }
    }
}

/// Which end of the connection this session is. Only the connecting peer
/// opens streams; a SYN arriving at an opener is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    Opener,
    Acceptor,
}

struct Shared {
    // Inbound queues are unbounded so the reader task never blocks on a
    // stalled consumer; the credit window bounds how much a window-respecting
    // peer can have queued here.
    inbound: StdMutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    send_credit: StdMutex<HashMap<u32, Arc<Semaphore>>>,
    last_recv: StdMutex<Instant>,
}

impl Shared {
    /// Connection teardown: every queued stream sees EOF and every writer
    /// blocked on credit unblocks with an error.
    fn close_streams(&self) {
        self.inbound.lock().unwrap().clear();
        for (_, credit) in self.send_credit.lock().unwrap().drain() {
            credit.close();
        }
    }
}

pub struct Session {
    outbound: mpsc::Sender<Frame>,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
    shutdown: Arc<watch::Sender<bool>>,
    shared: Arc<Shared>,
    next_stream: AtomicU32,
    role: MuxRole,
}

impl Session {
    pub fn new<R, W>(
        mut reader: ConnReader<R>,
        mut writer: ConnWriter<W>,
        role: MuxRole,
        config: MuxConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_DEPTH);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(4);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let shared = Arc::new(Shared {
            inbound: StdMutex::new(HashMap::new()),
            send_credit: StdMutex::new(HashMap::new()),
            last_recv: StdMutex::new(Instant::now()),
        });

        // Writer task: drains the outbound queue onto the connection.
        {
            let shutdown = Arc::clone(&shutdown);
            let mut watch_rx = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    // Biased so queued frames (including a final FIN) drain
                    // before a shutdown signal is honored.
                    tokio::select! {
                        biased;
                        frame = outbound_rx.recv() => match frame {
                            Some(frame) => {
                                if let Err(err) = writer.write_all(&frame.encode()).await {
                                    debug!(error = %err, "mux write failed");
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = watch_rx.changed() => break,
                    }
                }
                let _ = shutdown.send(true);
            });
        }

        // Reader task: decodes frames and fans payloads out per stream.
        {
            let shutdown = Arc::clone(&shutdown);
            let mut watch_rx = shutdown.subscribe();
            let shared = Arc::clone(&shared);
            let outbound = outbound_tx.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        res = Frame::read(&mut reader) => match res {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(err) => {
                                debug!(error = %err, "mux read failed");
                                break;
                            }
                        },
                        _ = watch_rx.changed() => break,
                    };
                    *shared.last_recv.lock().unwrap() = Instant::now();

                    match frame.kind {
                        FrameKind::Syn => {
                            if role == MuxRole::Opener {
                                warn!(stream = frame.stream, "peer tried to open a stream");
                                break;
                            }
                            let (tx, rx) = mpsc::unbounded_channel();
                            let credit = Arc::new(Semaphore::new(INITIAL_WINDOW));
                            shared.inbound.lock().unwrap().insert(frame.stream, tx);
                            shared
                                .send_credit
                                .lock()
                                .unwrap()
                                .insert(frame.stream, Arc::clone(&credit));
                            let stream = MuxStream::new(frame.stream, rx, outbound.clone(), credit);
                            if accept_tx.send(stream).await.is_err() {
                                break;
                            }
                        }
                        FrameKind::Data => {
                            let sender =
                                shared.inbound.lock().unwrap().get(&frame.stream).cloned();
                            match sender {
                                Some(tx) => {
                                    // A dropped receiver means the local side
                                    // stopped reading; discard quietly.
                                    if tx.send(frame.payload).is_err() {
                                        shared.inbound.lock().unwrap().remove(&frame.stream);
                                    }
                                }
                                None => {
                                    warn!(stream = frame.stream, "data for unknown stream");
                                    break;
                                }
                            }
                        }
                        FrameKind::Window => {
                            if frame.payload.len() != 4 {
                                warn!(stream = frame.stream, "malformed window update");
                                break;
                            }
                            let delta =
                                u32::from_be_bytes(frame.payload[..4].try_into().unwrap());
                            let credit =
                                shared.send_credit.lock().unwrap().get(&frame.stream).cloned();
                            if let Some(credit) = credit {
                                credit.add_permits(delta as usize);
                            }
                        }
                        FrameKind::Fin => {
                            shared.inbound.lock().unwrap().remove(&frame.stream);
                        }
                        FrameKind::Ping => {
                            if outbound.send(Frame::pong()).await.is_err() {
                                break;
                            }
                        }
                        FrameKind::Pong => {}
                    }
                }
                // Closing the connection closes all streams.
                shared.close_streams();
                let _ = shutdown.send(true);
            });
        }

        // Keepalive task: probe on an interval, fail the connection once the
        // peer has been silent for `keepalive_misses` windows.
        {
            let shutdown = Arc::clone(&shutdown);
            let shared = Arc::clone(&shared);
            let outbound = outbound_tx.clone();
            let interval = config.keepalive_interval;
            let window = interval * config.keepalive_misses;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    let silent_for = shared.last_recv.lock().unwrap().elapsed();
                    if silent_for > window {
                        warn!(?silent_for, "keepalive window expired");
                        let _ = shutdown.send(true);
                        break;
                    }
                    if outbound.send(Frame::ping()).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self {
            outbound: outbound_tx,
            accept_rx: Mutex::new(accept_rx),
            shutdown,
            shared,
            next_stream: AtomicU32::new(CONTROL_STREAM),
            role,
        }
    }

    /// Open the next logical stream (connecting peer only). Stream ids are
    /// assigned in open order, which is what makes the accept order on the
    /// hosting side deterministic.
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        debug_assert_eq!(self.role, MuxRole::Opener);
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(INITIAL_WINDOW));
        self.shared.inbound.lock().unwrap().insert(id, tx);
        self.shared
            .send_credit
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&credit));
        self.outbound
            .send(Frame::syn(id))
            .await
            .map_err(|_| MuxError::Closed)?;
        Ok(MuxStream::new(id, rx, self.outbound.clone(), credit))
    }

    /// Accept the next stream the peer opened, in arrival order.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(MuxError::Closed)
    }

    /// Tear the session down: all tasks stop and every stream unblocks.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.subscribe().borrow()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub struct MuxStreamReader {
    id: u32,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    outbound: mpsc::Sender<Frame>,
    consumed: usize,
}

impl MuxStreamReader {
    /// Read stream bytes. 0 means the stream (or the connection) is done.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        while self.pending.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.pending = chunk,
                None => return 0,
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);

        // Return consumed bytes to the sender's window, batched so small
        // interactive reads do not produce a WINDOW frame each.
        self.consumed += n;
        if self.consumed >= WINDOW_UPDATE_THRESHOLD {
            let delta = self.consumed as u32;
            self.consumed = 0;
            let _ = self.outbound.send(Frame::window(self.id, delta)).await;
        }
        n
    }

    /// Fill `buf` completely; `Ok(false)` on clean EOF before the first byte.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, MuxError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(MuxError::Closed);
            }
            filled += n;
        }
        Ok(true)
    }

    /// Read one newline-terminated line (used for the initial MODE token).
    pub async fn read_line(&mut self) -> Result<String, MuxError> {
        let mut line = Vec::with_capacity(32);
        loop {
            let mut byte = [0u8; 1];
            if self.read(&mut byte).await == 0 {
                return Err(MuxError::Closed);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() >= MAX_LINE_LEN {
                return Err(MuxError::LineTooLong(MAX_LINE_LEN));
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

pub struct MuxStreamWriter {
    id: u32,
    outbound: mpsc::Sender<Frame>,
    credit: Arc<Semaphore>,
    fin_sent: bool,
}

impl MuxStreamWriter {
    /// Write, waiting for window credit per chunk. Blocks only this stream's
    /// sender; the credit semaphore is closed on connection teardown, so a
    /// blocked write unblocks with `Closed`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MuxError> {
        if self.fin_sent {
            return Err(MuxError::Closed);
        }
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let permit = self
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| MuxError::Closed)?;
            // Permits come back in WINDOW frames, not on drop.
            permit.forget();
            self.outbound
                .send(Frame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| MuxError::Closed)?;
        }
        Ok(())
    }

    /// Half-close: no more writes on this stream; the peer's reads drain and
    /// then report EOF. The sibling stream is unaffected.
    pub async fn close(&mut self) {
        if !self.fin_sent {
            self.fin_sent = true;
            let _ = self.outbound.send(Frame::fin(self.id)).await;
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

/// One logical stream. Splittable so the read and write sides can live in
/// different copy loops.
pub struct MuxStream {
    reader: MuxStreamReader,
    writer: MuxStreamWriter,
}

impl MuxStream {
    fn new(
        id: u32,
        rx: mpsc::UnboundedReceiver<Bytes>,
        outbound: mpsc::Sender<Frame>,
        credit: Arc<Semaphore>,
    ) -> Self {
        Self {
            reader: MuxStreamReader {
                id,
                rx,
                pending: Bytes::new(),
                outbound: outbound.clone(),
                consumed: 0,
            },
            writer: MuxStreamWriter { id, outbound, credit, fin_sent: false },
        }
    }

    pub fn id(&self) -> u32 {
        self.reader.id
    }

    pub fn split(self) -> (MuxStreamReader, MuxStreamWriter) {
        (self.reader, self.writer)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read(buf).await
    }

    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, MuxError> {
        self.reader.read_exact_or_eof(buf).await
    }

    pub async fn read_line(&mut self) -> Result<String, MuxError> {
        self.reader.read_line().await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.writer.write_all(data).await
    }

    pub async fn close(&mut self) {
        self.writer.close().await
    }
}
