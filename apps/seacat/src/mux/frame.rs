use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::MuxError;
use crate::framing::ConnReader;

/// Largest payload carried by a single DATA frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
pub const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Syn = 1,
    Data = 2,
    Fin = 3,
    Ping = 4,
    Pong = 5,
    /// Returns receive-window credit to the sender of a stream.
    Window = 6,
}

impl FrameKind {
    fn from_wire(value: u8) -> Result<Self, MuxError> {
        match value {
            1 => Ok(FrameKind::Syn),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Fin),
            4 => Ok(FrameKind::Ping),
            5 => Ok(FrameKind::Pong),
            6 => Ok(FrameKind::Window),
            other => Err(MuxError::BadKind(other)),
        }
    }
}

/// One multiplexer frame: `[u8 kind][u32 stream BE][u32 len BE][payload]`.
/// Keepalive frames use stream id 0; logical streams start at 1.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream: u32) -> Self {
        Self { kind: FrameKind::Syn, stream, payload: Bytes::new() }
    }

    pub fn data(stream: u32, payload: Bytes) -> Self {
        Self { kind: FrameKind::Data, stream, payload }
    }

    pub fn fin(stream: u32) -> Self {
        Self { kind: FrameKind::Fin, stream, payload: Bytes::new() }
    }

    pub fn ping() -> Self {
        Self { kind: FrameKind::Ping, stream: 0, payload: Bytes::new() }
    }

    pub fn pong() -> Self {
        Self { kind: FrameKind::Pong, stream: 0, payload: Bytes::new() }
    }

    /// Credit `delta` bytes back to the peer's send window for `stream`.
    pub fn window(stream: u32, delta: u32) -> Self {
        Self {
            kind: FrameKind::Window,
            stream,
            payload: Bytes::copy_from_slice(&delta.to_be_bytes()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.stream.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode the next frame from the connection. `None` on clean EOF at a
    /// frame boundary.
    pub async fn read<R>(reader: &mut ConnReader<R>) -> Result<Option<Frame>, MuxError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        if !reader.read_exact_or_eof(&mut header).await? {
            return Ok(None);
        }
        let kind = FrameKind::from_wire(header[0])?;
        let stream = u32::from_be_bytes(header[1..5].try_into().unwrap());
        let len = u32::from_be_bytes(header[5..9].try_into().unwrap());
        if len as usize > MAX_FRAME_PAYLOAD {
            return Err(MuxError::Oversized(len));
        }
        let mut payload = vec![0u8; len as usize];
        if len > 0 && !reader.read_exact_or_eof(&mut payload).await? {
            return Err(MuxError::Closed);
        }
        Ok(Some(Frame { kind, stream, payload: Bytes::from(payload) }))
    }
}
