//! Authenticated-encryption record framing.
//!
//! Once a session key exists, every byte on the connection travels inside a
//! length-prefixed record: `[u32 BE length][12-byte nonce][ciphertext+tag]`.
//! The nonce is built from the sender's private monotonically increasing
//! counter, little-endian in the low eight bytes. Each direction keeps its own
//! counter; a counter is never shared, duplicated, or allowed to wrap.

use bytes::{Buf, BytesMut};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::SessionKey;
use crate::error::FramingError;

pub const RECORD_NONCE_LEN: usize = 12;
pub const RECORD_TAG_LEN: usize = 16;
/// Upper bound on the framed payload (nonce + ciphertext + tag).
pub const MAX_RECORD_LEN: usize = 64 * 1024;
/// Largest plaintext that fits a single record.
pub const MAX_PLAINTEXT_LEN: usize = MAX_RECORD_LEN - RECORD_NONCE_LEN - RECORD_TAG_LEN;

/// Sealing half of the record layer. Owns the outbound counter.
pub struct RecordSealer {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl RecordSealer {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    /// Encrypt one plaintext into `nonce || ciphertext+tag`.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, FramingError> {
        debug_assert!(plaintext.len() <= MAX_PLAINTEXT_LEN);
        if self.counter == u64::MAX {
            return Err(FramingError::CounterExhausted);
        }
        let mut nonce_bytes = [0u8; RECORD_NONCE_LEN];
        nonce_bytes[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| FramingError::Aead)?;

        let mut record = Vec::with_capacity(RECORD_NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }
}

/// Opening half of the record layer. The nonce travels with each record, so
/// no inbound counter state is required.
pub struct RecordOpener {
    cipher: ChaCha20Poly1305,
}

impl RecordOpener {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Decrypt one record. Any authentication failure is terminal for the
    /// connection; there is no partial output.
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>, FramingError> {
        if record.len() < RECORD_NONCE_LEN + RECORD_TAG_LEN {
            return Err(FramingError::BadLength(record.len() as u32));
        }
        let (nonce, ciphertext) = record.split_at(RECORD_NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FramingError::Aead)
    }
}

/// Read half of an encrypted connection: decodes records and hands out the
/// decrypted bytes with plain byte-stream semantics.
pub struct SecureReader<R> {
    inner: R,
    opener: RecordOpener,
    pending: BytesMut,
}

impl<R> SecureReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, key: &SessionKey) -> Self {
        Self {
            inner,
            opener: RecordOpener::new(key),
            pending: BytesMut::new(),
        }
    }

    /// Read decrypted bytes. Returns 0 only on clean EOF at a record
    /// boundary; EOF inside a record is a framing error.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, FramingError> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pending.is_empty() {
            let len = match self.read_length_prefix().await? {
                Some(len) => len,
                None => return Ok(0),
            };
            if len == 0 || len as usize > MAX_RECORD_LEN {
                return Err(FramingError::BadLength(len));
            }
            let mut record = vec![0u8; len as usize];
            self.inner.read_exact(&mut record).await?;
            let plaintext = self.opener.open(&record)?;
            self.pending.extend_from_slice(&plaintext);
        }
        let n = self.pending.len().min(out.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }

    /// `None` means the peer closed cleanly before the next record.
    async fn read_length_prefix(&mut self) -> Result<Option<u32>, FramingError> {
        let mut buf = [0u8; 4];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FramingError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record length",
                )));
            }
            filled += n;
        }
        Ok(Some(u32::from_be_bytes(buf)))
    }
}

/// Write half of an encrypted connection.
pub struct SecureWriter<W> {
    inner: W,
    sealer: RecordSealer,
}

impl<W> SecureWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, key: &SessionKey) -> Self {
        Self {
            inner,
            sealer: RecordSealer::new(key),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), FramingError> {
        for chunk in data.chunks(MAX_PLAINTEXT_LEN) {
            let record = self.sealer.seal(chunk)?;
            self.inner
                .write_all(&(record.len() as u32).to_be_bytes())
                .await?;
            self.inner.write_all(&record).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

/// Read half of a connection after the handshake: either the raw socket or
/// the encrypted record layer. Encryption, once negotiated, wraps every byte;
/// there is no fallback to plaintext mid-connection.
pub enum ConnReader<R> {
    Plain(R),
    Secure(SecureReader<R>),
}

impl<R> ConnReader<R>
where
    R: AsyncRead + Unpin,
{
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FramingError> {
        match self {
            ConnReader::Plain(inner) => Ok(inner.read(buf).await?),
            ConnReader::Secure(inner) => inner.read(buf).await,
        }
    }

    /// Fill `buf` completely. `Ok(false)` reports clean EOF before the first
    /// byte; EOF mid-fill is an error.
    pub async fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, FramingError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(FramingError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                )));
            }
            filled += n;
        }
        Ok(true)
    }
}

pub enum ConnWriter<W> {
    Plain(W),
    Secure(SecureWriter<W>),
}

impl<W> ConnWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), FramingError> {
        match self {
            ConnWriter::Plain(inner) => {
                inner.write_all(data).await?;
                inner.flush().await?;
                Ok(())
            }
            ConnWriter::Secure(inner) => inner.write_all(data).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SessionKey {
        [3u8; 32]
    }

    #[test]
    fn seal_open_round_trip() {
        let mut sealer = RecordSealer::new(&test_key());
        let opener = RecordOpener::new(&test_key());
        for payload in [&b""[..], b"x", &[0xAAu8; MAX_PLAINTEXT_LEN]] {
            let record = sealer.seal(payload).unwrap();
            assert_eq!(opener.open(&record).unwrap(), payload);
        }
    }

    #[test]
    fn nonces_never_repeat_within_a_connection() {
        let mut sealer = RecordSealer::new(&test_key());
        let a = sealer.seal(b"same").unwrap();
        let b = sealer.seal(b"same").unwrap();
        assert_ne!(a[..RECORD_NONCE_LEN], b[..RECORD_NONCE_LEN]);
        assert_ne!(a[RECORD_NONCE_LEN..], b[RECORD_NONCE_LEN..]);
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let mut sealer = RecordSealer::new(&test_key());
        let opener = RecordOpener::new(&test_key());
        let record = sealer.seal(b"attack at dawn").unwrap();
        // Flip one bit at a time across nonce, ciphertext, and tag.
        for byte in 0..record.len() {
            for bit in 0..8 {
                let mut tampered = record.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(opener.open(&tampered), Err(FramingError::Aead)),
                    "bit {bit} of byte {byte} went undetected"
                );
            }
        }
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let mut sealer = RecordSealer::new(&test_key());
        let opener = RecordOpener::new(&[9u8; 32]);
        let record = sealer.seal(b"secret").unwrap();
        assert!(matches!(opener.open(&record), Err(FramingError::Aead)));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let opener = RecordOpener::new(&test_key());
        assert!(matches!(
            opener.open(&[0u8; RECORD_NONCE_LEN + RECORD_TAG_LEN - 1]),
            Err(FramingError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn stream_round_trip_including_boundary_sizes() {
        for size in [0usize, 1, 10 * 1024, MAX_PLAINTEXT_LEN, 64 * 1024] {
            let (client, server) = tokio::io::duplex(256 * 1024);
            let (read_half, _w) = tokio::io::split(server);
            let (_r, write_half) = tokio::io::split(client);
            let mut writer = SecureWriter::new(write_half, &test_key());
            let mut reader = SecureReader::new(read_half, &test_key());

            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            writer.write_all(&payload).await.unwrap();
            drop(writer);

            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            assert_eq!(received, payload, "payload size {size}");
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_a_protocol_violation() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (read_half, _w) = tokio::io::split(server);
        let mut reader = SecureReader::new(read_half, &test_key());

        let bad_len = (MAX_RECORD_LEN as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &bad_len)
            .await
            .unwrap();
        assert!(matches!(
            reader.read(&mut [0u8; 16]).await,
            Err(FramingError::BadLength(_))
        ));
    }

    #[tokio::test]
    async fn zero_length_prefix_is_a_protocol_violation() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (read_half, _w) = tokio::io::split(server);
        let mut reader = SecureReader::new(read_half, &test_key());

        tokio::io::AsyncWriteExt::write_all(&mut client, &0u32.to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            reader.read(&mut [0u8; 16]).await,
            Err(FramingError::BadLength(0))
        ));
    }
}
