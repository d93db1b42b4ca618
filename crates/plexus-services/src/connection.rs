//! Framed packet I/O over any async byte stream.
//!
//! A connection is split into a `FrameReader` and a `FrameWriter` so one leg
//! task can read and write without locking. Each half carries its own
//! direction's cipher once encryption is enabled.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use plexus_core::cipher::{CipherError, FrameDecryptor, FrameEncryptor};
use plexus_core::wire::{encode_frame, split_frame, Frame, FLAG_ENCRYPTED};
use plexus_core::{Packet, SymmetricKey};

use crate::error::RelayError;

const READ_CHUNK: usize = 8 * 1024;

/// Split a stream into framed halves.
pub fn split<S>(stream: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r), FrameWriter::new(w))
}

// ── Reader ────────────────────────────────────────────────────────────────────

pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    decryptor: Option<FrameDecryptor>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            decryptor: None,
        }
    }

    /// Read the next packet. `Ok(None)` on clean end of stream.
    ///
    /// Cancel-safe: partial frames stay buffered, so this can sit in a
    /// `select!` next to other branches without losing bytes.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, RelayError> {
        loop {
            if let Some(frame) = split_frame(&mut self.buf)? {
                return self.open(frame).map(Some);
            }
            self.buf.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Decrypt every frame from now on.
    pub fn enable_encryption(&mut self, key: &SymmetricKey) {
        self.decryptor = Some(FrameDecryptor::new(key));
    }

    pub fn is_encrypted(&self) -> bool {
        self.decryptor.is_some()
    }

    fn open(&mut self, frame: Frame) -> Result<Packet, RelayError> {
        let body = match (&mut self.decryptor, frame.is_encrypted()) {
            (Some(decryptor), true) => Bytes::from(decryptor.open(&frame.body)?),
            (None, false) => frame.body,
            (None, true) => return Err(CipherError::UnexpectedEncrypted.into()),
            (Some(_), false) => return Err(CipherError::UnexpectedPlaintext.into()),
        };
        Ok(Packet::decode(body)?)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
    encryptor: Option<FrameEncryptor>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            encryptor: None,
        }
    }

    /// Write one packet, encrypting it if encryption is on.
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), RelayError> {
        self.buf.clear();
        match &mut self.encryptor {
            Some(encryptor) => {
                let sealed = encryptor.seal(packet.as_bytes());
                encode_frame(&mut self.buf, FLAG_ENCRYPTED, &sealed)?;
            }
            None => encode_frame(&mut self.buf, 0, packet.as_bytes())?,
        }
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encrypt every frame from now on.
    pub fn enable_encryption(&mut self, key: &SymmetricKey) {
        self.encryptor = Some(FrameEncryptor::new(key));
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
