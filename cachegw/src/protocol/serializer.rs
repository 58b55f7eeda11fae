// (c) 2025 The cachegw authors

//! Message serializer with a process-wide reuse pool
//!
//! A [`Serializer`] is a growable byte buffer with a write cursor. Response
//! construction is: `begin_message`, some number of `add_*_field` calls,
//! then either take [`bytes`](Serializer::bytes) and write them out, or (for
//! large Get payloads) [`finalize_streaming`](Serializer::finalize_streaming),
//! which flushes the buffered prefix and copies the payload straight from
//! the backend reader to the socket so peak memory stays at the size of the
//! response prefix, not the object.
//!
//! [`acquire`] checks an instance out of the pool; dropping the guard resets
//! it and puts it back. Borrows into the buffer cannot outlive the guard,
//! so "no views into a released serializer" holds by construction.

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::{self, WireError};
use super::{tags, HEADER_SIZE, MAX_FIELD_SIZE};
use crate::util::io::copy_exact;

const INITIAL_CAPACITY: usize = 1024;
const POOL_LIMIT: usize = 64;

static POOL: Mutex<Vec<Serializer>> = Mutex::new(Vec::new());

/// Checks a serializer out of the process-wide pool.
///
/// Instances retain their grown capacity across uses, so steady-state
/// serving does not allocate per response.
pub fn acquire() -> PooledSerializer {
    let inner = POOL
        .lock()
        .expect("serializer pool poisoned")
        .pop()
        .unwrap_or_else(Serializer::new);
    PooledSerializer { inner: Some(inner) }
}

/// Pool checkout guard. Derefs to [`Serializer`].
#[derive(Debug)]
pub struct PooledSerializer {
    inner: Option<Serializer>,
}

impl Deref for PooledSerializer {
    type Target = Serializer;
    fn deref(&self) -> &Serializer {
        self.inner.as_ref().expect("serializer taken")
    }
}

impl DerefMut for PooledSerializer {
    fn deref_mut(&mut self) -> &mut Serializer {
        self.inner.as_mut().expect("serializer taken")
    }
}

impl Drop for PooledSerializer {
    fn drop(&mut self) {
        if let Some(mut s) = self.inner.take() {
            s.reset();
            let mut pool = match POOL.lock() {
                Ok(pool) => pool,
                Err(_) => return,
            };
            if pool.len() < POOL_LIMIT {
                pool.push(s);
            }
        }
    }
}

/// Serializer-side failures.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// `begin_message` called with bytes already in the buffer.
    #[error("message already begun; reset first")]
    AlreadyBegun,
    /// Field payload exceeds [`MAX_FIELD_SIZE`].
    #[error(transparent)]
    Wire(#[from] WireError),
    /// A reader-sourced field yielded fewer bytes than declared.
    #[error("expected {expected} bytes from reader, got {got}")]
    ShortRead { expected: u64, got: u64 },
    /// Underlying I/O failure while streaming from a reader.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Growable TLV message buffer. See the [module docs](self).
#[derive(Debug)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer {
    /// Creates an unpooled serializer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Restores the write cursor to zero. Capacity is retained.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Current message length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written since the last reset.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes the 4-byte frame header.
    ///
    /// Fails if a message is already in progress; call
    /// [`reset`](Serializer::reset) between messages.
    pub fn begin_message(
        &mut self,
        version: u8,
        field_count: u8,
        msg_type: u16,
    ) -> Result<(), SerializeError> {
        if !self.buf.is_empty() {
            return Err(SerializeError::AlreadyBegun);
        }
        self.buf.reserve(HEADER_SIZE);
        self.buf.push(version);
        self.buf.push(field_count);
        self.buf.extend_from_slice(&msg_type.to_le_bytes());
        Ok(())
    }

    /// Appends a field with a raw byte payload.
    pub fn add_field(&mut self, tag: u8, data: &[u8]) -> Result<(), SerializeError> {
        let len = data.len() as u64;
        self.add_field_header(tag, len)?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Appends a single-byte field.
    pub fn add_u8_field(&mut self, tag: u8, value: u8) -> Result<(), SerializeError> {
        self.add_field(tag, &[value])
    }

    /// Appends a little-endian u32 field.
    pub fn add_u32_field(&mut self, tag: u8, value: u32) -> Result<(), SerializeError> {
        self.add_field(tag, &value.to_le_bytes())
    }

    /// Appends a boolean field (one byte, 0 or 1).
    pub fn add_bool_field(&mut self, tag: u8, value: bool) -> Result<(), SerializeError> {
        self.add_field(tag, &[u8::from(value)])
    }

    /// Appends a field whose payload is drawn from `reader`.
    ///
    /// Exactly `length` bytes are read directly into the buffer; a source
    /// that runs dry early is an error and leaves the buffer poisoned (the
    /// caller is expected to reset or discard).
    pub async fn add_field_from_reader<R>(
        &mut self,
        tag: u8,
        reader: &mut R,
        length: u64,
    ) -> Result<(), SerializeError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.add_field_header(tag, length)?;
        let start = self.buf.len();
        let length_usize = usize::try_from(length).map_err(|_| WireError::FieldTooLarge(length))?;
        self.buf.resize(start + length_usize, 0);
        let mut filled = 0usize;
        while filled < length_usize {
            let n = reader.read(&mut self.buf[start + filled..]).await?;
            if n == 0 {
                return Err(SerializeError::ShortRead {
                    expected: length,
                    got: filled as u64,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Large-payload path for Get responses.
    ///
    /// Appends the Value field header (tag + length) to the buffer, flushes
    /// the entire buffered prefix to `sink`, then copies exactly `length`
    /// payload bytes from `reader` to `sink`. The serializer is reset
    /// afterwards. The reader is consumed (and closed on drop).
    pub async fn finalize_streaming<W, R>(
        &mut self,
        sink: &mut W,
        reader: R,
        length: u64,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        self.add_field_header(tags::VALUE, length)?;
        sink.write_all(&self.buf)
            .await
            .context("writing response prefix")?;
        let copied = copy_exact(reader, sink, length)
            .await
            .context("streaming value payload")?;
        anyhow::ensure!(
            copied == length,
            "value stream ended early: {copied} of {length} bytes"
        );
        sink.flush().await?;
        self.reset();
        Ok(())
    }

    fn add_field_header(&mut self, tag: u8, length: u64) -> Result<(), SerializeError> {
        if length > MAX_FIELD_SIZE {
            return Err(WireError::FieldTooLarge(length).into());
        }
        self.buf.reserve(1 + wire::encoded_length_size(length));
        self.buf.push(tag);
        wire::encode_length(&mut self.buf, length);
        Ok(())
    }
}
