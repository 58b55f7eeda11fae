// (c) 2025 The cachegw authors

//! Async I/O helpers

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size. Large enough to keep syscall counts down on bulk
/// payloads without holding a meaningful fraction of an object in memory.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copies exactly `length` bytes from `reader` to `writer` through a
/// bounded buffer, returning the number of bytes copied.
///
/// Stops early (with a short count) if the reader reaches EOF; callers that
/// require the full length must check the return value.
pub async fn copy_exact<R, W>(mut reader: R, writer: &mut W, length: u64) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(usize::try_from(length).unwrap_or(COPY_BUFFER_SIZE))];
    let mut remaining = length;
    let mut copied = 0u64;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        copied += n as u64;
        remaining -= n as u64;
    }
    Ok(copied)
}
