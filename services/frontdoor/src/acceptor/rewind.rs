//! Replay of bytes read while sniffing.
//!
//! Transports that cannot peek hand out bytes only once. [`RewindBuffer`]
//! keeps every chunk read before the header decision; [`RewindBuffer::cut`]
//! drops the header and yields a [`Rewind`] stream that serves the remaining
//! bytes before reading live from the transport again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Append-only byte buffer, in arrival order.
///
/// Chunks are appended to one contiguous region so the sniffer can probe the
/// whole prefix on every delivery without re-joining.
#[derive(Debug, Default)]
pub struct RewindBuffer {
    buf: BytesMut,
}

impl RewindBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Total buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// All buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the first `offset` bytes and chain what is left in front of
    /// `live`.
    ///
    /// # Panics
    /// Panics if `offset` exceeds the buffered length.
    pub fn cut<S>(mut self, offset: usize, live: S) -> Rewind<S> {
        assert!(
            offset <= self.buf.len(),
            "cut offset {} past buffered length {}",
            offset,
            self.buf.len()
        );

        self.buf.advance(offset);
        Rewind::new(self.buf.freeze(), live)
    }
}

/// A stream that yields `prefix` before reading from `inner`.
///
/// Writes go straight to `inner`.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// A stream with nothing to replay.
    pub fn passthrough(inner: S) -> Self {
        Self::new(Bytes::new(), inner)
    }

    /// Bytes not yet replayed.
    pub fn pending(&self) -> &[u8] {
        &self.prefix
    }

    /// Give back the unread prefix and the inner stream.
    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
