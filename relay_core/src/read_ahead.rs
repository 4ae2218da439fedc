//! Bounded read-ahead over a parked sender stream

use crate::session::ByteSource;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::poll_read_buf;

/// Sender stream waiting for its receiver.
///
/// Polling [`ReadAhead::poll_fill`] keeps the underlying body moving so a
/// sender that disconnects while parked shows up as an error. At most
/// `capacity` bytes are ever held; the copy step drains them before reading
/// the stream itself.
pub(crate) struct ReadAhead {
    inner: ByteSource,
    buf: BytesMut,
    capacity: usize,
    eof: bool,
}

impl ReadAhead {
    pub(crate) fn new(inner: ByteSource, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            eof: false,
        }
    }

    /// Read until `capacity` bytes are buffered or the stream ends
    pub(crate) fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.eof && self.buf.len() < self.capacity {
            let room = self.capacity - self.buf.len();
            let mut limited = (&mut self.buf).limit(room);
            let n = ready!(poll_read_buf(Pin::new(&mut self.inner), cx, &mut limited))?;
            if n == 0 {
                self.eof = true;
            }
        }
        Poll::Ready(Ok(()))
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl AsyncRead for ReadAhead {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let n = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}
