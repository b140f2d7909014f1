use bytes::{Buf, BytesMut};

/// Growable byte buffer with front-consume semantics.
///
/// A receive buffer accumulates raw socket bytes; once a frame is consumed
/// the tail moves to the front in order. A send buffer is drained through
/// the same front cursor as `send` accepts bytes.
#[derive(Default)]
pub struct ByteBuf {
    buf: BytesMut,
}

impl ByteBuf {
    #[inline]
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    #[inline]
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: BytesMut::with_capacity(cap) }
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop `n` consumed bytes from the front. Bytes past them keep their
    /// order.
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    #[inline]
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl AsRef<[u8]> for ByteBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
