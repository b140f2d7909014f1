use std::fmt;
use std::mem::size_of;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type U32Le = U32<LittleEndian>;

/// Request frame:
///
/// Fixed len of FrameHead = 12B
/// | 4B           | 4B             | 4B         |
/// | method_index | message_length | request_id |
///
/// each little-endian u32, followed by `message_length` bytes of opaque
/// payload. No magic, no version, no checksum.
///
/// Response frame: 4 bytes of reserved status (always zero), then the same
/// header echoing `method_index`/`request_id` and carrying the reply's
/// `message_length`, then the payload.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, PartialEq, Eq, Clone, Copy)]
#[repr(C)]
pub struct FrameHead {
    pub method_index: U32Le,
    pub message_length: U32Le,
    pub request_id: U32Le,
}

pub const FRAME_HEADER_LEN: usize = size_of::<FrameHead>();

/// Reserved status word prefixed to every response frame. Unused by this
/// runtime, always zero on the wire.
pub const RESP_STATUS_LEN: usize = size_of::<u32>();

impl FrameHead {
    #[inline]
    pub fn new(method_index: u32, message_length: u32, request_id: u32) -> Self {
        Self {
            method_index: U32Le::new(method_index),
            message_length: U32Le::new(message_length),
            request_id: U32Le::new(request_id),
        }
    }

    /// Borrow a header from the first 12 bytes of `buf`. `None` when short.
    #[inline(always)]
    pub fn decode(buf: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(buf)
    }
}

impl fmt::Display for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[id:{}, method:{}, len:{}]",
            self.request_id.get(),
            self.method_index.get(),
            self.message_length.get(),
        )
    }
}

impl fmt::Debug for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
