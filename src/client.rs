use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{recv, send, MsgFlags};
use zerocopy::AsBytes;

use crate::buffer::ByteBuf;
use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::net::{self, Endpoint};
use crate::proto::{FrameHead, FRAME_HEADER_LEN, RESP_STATUS_LEN};
use crate::service::{Message, ServiceDescriptor};

const READ_CHUNK: usize = 8 * 1024;

/// Client-side connection issuing one request at a time; a mutex holds the
/// connection for the whole round-trip. The socket closes on drop.
pub struct RpcClient {
    descriptor: ServiceDescriptor,
    config: ClientConfig,
    inner: Mutex<ClientInner>,
}

struct ClientInner {
    fd: OwnedFd,
    request_id: u32,
}

impl RpcClient {
    /// Open a non-blocking stream socket to `url`. A connect still in
    /// progress counts as success; the first send completes the handshake
    /// or surfaces the failure.
    pub fn connect(
        url: &str, descriptor: ServiceDescriptor, config: ClientConfig,
    ) -> Result<Self, RpcError> {
        let endpoint = Endpoint::parse(url)?;
        let fd = net::connect_stream(&endpoint)?;
        debug!("rpc[{}]: connected to {}", fd.as_raw_fd(), endpoint);
        Ok(Self { descriptor, config, inner: Mutex::new(ClientInner { fd, request_id: 0 }) })
    }

    #[inline]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Issue one request and block for the matching reply. `done` is
    /// called exactly once: with the unpacked reply on success, or `None`
    /// on send failure, read failure, protocol error or timeout.
    pub fn invoke<F>(&self, method_index: u32, input: &dyn Message, done: F)
    where
        F: FnOnce(Option<Box<dyn Message>>),
    {
        // One at a time please.
        let mut inner = self.inner.lock().unwrap();
        let raw = inner.fd.as_raw_fd();
        inner.request_id = inner.request_id.wrapping_add(1);
        let head = FrameHead::new(method_index, input.packed_size() as u32, inner.request_id);

        let mut out = ByteBuf::with_capacity(FRAME_HEADER_LEN + input.packed_size());
        out.append(head.as_bytes());
        let written = input.pack(&mut out);
        if written != head.message_length.get() as usize {
            error!("rpc[{}]: error serializing the request", raw);
            drop(inner);
            done(None);
            return;
        }
        trace!("rpc[{}]: send req: {}", raw, head);

        if send_all(&inner.fd, &mut out).is_err() {
            drop(inner);
            done(None);
            return;
        }

        let result = self.read_response(&mut inner, method_index);
        drop(inner);
        match result {
            Ok(message) => done(Some(message)),
            Err(_) => done(None),
        }
    }

    /// Accumulate socket bytes until one whole response frame is present,
    /// bounded by the configured deadline, then unpack the body with the
    /// method's output schema.
    fn read_response(
        &self, inner: &mut ClientInner, method_index: u32,
    ) -> Result<Box<dyn Message>, RpcError> {
        let raw = inner.fd.as_raw_fd();
        let preamble = RESP_STATUS_LEN + FRAME_HEADER_LEN;
        let mut buf = ByteBuf::with_capacity(512);
        let deadline = Instant::now() + self.config.rpc_timeout;

        let body_len = loop {
            if buf.len() >= preamble {
                let head = FrameHead::decode(&buf.as_ref()[RESP_STATUS_LEN..])
                    .ok_or(RpcError::Protocol)?;
                let body_len = head.message_length.get() as usize;
                if buf.len() >= preamble + body_len {
                    trace!("rpc[{}]: recv resp: {}", raw, head);
                    break body_len;
                }
            }
            let remaining = deadline.checked_duration_since(Instant::now()).ok_or_else(|| {
                warn!("rpc[{}]: read() timeout", raw);
                RpcError::Timeout
            })?;
            wait_readable(inner.fd.as_fd(), remaining)?;
            let mut chunk = [0u8; READ_CHUNK];
            match recv(raw, &mut chunk, MsgFlags::empty()) {
                Ok(0) => {
                    debug!("rpc[{}]: connection closed", raw);
                    return Err(RpcError::Closed);
                }
                Ok(n) => {
                    buf.append(&chunk[..n]);
                    trace!("rpc[{}]: read {} bytes ({} total)", raw, n, buf.len());
                }
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => {
                    debug!("rpc[{}]: read() failed: {}", raw, e);
                    return Err(RpcError::Read);
                }
            }
        };

        let method = self.descriptor.method(method_index).ok_or(RpcError::Protocol)?;
        let payload = &buf.as_ref()[preamble..preamble + body_len];
        trace!("rpc[{}]: unpacking response ({} bytes)", raw, body_len);
        method.output.unpack(payload).map_err(|()| RpcError::Protocol)
    }
}

/// Send the whole buffer, retrying `EINTR` and waiting out `EAGAIN` (a
/// fresh socket may still be completing its non-blocking connect).
fn send_all(fd: &OwnedFd, out: &mut ByteBuf) -> Result<(), RpcError> {
    let raw = fd.as_raw_fd();
    while !out.is_empty() {
        match send(raw, out.as_ref(), MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => {
                debug!("rpc[{}]: connection closed", raw);
                return Err(RpcError::Closed);
            }
            Ok(n) => {
                trace!("rpc[{}]: wrote {} of {} bytes", raw, n, out.len());
                out.consume(n);
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => {
                let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLOUT)];
                let _ = poll(&mut fds, PollTimeout::NONE);
            }
            Err(e) => {
                warn!("rpc[{}]: send() failed: {}", raw, e);
                return Err(RpcError::Send);
            }
        }
    }
    Ok(())
}

/// Park until the socket is readable or `timeout` elapses; the caller's
/// deadline check decides whether a quiet wake is fatal.
fn wait_readable(fd: BorrowedFd, timeout: Duration) -> Result<(), RpcError> {
    // the deadline loop re-arms, so capping one wait at u16 millis is fine
    let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    let timeout = PollTimeout::from(ms);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(_) => Ok(()),
        Err(Errno::EINTR) => Ok(()),
        Err(e) => {
            debug!("rpc: poll failed: {}", e);
            Err(RpcError::Read)
        }
    }
}
