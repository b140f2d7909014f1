use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{accept4, recv, send, MsgFlags, SockFlag};
use zerocopy::AsBytes;

use super::registry::{CallbackKind, CallbackRecord, Verdict};
use super::Shared;
use crate::buffer::ByteBuf;
use crate::proto::{FrameHead, FRAME_HEADER_LEN, RESP_STATUS_LEN};
use crate::service::Message;

/// Read chunk per handler invocation.
const READ_CHUNK: usize = 8 * 1024;

/// One accepted connection: the socket plus its receive and send buffers.
/// The socket closes when the record owning this is dropped.
pub(crate) struct Connection {
    fd: OwnedFd,
    incoming: ByteBuf,
    outgoing: ByteBuf,
}

/// Accept handler. The listener stays registered whatever happens here.
pub(crate) fn accept_ready(listen_fd: RawFd, shared: &Shared) -> Verdict {
    let fd = match accept4(listen_fd, SockFlag::SOCK_NONBLOCK) {
        Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
        Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Verdict::Keep,
        Err(e) => {
            warn!("rpc[{}]: accept() failed: {}", listen_fd, e);
            return Verdict::Keep;
        }
    };
    debug!("rpc[{}]: client connect ({})", listen_fd, fd.as_raw_fd());

    let raw = fd.as_raw_fd();
    let conn = Connection { fd, incoming: ByteBuf::new(), outgoing: ByteBuf::new() };
    let mut lists = shared.lists.lock().unwrap();
    lists.push_pending(CallbackRecord { fd: raw, kind: CallbackKind::Conn(conn) });
    Verdict::Keep
}

impl Connection {
    /// Connection handler: pull bytes off the socket, then dispatch every
    /// complete frame in arrival order. Any protocol or read error drops
    /// this connection only.
    pub(crate) fn on_readable(&mut self, shared: &Shared) -> Verdict {
        let raw = self.fd.as_raw_fd();
        let mut chunk = [0u8; READ_CHUNK];
        let n = match recv(raw, &mut chunk, MsgFlags::empty()) {
            Ok(0) => {
                debug!("rpc[{}]: connection closed", raw);
                return Verdict::Drop;
            }
            Ok(n) => n,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Verdict::Keep,
            Err(e) => {
                warn!("rpc[{}]: read() failed: {}", raw, e);
                return Verdict::Drop;
            }
        };
        self.incoming.append(&chunk[..n]);
        trace!("rpc[{}]: read {} bytes ({} total)", raw, n, self.incoming.len());

        while self.incoming.len() >= FRAME_HEADER_LEN {
            let head = match FrameHead::decode(self.incoming.as_ref()) {
                Some(h) => *h,
                None => break,
            };
            let body_len = head.message_length.get() as usize;
            if self.incoming.len() < FRAME_HEADER_LEN + body_len {
                trace!("rpc[{}]: more data", raw);
                break;
            }
            trace!("rpc[{}]: recv req: {}", raw, head);

            let service = shared.service.as_ref();
            let descriptor = service.descriptor();
            if head.method_index.get() as usize >= descriptor.n_methods() {
                warn!("rpc[{}]: bad method_index {}", raw, head.method_index.get());
                return Verdict::Drop;
            }
            let method = &descriptor.methods[head.method_index.get() as usize];
            let payload = &self.incoming.as_ref()[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
            let message = match method.input.unpack(payload) {
                Ok(m) => m,
                Err(()) => {
                    warn!(
                        "rpc[{}]: unable to unpack message ({})",
                        raw,
                        head.method_index.get()
                    );
                    return Verdict::Drop;
                }
            };
            self.incoming.consume(FRAME_HEADER_LEN + body_len);

            // The service replies from inside this call; the sink frames the
            // response and drains it before returning.
            let sink = ReplySink {
                fd: self.fd.as_fd(),
                outgoing: &mut self.outgoing,
                method_index: head.method_index.get(),
                request_id: head.request_id.get(),
            };
            service.invoke(head.method_index.get(), message, sink);
        }
        Verdict::Keep
    }
}

/// One-shot response channel handed to [Service::invoke](crate::Service::invoke).
/// Consuming it with [ReplySink::respond] frames the reply into the
/// connection's send buffer and drains the buffer to the socket; dropping
/// it unconsumed leaves the request unanswered.
pub struct ReplySink<'a> {
    fd: BorrowedFd<'a>,
    outgoing: &'a mut ByteBuf,
    method_index: u32,
    request_id: u32,
}

impl ReplySink<'_> {
    pub fn method_index(&self) -> u32 {
        self.method_index
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Send `message` back to the peer, or record a failure sentinel
    /// (`None`) without sending anything.
    pub fn respond(self, message: Option<&dyn Message>) {
        let raw = self.fd.as_raw_fd();
        let Some(message) = message else {
            warn!("rpc[{}]: service reported failure for request {}", raw, self.request_id);
            return;
        };
        let head =
            FrameHead::new(self.method_index, message.packed_size() as u32, self.request_id);
        trace!("rpc[{}]: send resp: {}", raw, head);

        let start = self.outgoing.len();
        self.outgoing.append(&[0u8; RESP_STATUS_LEN]);
        self.outgoing.append(head.as_bytes());
        let written = message.pack(self.outgoing);
        if written != head.message_length.get() as usize {
            error!("rpc[{}]: error serializing the response", raw);
            self.outgoing.truncate(start);
            return;
        }
        drain(self.fd, self.outgoing);
    }
}

/// Drain the send buffer to the socket. Write errors terminate the write
/// silently; the read side notices the dead peer.
fn drain(fd: BorrowedFd, outgoing: &mut ByteBuf) {
    let raw = fd.as_raw_fd();
    while !outgoing.is_empty() {
        match send(raw, outgoing.as_ref(), MsgFlags::MSG_NOSIGNAL) {
            Ok(0) => {
                debug!("rpc[{}]: connection closed", raw);
                outgoing.clear();
                return;
            }
            Ok(n) => {
                trace!("rpc[{}]: wrote {} of {} bytes", raw, n, outgoing.len());
                outgoing.consume(n);
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                debug!("rpc[{}]: send() failed: {}", raw, e);
                outgoing.clear();
                return;
            }
        }
    }
}
