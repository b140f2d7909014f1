use std::os::fd::RawFd;

use super::conn::{self, Connection};
use super::Shared;

/// Outcome of one handler invocation.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum Verdict {
    /// Keep the record registered for readiness.
    Keep,
    /// Discard the record; owned resources close on drop.
    Drop,
}

pub(crate) enum CallbackKind {
    /// Listen socket: accept and register new connections.
    Accept,
    /// Established connection with its buffers.
    Conn(Connection),
    /// Stop source: readable means shut the server down.
    Stop,
    /// Self-pipe read end. Occupies a poll slot, never dispatched.
    Wake,
}

/// One (fd, handler) registration. Lives in exactly one of the pending
/// list, the working list, or the worker currently running it.
pub(crate) struct CallbackRecord {
    pub fd: RawFd,
    pub kind: CallbackKind,
}

impl CallbackRecord {
    #[inline]
    pub fn dispatchable(&self) -> bool {
        !matches!(self.kind, CallbackKind::Wake)
    }

    pub fn dispatch(&mut self, shared: &Shared) -> Verdict {
        match &mut self.kind {
            CallbackKind::Accept => conn::accept_ready(self.fd, shared),
            CallbackKind::Conn(c) => c.on_readable(shared),
            CallbackKind::Stop => {
                debug!("rpc: stop source readable, shutting down");
                shared.request_stop();
                Verdict::Drop
            }
            CallbackKind::Wake => Verdict::Keep,
        }
    }
}

/// The registration lists, guarded by the server mutex.
pub(crate) struct Lists {
    pub pending: Vec<CallbackRecord>,
    pub working: Vec<CallbackRecord>,
    /// Bumped on every pending mutation; the event loop discards poll
    /// batches whose version no longer matches.
    pub version: u64,
}

impl Lists {
    pub fn new() -> Self {
        Self { pending: Vec::new(), working: Vec::new(), version: 0 }
    }

    pub fn push_pending(&mut self, rec: CallbackRecord) {
        self.pending.push(rec);
        self.version = self.version.wrapping_add(1);
    }

    pub fn remove_pending_by_fd(&mut self, fd: RawFd) -> Option<CallbackRecord> {
        let i = self.pending.iter().position(|r| r.fd == fd)?;
        self.version = self.version.wrapping_add(1);
        Some(self.pending.remove(i))
    }

    /// Move `pending[index]` to the tail of the working list.
    pub fn move_to_working(&mut self, index: usize) {
        let rec = self.pending.remove(index);
        self.version = self.version.wrapping_add(1);
        self.working.push(rec);
    }

    pub fn take_first_working(&mut self) -> Option<CallbackRecord> {
        if self.working.is_empty() {
            None
        } else {
            Some(self.working.remove(0))
        }
    }

    /// Drain the whole pending list (single-threaded sweep).
    pub fn take_pending(&mut self) -> Vec<CallbackRecord> {
        self.version = self.version.wrapping_add(1);
        std::mem::take(&mut self.pending)
    }
}
