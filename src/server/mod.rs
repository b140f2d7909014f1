mod conn;
mod registry;
mod worker;

pub use conn::ReplySink;

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossfire::{MRx, MTx};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{pipe, read, unlink, write};

use crate::config::ServerConfig;
use crate::error::RpcError;
use crate::net::{self, Endpoint};
use crate::service::Service;
use registry::{CallbackKind, CallbackRecord, Lists, Verdict};

/// State shared between the event loop and the workers.
pub(crate) struct Shared {
    running: AtomicBool,
    pub(crate) service: Arc<dyn Service>,
    pub(crate) lists: Mutex<Lists>,
    /// Write end of the self-pipe; present only with a worker pool.
    wake_w: Option<OwnedFd>,
}

impl Shared {
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake();
    }

    /// Write one byte to the self-pipe so the loop re-reads the pending
    /// list.
    pub(crate) fn wake(&self) {
        if let Some(w) = self.wake_w.as_ref() {
            if write(w.as_fd(), &[0u8]) != Ok(1) {
                error!("rpc: failed to wake server");
            }
        }
    }
}

struct ListenSocket {
    endpoint: Endpoint,
    fd: OwnedFd,
}

/// A poll-driven RPC server.
///
/// The server is an owned value: it holds its listen sockets, the
/// pending/working registration lists and (optionally) a worker pool, so
/// independent instances can coexist in one process. [provide_service] is
/// the one-call wrapper covering the common bind-and-run cycle.
pub struct RpcServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    sockets: Vec<ListenSocket>,
    /// Read end of the self-pipe; registered as the first pending record.
    wake_r: Option<OwnedFd>,
    job_tx: Option<MTx<()>>,
    job_rx: Option<MRx<()>>,
}

impl RpcServer {
    /// Failure to create the self-pipe is fatal to construction.
    pub fn new(service: Arc<dyn Service>, config: ServerConfig) -> Result<Self, RpcError> {
        let mut lists = Lists::new();
        let mut wake_r = None;
        let mut wake_w = None;
        let mut job_tx = None;
        let mut job_rx = None;
        if config.num_workers > 0 {
            let (r, w) = pipe().map_err(|e| {
                error!("rpc: failed to create wake pipe: {}", e);
                RpcError::Socket
            })?;
            // The sentinel holds poll slot 0 for the server's lifetime.
            lists.push_pending(CallbackRecord { fd: r.as_raw_fd(), kind: CallbackKind::Wake });
            wake_r = Some(r);
            wake_w = Some(w);
            let (tx, rx) = crossfire::mpmc::unbounded_blocking::<()>();
            job_tx = Some(tx);
            job_rx = Some(rx);
        }
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                service,
                lists: Mutex::new(lists),
                wake_w,
            }),
            sockets: Vec::new(),
            wake_r,
            job_tx,
            job_rx,
        })
    }

    /// Bind a listen endpoint and register its accept handler.
    pub fn bind_url(&mut self, url: &str) -> Result<(), RpcError> {
        let endpoint = Endpoint::parse(url)?;
        let fd = net::open_stream_socket(&endpoint)?;
        net::bind_and_listen(&fd, &endpoint, self.config.backlog)?;
        info!("rpc: listening on {}", endpoint);
        let raw = fd.as_raw_fd();
        self.sockets.push(ListenSocket { endpoint, fd });
        self.shared
            .lists
            .lock()
            .unwrap()
            .push_pending(CallbackRecord { fd: raw, kind: CallbackKind::Accept });
        Ok(())
    }

    /// Close the listen socket bound to `url` and drop its accept record.
    /// Returns whether a matching endpoint was found.
    pub fn unbind_url(&mut self, url: &str) -> bool {
        let Ok(endpoint) = Endpoint::parse(url) else { return false };
        let Some(i) = self.sockets.iter().position(|s| s.endpoint == endpoint) else {
            return false;
        };
        let sock = self.sockets.remove(i);
        self.shared.lists.lock().unwrap().remove_pending_by_fd(sock.fd.as_raw_fd());
        drop(sock.fd);
        if let Endpoint::Unix(path) = &sock.endpoint {
            let _ = unlink(path.as_path());
        }
        info!("rpc: unbound {}", endpoint);
        true
    }

    /// Run the event loop until the stop source fires (or a handler calls
    /// for shutdown), then tear everything down: workers drained and
    /// joined, listen sockets closed, unix paths unlinked, lists freed.
    pub fn run(&mut self, stop_fd: Option<OwnedFd>) -> Result<(), RpcError> {
        let mut workers = Vec::new();
        if self.config.num_workers > 0 {
            if let Some(rx) = self.job_rx.as_ref() {
                workers = worker::spawn_workers(&self.shared, self.config.num_workers, rx);
            }
        }
        if let Some(stop) = stop_fd.as_ref() {
            self.shared
                .lists
                .lock()
                .unwrap()
                .push_pending(CallbackRecord { fd: stop.as_raw_fd(), kind: CallbackKind::Stop });
        }

        while self.shared.is_running() {
            if self.config.num_workers > 0 {
                self.poll_once_pooled();
            } else {
                self.poll_once_inline();
            }
        }

        self.teardown(workers);
        Ok(())
    }

    /// One pooled iteration: snapshot pending, poll with no timeout, then
    /// migrate ready records to the working list and post one token each.
    fn poll_once_pooled(&self) {
        let (fds, version) = {
            let lists = self.shared.lists.lock().unwrap();
            (lists.pending.iter().map(|r| r.fd).collect::<Vec<RawFd>>(), lists.version)
        };
        trace!("rpc: waiting for {} events", fds.len());
        let ready = match poll_batch(&fds) {
            Some(r) => r,
            None => return,
        };

        // Slot 0 is the self-pipe: woken for a list change, not for work.
        if let Some(wake_r) = self.wake_r.as_ref() {
            if ready[0] && fds[0] == wake_r.as_raw_fd() {
                let mut byte = [0u8; 1];
                let _ = read(wake_r.as_raw_fd(), &mut byte);
                return;
            }
        }

        let mut lists = self.shared.lists.lock().unwrap();
        if lists.version != version {
            // A handler running in a worker changed the list meanwhile.
            return;
        }
        let Some(tx) = self.job_tx.as_ref() else { return };
        let mut removed = 0;
        for (i, is_ready) in ready.iter().enumerate() {
            if !is_ready {
                continue;
            }
            let pos = i - removed;
            if !lists.pending[pos].dispatchable() {
                continue;
            }
            trace!("rpc: event for fd {}", lists.pending[pos].fd);
            lists.move_to_working(pos);
            removed += 1;
            if tx.send(()).is_err() {
                break;
            }
        }
    }

    /// One single-threaded iteration: the whole pending list becomes the
    /// working set, ready handlers run inline, keepers are re-parked in
    /// order ahead of anything registered during the sweep.
    fn poll_once_inline(&self) {
        let fds: Vec<RawFd> =
            self.shared.lists.lock().unwrap().pending.iter().map(|r| r.fd).collect();
        trace!("rpc: waiting for {} events", fds.len());
        let ready = match poll_batch(&fds) {
            Some(r) => r,
            None => return,
        };

        let working = self.shared.lists.lock().unwrap().take_pending();
        let mut kept = Vec::with_capacity(working.len());
        for (i, mut rec) in working.into_iter().enumerate() {
            if ready.get(i).copied().unwrap_or(false) {
                trace!("rpc: callback for fd {}", rec.fd);
                match rec.dispatch(&self.shared) {
                    Verdict::Keep => kept.push(rec),
                    Verdict::Drop => drop(rec),
                }
            } else {
                kept.push(rec);
            }
        }
        let mut lists = self.shared.lists.lock().unwrap();
        let registered_during_sweep = lists.take_pending();
        for rec in kept {
            lists.push_pending(rec);
        }
        for rec in registered_during_sweep {
            lists.push_pending(rec);
        }
    }

    fn teardown(&mut self, workers: Vec<JoinHandle<()>>) {
        debug!("rpc: shutting down");
        // One token per worker unblocks everyone parked on the channel;
        // in-flight handlers run to completion before the join returns.
        if let Some(tx) = self.job_tx.as_ref() {
            for _ in 0..workers.len() {
                let _ = tx.send(());
            }
        }
        for handle in workers {
            if handle.join().is_err() {
                warn!("rpc: worker panicked during shutdown");
            }
        }
        for sock in self.sockets.drain(..) {
            if let Endpoint::Unix(path) = &sock.endpoint {
                let _ = unlink(path.as_path());
            }
        }
        let mut lists = self.shared.lists.lock().unwrap();
        lists.pending.clear();
        lists.working.clear();
    }
}

/// Poll the batch for readability with no timeout. `None` restarts the
/// iteration on a poll failure (e.g. `EINTR`).
fn poll_batch(fds: &[RawFd]) -> Option<Vec<bool>> {
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
        .collect();
    if let Err(e) = poll(&mut pollfds, PollTimeout::NONE) {
        debug!("rpc: polling error: {}", e);
        return None;
    }
    Some(
        pollfds
            .iter()
            .map(|p| p.revents().map(|r| !r.is_empty()).unwrap_or(false))
            .collect(),
    )
}

/// Bind `url`, serve `service` until the stop source becomes readable,
/// then tear down. `stop_fd` is the read end of a pipe (see
/// [stop_pipe](crate::net::stop_pipe)); without one the server runs until
/// the process exits.
pub fn provide_service(
    url: &str, service: Arc<dyn Service>, config: ServerConfig, stop_fd: Option<OwnedFd>,
) -> Result<(), RpcError> {
    let mut server = RpcServer::new(service, config)?;
    server.bind_url(url)?;
    server.run(stop_fd)
}
