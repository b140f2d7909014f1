use std::sync::Arc;
use std::thread;

use crossfire::MRx;

use super::registry::Verdict;
use super::Shared;

/// Spawn the fixed worker pool. Each worker blocks on the token channel,
/// takes the first working record under the server mutex, and runs its
/// handler outside the lock.
pub(crate) fn spawn_workers(
    shared: &Arc<Shared>, count: usize, rx: &MRx<()>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let shared = shared.clone();
        let rx = rx.clone();
        let handle = thread::Builder::new()
            .name(format!("rpc-worker-{}", i))
            .spawn(move || worker_loop(shared, rx))
            .expect("failed to spawn rpc worker");
        handles.push(handle);
    }
    handles
}

fn worker_loop(shared: Arc<Shared>, rx: MRx<()>) {
    trace!("rpc: worker {:?} up", thread::current().name());
    while shared.is_running() {
        if rx.recv().is_err() {
            break;
        }
        let rec = shared.lists.lock().unwrap().take_first_working();
        let Some(mut rec) = rec else { continue };
        trace!("rpc: callback for fd {}", rec.fd);
        match rec.dispatch(&shared) {
            Verdict::Keep => {
                shared.lists.lock().unwrap().push_pending(rec);
                shared.wake();
            }
            Verdict::Drop => drop(rec),
        }
    }
    trace!("rpc: worker {:?} exit", thread::current().name());
}
