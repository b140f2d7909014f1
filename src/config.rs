use std::time::Duration;

pub struct ServerConfig {
    /// Size of the worker pool. With 0 workers the event loop runs every
    /// handler inline on its own thread.
    pub num_workers: usize,
    /// listen(2) backlog for every bound endpoint.
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { num_workers: 0, backlog: 255 }
    }
}

#[derive(Clone, Copy)]
pub struct ClientConfig {
    /// Deadline for one request/response round-trip, measured from the end
    /// of the send.
    pub rpc_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { rpc_timeout: Duration::from_secs(5) }
    }
}
