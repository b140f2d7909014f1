use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::socket::{
    bind, connect, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, SockaddrIn, SockaddrIn6, UnixAddr,
};
use nix::unistd::pipe;

use crate::error::RpcError;

/// A parsed listen/connect endpoint. Immutable after parse.
#[derive(Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl Endpoint {
    /// Recognized URL forms:
    ///
    /// - `unix:///<path>[:<suffix>]` (path runs up to the first `:`)
    /// - `tcp://<dotted-ipv4>:<port>[:<suffix>]`
    /// - `tcp://[<ipv6>]:<port>[:<suffix>]`
    ///
    /// The suffix past the port (or unix path) belongs to higher layers and
    /// is ignored here.
    pub fn parse(url: &str) -> Result<Self, RpcError> {
        if let Some(rest) = url.strip_prefix("unix://") {
            let path = match rest.find(':') {
                Some(i) => &rest[..i],
                None => rest,
            };
            if path.is_empty() {
                warn!("rpc: invalid url: {}", url);
                return Err(RpcError::InvalidUrl);
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        let Some(rest) = url.strip_prefix("tcp://") else {
            warn!("rpc: invalid url: {}", url);
            return Err(RpcError::InvalidUrl);
        };
        if let Some(rest) = rest.strip_prefix('[') {
            let Some(close) = rest.find(']') else {
                warn!("rpc: invalid url: {}", url);
                return Err(RpcError::InvalidUrl);
            };
            let (host, tail) = rest.split_at(close);
            let Some(port_str) = tail[1..].strip_prefix(':') else {
                warn!("rpc: invalid url: {}", url);
                return Err(RpcError::InvalidUrl);
            };
            let port = parse_port(port_str)?;
            let addr = host.parse::<Ipv6Addr>().map_err(|_| {
                warn!("rpc: invalid ipv6 address: {}", host);
                RpcError::InvalidAddress
            })?;
            return Ok(Self::V6(SocketAddrV6::new(addr, port, 0, 0)));
        }
        let Some(colon) = rest.find(':') else {
            warn!("rpc: invalid url: {}", url);
            return Err(RpcError::InvalidUrl);
        };
        let (host, tail) = rest.split_at(colon);
        let port = parse_port(&tail[1..])?;
        let addr = host.parse::<Ipv4Addr>().map_err(|_| {
            warn!("rpc: invalid ipv4 address: {}", host);
            RpcError::InvalidAddress
        })?;
        Ok(Self::V4(SocketAddrV4::new(addr, port)))
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Unix(_) => AddressFamily::Unix,
            Self::V4(_) => AddressFamily::Inet,
            Self::V6(_) => AddressFamily::Inet6,
        }
    }
}

fn parse_port(s: &str) -> Result<u16, RpcError> {
    let digits = match s.find(':') {
        Some(i) => &s[..i],
        None => s,
    };
    if digits.is_empty() {
        return Err(RpcError::InvalidUrl);
    }
    digits.parse::<u16>().map_err(|_| {
        warn!("rpc: invalid port: {}", digits);
        RpcError::InvalidAddress
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unix(p) => write!(f, "unix://{}", p.display()),
            Self::V4(a) => write!(f, "tcp://{}", a),
            Self::V6(a) => write!(f, "tcp://[{}]:{}", a.ip(), a.port()),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Open a non-blocking stream socket for the endpoint's address family.
pub(crate) fn open_stream_socket(endpoint: &Endpoint) -> Result<OwnedFd, RpcError> {
    socket(endpoint.family(), SockType::Stream, SockFlag::SOCK_NONBLOCK, None).map_err(|e| {
        error!("rpc: socket() failed: {}", e);
        RpcError::Socket
    })
}

/// The full listener setup: SO_REUSEADDR, bind, listen.
pub(crate) fn bind_and_listen(
    fd: &OwnedFd, endpoint: &Endpoint, backlog: i32,
) -> Result<(), RpcError> {
    setsockopt(fd, sockopt::ReuseAddr, &true).map_err(|e| {
        error!("rpc: setsockopt() failed: {}", e);
        RpcError::Socket
    })?;
    let raw = fd.as_raw_fd();
    let bound = match endpoint {
        Endpoint::Unix(path) => {
            let addr = UnixAddr::new(path.as_path()).map_err(|e| {
                error!("rpc: invalid unix path {}: {}", path.display(), e);
                RpcError::InvalidAddress
            })?;
            bind(raw, &addr)
        }
        Endpoint::V4(sa) => bind(raw, &SockaddrIn::from(*sa)),
        Endpoint::V6(sa) => bind(raw, &SockaddrIn6::from(*sa)),
    };
    bound.map_err(|e| {
        error!("rpc: error binding to {}: {}", endpoint, e);
        RpcError::Socket
    })?;
    let backlog = Backlog::new(backlog).map_err(|e| {
        error!("rpc: bad backlog: {}", e);
        RpcError::Socket
    })?;
    listen(fd, backlog).map_err(|e| {
        error!("rpc: listen() failed: {}", e);
        RpcError::Socket
    })?;
    Ok(())
}

/// Open a non-blocking stream socket and start connecting. `EINPROGRESS` is
/// success; the first send completes the handshake or reports the failure.
pub(crate) fn connect_stream(endpoint: &Endpoint) -> Result<OwnedFd, RpcError> {
    let fd = open_stream_socket(endpoint)?;
    let raw = fd.as_raw_fd();
    let connected = match endpoint {
        Endpoint::Unix(path) => {
            let addr = UnixAddr::new(path.as_path()).map_err(|e| {
                error!("rpc: invalid unix path {}: {}", path.display(), e);
                RpcError::InvalidAddress
            })?;
            connect(raw, &addr)
        }
        Endpoint::V4(sa) => connect(raw, &SockaddrIn::from(*sa)),
        Endpoint::V6(sa) => connect(raw, &SockaddrIn6::from(*sa)),
    };
    match connected {
        Ok(()) | Err(Errno::EINPROGRESS) => Ok(fd),
        Err(e) => {
            error!("rpc: error connecting to {}: {}", endpoint, e);
            Err(RpcError::Socket)
        }
    }
}

/// Create a pipe usable as a stop source: hand the read end to the server
/// run loop, keep the write end and write one byte to request shutdown.
pub fn stop_pipe() -> Result<(OwnedFd, OwnedFd), RpcError> {
    pipe().map_err(|e| {
        error!("rpc: pipe() failed: {}", e);
        RpcError::Socket
    })
}
