use std::fmt;

/// "rpc_" prefix is reserved for runtime error names in logs and tests.
///
/// OS-level detail (`nix::errno::Errno`) is logged at the failure site and
/// not carried here; every failure resolves to one of these kinds before
/// it reaches a caller.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    PartialOrd,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum RpcError {
    /// URL does not match any recognized scheme
    #[strum(serialize = "rpc_invalid_url")]
    InvalidUrl = 0,
    /// Host part of a tcp URL is not a valid address
    #[strum(serialize = "rpc_invalid_address")]
    InvalidAddress = 1,
    /// socket/bind/listen/connect failure
    #[strum(serialize = "rpc_socket_err")]
    Socket = 2,
    /// read failure on an established connection
    #[strum(serialize = "rpc_read_err")]
    Read = 3,
    /// send failure on an established connection
    #[strum(serialize = "rpc_send_err")]
    Send = 4,
    /// bad method index or unpack failure
    #[strum(serialize = "rpc_protocol_err")]
    Protocol = 5,
    /// client gave up waiting for a response
    #[strum(serialize = "rpc_timeout")]
    Timeout = 6,
    /// peer closed the connection
    #[strum(serialize = "rpc_closed")]
    Closed = 7,
}

// The default Debug derive would ignore the strum serialize strings.
impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl RpcError {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_error_names() {
        assert_eq!(RpcError::Timeout.as_ref(), "rpc_timeout");
        let e = RpcError::from_str("rpc_timeout").expect("parse");
        assert_eq!(e, RpcError::Timeout);
        assert!(RpcError::from_str("timeoutss").is_err());
        println!("{} {:?}", RpcError::Protocol, RpcError::Protocol);
    }
}
