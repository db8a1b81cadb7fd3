//! Bus error taxonomy and transport failure classification.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Classification of a transport-level failure. The kind decides whether the
/// reconnect path runs: only `Connect` failures are transparently recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetErrorKind {
    /// Connection-level breakage: dial failure, reset, broken pipe, EOF.
    Connect,
    /// The operation hit a deadline.
    Timeout,
    /// Transient condition worth an immediate caller-side retry.
    Temporary,
    /// Payload read failed after the length prefix was consumed.
    ReadFail,
    /// Payload write failed after the length prefix went out.
    WriteFail,
    /// Anything the classifier does not recognize.
    Unknown,
}

impl fmt::Display for NetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NetErrorKind::Connect => "connect",
            NetErrorKind::Timeout => "timeout",
            NetErrorKind::Temporary => "temporary",
            NetErrorKind::ReadFail => "read_fail",
            NetErrorKind::WriteFail => "write_fail",
            NetErrorKind::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Main error type for the bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("marshal failed: {0}")]
    Marshal(#[source] serde_json::Error),

    #[error("unmarshal failed: {0}")]
    Unmarshal(#[source] serde_json::Error),

    #[error("compress failed: {0}")]
    Compress(#[source] io::Error),

    #[error("decompress failed: {0}")]
    Decompress(#[source] io::Error),

    /// Transport failure carrying its classification.
    #[error("net {kind}: {source}")]
    Net {
        kind: NetErrorKind,
        #[source]
        source: io::Error,
    },

    /// Declared frame length exceeds the configured cap.
    #[error("frame of {got} bytes exceeds cap of {cap}")]
    FrameTooLarge { got: usize, cap: usize },

    /// A bounded wait expired (lock acquisition).
    #[error("{op} timed out after {secs}s")]
    Timeout { op: String, secs: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    /// Operational misuse, e.g. starting the same loop twice.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl BusError {
    pub fn net(kind: NetErrorKind, source: io::Error) -> Self {
        Self::Net { kind, source }
    }

    pub fn timeout(op: impl Into<String>, secs: u64) -> Self {
        Self::Timeout { op: op.into(), secs }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Transport failure kind, when this is a transport error.
    pub fn net_kind(&self) -> Option<NetErrorKind> {
        match self {
            Self::Net { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a self-healing connection may transparently retry after this
    /// error. Codec errors are never retried.
    pub fn is_reconnectable(&self) -> bool {
        self.net_kind() == Some(NetErrorKind::Connect)
    }

    /// Error category label for logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Marshal(_) => "marshal",
            Self::Unmarshal(_) => "unmarshal",
            Self::Compress(_) => "compress",
            Self::Decompress(_) => "decompress",
            Self::Net { .. } => "net",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config",
            Self::Runtime(_) => "runtime",
        }
    }
}

/// Maps an I/O error to the transport failure kind that drives the
/// reconnect decision.
pub fn classify_io(err: &io::Error) -> NetErrorKind {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe | UnexpectedEof
        | NotConnected => NetErrorKind::Connect,
        TimedOut | WouldBlock => NetErrorKind::Timeout,
        Interrupted => NetErrorKind::Temporary,
        _ => NetErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "test")
    }

    #[test]
    fn connection_class_errors_map_to_connect() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::NotConnected,
        ] {
            assert_eq!(classify_io(&io_err(kind)), NetErrorKind::Connect, "{kind:?}");
        }
    }

    #[test]
    fn deadline_errors_map_to_timeout() {
        assert_eq!(classify_io(&io_err(io::ErrorKind::TimedOut)), NetErrorKind::Timeout);
        assert_eq!(classify_io(&io_err(io::ErrorKind::WouldBlock)), NetErrorKind::Timeout);
    }

    #[test]
    fn unrecognized_errors_map_to_unknown() {
        assert_eq!(classify_io(&io_err(io::ErrorKind::PermissionDenied)), NetErrorKind::Unknown);
        assert_eq!(classify_io(&io_err(io::ErrorKind::InvalidData)), NetErrorKind::Unknown);
    }

    #[test]
    fn only_connect_failures_are_reconnectable() {
        let connect = BusError::net(NetErrorKind::Connect, io_err(io::ErrorKind::BrokenPipe));
        assert!(connect.is_reconnectable());

        let write = BusError::net(NetErrorKind::WriteFail, io_err(io::ErrorKind::Other));
        assert!(!write.is_reconnectable());

        let timeout = BusError::timeout("acquire lock job", 30);
        assert!(!timeout.is_reconnectable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(BusError::config("x").category(), "config");
        assert_eq!(BusError::runtime("x").category(), "runtime");
        assert_eq!(
            BusError::net(NetErrorKind::Unknown, io_err(io::ErrorKind::Other)).category(),
            "net"
        );
    }
}
