use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

/// Result type alias for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Errors surfaced by the userspace stack.
///
/// Flow-level I/O errors from endpoint wrappers are reported as
/// `std::io::Error` (see [`StackError::into_io`]) so the wrappers can
/// implement the tokio I/O traits directly.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("stack is closed")]
    Closed,

    #[error("no route to {0}")]
    Unroutable(IpAddr),

    #[error("connection to {0} refused")]
    ConnectionRefused(SocketAddr),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("no free local port")]
    PortExhausted,

    #[error("invalid prefix {input:?}: {reason}")]
    InvalidCidr { input: String, reason: &'static str },

    #[error("{op} failed: {detail}")]
    Socket { op: &'static str, detail: String },
}

impl StackError {
    pub(crate) fn socket(op: &'static str, err: impl std::fmt::Debug) -> Self {
        Self::Socket {
            op,
            detail: format!("{err:?}"),
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Closed => io::ErrorKind::NotConnected,
            Self::Unroutable(_) => io::ErrorKind::AddrNotAvailable,
            Self::ConnectionRefused(_) => io::ErrorKind::ConnectionRefused,
            Self::ConnectionReset => io::ErrorKind::ConnectionReset,
            Self::PortExhausted => io::ErrorKind::AddrInUse,
            Self::InvalidCidr { .. } => io::ErrorKind::InvalidInput,
            Self::Socket { .. } => io::ErrorKind::Other,
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(self.io_kind(), self)
    }
}

impl From<StackError> for io::Error {
    fn from(err: StackError) -> Self {
        err.into_io()
    }
}
