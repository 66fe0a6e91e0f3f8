//! Error definitions for UmbraFS

use std::fmt;
use std::io;

/// Result of UmbraFS operations
pub type UmbraFSResult<T> = Result<T, UmbraFSError>;

/// Errors observable from the UmbraFS runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UmbraFSError {
    /// Malformed flags or arguments
    InvalidArgument,
    /// Allocation failure
    OutOfMemory,
    /// I/O failure from a block transport or socket; carries the negative errno
    Io(i32),
    /// Wire header or payload violated the protocol
    Protocol,
    /// Operation the transport cannot currently service
    NotSupported,
    /// A peer already exists for this address
    PeerExists,
}

impl UmbraFSError {
    /// Build an I/O error from a raw (positive or negative) errno value
    pub fn from_errno(errno: i32) -> Self {
        UmbraFSError::Io(-errno.abs())
    }

    /// The negative errno behind this error, when there is one
    pub fn errno(&self) -> Option<i32> {
        match self {
            UmbraFSError::Io(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for UmbraFSError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UmbraFSError::InvalidArgument => write!(f, "Invalid argument"),
            UmbraFSError::OutOfMemory => write!(f, "Out of memory"),
            UmbraFSError::Io(e) => {
                let err = io::Error::from_raw_os_error(e.abs());
                write!(f, "I/O error: {}", err)
            }
            UmbraFSError::Protocol => write!(f, "Protocol violation"),
            UmbraFSError::NotSupported => write!(f, "Operation not supported"),
            UmbraFSError::PeerExists => write!(f, "Peer already exists"),
        }
    }
}

impl std::error::Error for UmbraFSError {}

impl From<io::Error> for UmbraFSError {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => UmbraFSError::Io(-errno),
            None => UmbraFSError::Io(-libc::EIO),
        }
    }
}

/// Last errno of the calling thread, negated
pub(crate) fn last_errno() -> i32 {
    -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}
