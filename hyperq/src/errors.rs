use std::{fmt, io};

use nix::errno::Errno;

/// Errors surfaced by the queue engine.
#[derive(Debug)]
pub enum HyperQError {
    /// Bad user input: name syntax, capacity bounds, empty payload.
    InvalidArgument(String),
    /// An underlying shared-memory, mmap or pthread call failed.
    Os { op: &'static str, errno: Errno },
    /// Attached to a segment whose header never became initialized.
    NotInitialized { name: String },
    /// The framed message cannot ever fit in this queue.
    MessageTooLarge { len: usize, capacity: usize },
    /// A length prefix read from the buffer contradicts the live byte count.
    /// The segment can no longer be trusted; callers should drop the handle.
    CorruptState(String),
    /// A process died while holding the queue mutex (robust-mutex path).
    OwnerDied,
    Io(io::Error),
}

impl HyperQError {
    pub(crate) fn os(op: &'static str, errno: Errno) -> HyperQError {
        HyperQError::Os { op, errno }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> HyperQError {
        HyperQError::InvalidArgument(msg.into())
    }
}

impl fmt::Display for HyperQError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HyperQError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            HyperQError::Os { op, errno } => write!(f, "{} failed: {}", op, errno),
            HyperQError::NotInitialized { name } => {
                write!(f, "segment '{}' was never initialized by its creator", name)
            }
            HyperQError::MessageTooLarge { len, capacity } => write!(
                f,
                "message of {} bytes cannot fit a queue of capacity {} (4-byte frame included)",
                len, capacity
            ),
            HyperQError::CorruptState(msg) => write!(f, "corrupt queue state: {}", msg),
            HyperQError::OwnerDied => {
                write!(f, "a previous lock owner died while holding the queue mutex")
            }
            HyperQError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for HyperQError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HyperQError::Os { errno, .. } => Some(errno),
            HyperQError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HyperQError {
    fn from(err: io::Error) -> Self {
        HyperQError::Io(err)
    }
}

impl From<Errno> for HyperQError {
    fn from(errno: Errno) -> Self {
        HyperQError::Os { op: "syscall", errno }
    }
}
