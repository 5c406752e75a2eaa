//! Error types for the coroutine runtime

use core::fmt;

/// Result type for runtime operations
pub type RtResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations.
///
/// Reactor and timer setup failures never appear here: a thread that
/// cannot epoll is a thread that cannot run anything, so those paths
/// log and abort instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Stack arena / memory mapping failure
    Memory(MemoryError),

    /// Socket setup or data-path failure
    Net(NetError),

    /// Configuration rejected by validation
    InvalidConfig(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Memory(e) => write!(f, "memory error: {}", e),
            RuntimeError::Net(e) => write!(f, "net error: {}", e),
            RuntimeError::InvalidConfig(what) => write!(f, "invalid config: {}", what),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Stack arena related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed; carries errno
    MapFailed(i32),

    /// munmap failed; carries errno
    UnmapFailed(i32),

    /// Arena has no free blocks left
    Exhausted,

    /// Pointer handed back does not belong to the arena
    ForeignBlock,

    /// block_size or block_count of zero
    ZeroSized,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::MapFailed(errno) => write!(f, "mmap failed (errno {})", errno),
            MemoryError::UnmapFailed(errno) => write!(f, "munmap failed (errno {})", errno),
            MemoryError::Exhausted => write!(f, "arena exhausted"),
            MemoryError::ForeignBlock => write!(f, "block does not belong to this arena"),
            MemoryError::ZeroSized => write!(f, "zero-sized arena"),
        }
    }
}

impl From<MemoryError> for RuntimeError {
    fn from(e: MemoryError) -> Self {
        RuntimeError::Memory(e)
    }
}

/// Socket errors. Syscall variants carry the errno behind the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// socket() failed
    Socket(i32),

    /// bind() failed
    Bind(i32),

    /// listen() failed
    Listen(i32),

    /// connect() failed
    Connect(i32),

    /// connect() gave up after the configured timeout
    ConnectTimedOut,

    /// accept() failed
    Accept(i32),

    /// read() failed
    Read(i32),

    /// write() failed
    Write(i32),

    /// Address string did not parse
    BadAddress,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Socket(errno) => write!(f, "socket failed (errno {})", errno),
            NetError::Bind(errno) => write!(f, "bind failed (errno {})", errno),
            NetError::Listen(errno) => write!(f, "listen failed (errno {})", errno),
            NetError::Connect(errno) => write!(f, "connect failed (errno {})", errno),
            NetError::ConnectTimedOut => write!(f, "connect timed out"),
            NetError::Accept(errno) => write!(f, "accept failed (errno {})", errno),
            NetError::Read(errno) => write!(f, "read failed (errno {})", errno),
            NetError::Write(errno) => write!(f, "write failed (errno {})", errno),
            NetError::BadAddress => write!(f, "bad address"),
        }
    }
}

impl From<NetError> for RuntimeError {
    fn from(e: NetError) -> Self {
        RuntimeError::Net(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::Memory(MemoryError::Exhausted);
        assert_eq!(format!("{}", e), "memory error: arena exhausted");

        let e = RuntimeError::Net(NetError::Connect(111));
        assert_eq!(format!("{}", e), "net error: connect failed (errno 111)");

        let e = RuntimeError::InvalidConfig("stack_size");
        assert_eq!(format!("{}", e), "invalid config: stack_size");
    }

    #[test]
    fn test_error_conversion() {
        let mem: RuntimeError = MemoryError::MapFailed(12).into();
        assert!(matches!(mem, RuntimeError::Memory(MemoryError::MapFailed(12))));

        let net: RuntimeError = NetError::BadAddress.into();
        assert!(matches!(net, RuntimeError::Net(NetError::BadAddress)));
    }
}
