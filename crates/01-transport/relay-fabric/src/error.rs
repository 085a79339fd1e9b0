use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use relay_buffer::AllocationError;
use thiserror::Error;

pub type ChannelResult<T> = Result<T, ChannelError>;
pub type RelayResult<T> = Result<T, RelayError>;

/// Transport-level failures, including wait timeouts.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no message within {waited:?}")]
    Timeout { waited: Duration },

    #[error("channel closed")]
    Closed,

    #[error("endpoint {endpoint} port {port} already has an active session")]
    Busy { endpoint: u32, port: u32 },

    #[error("expected {expected}, received {received}")]
    Unexpected {
        expected: &'static str,
        received: &'static str,
    },

    #[error("message for port {received} arrived on port {expected}")]
    PortMismatch { expected: u32, received: u32 },

    #[error("malformed frame: {0}")]
    Codec(String),

    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn codec(msg: impl Into<String>) -> Self {
        ChannelError::Codec(msg.into())
    }
}

/// Handshake rule violations detected by either side.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("remote wrote at {remote:#x} but the relay buffer lives at {local:#x}")]
    AddressMismatch { local: u64, remote: u64 },

    #[error("remote read nothing of a {announced}-byte chunk")]
    RemoteReadNothing { announced: usize },

    #[error("remote read {reported} bytes of a {announced}-byte chunk")]
    ReadCountMismatch { announced: usize, reported: usize },

    #[error("chunk of {len} bytes exceeds relay capacity {capacity}")]
    OversizedChunk { len: u64, capacity: usize },
}

/// Failures touching the local file.
#[derive(Debug, Error)]
pub enum LocalIoError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read local data: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write local data: {0}")]
    Write(#[source] io::Error),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
}

/// First error of a relay session; every variant is terminal.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error(transparent)]
    LocalIo(#[from] LocalIoError),
}

/// Stable label for the family an error belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Channel,
    Protocol,
    LocalIo,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::Channel => "ChannelError",
            ErrorKind::Protocol => "ProtocolViolation",
            ErrorKind::LocalIo => "LocalIOError",
        };
        f.write_str(label)
    }
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Allocation(_) => ErrorKind::Allocation,
            RelayError::Channel(_) => ErrorKind::Channel,
            RelayError::Protocol(_) => ErrorKind::Protocol,
            RelayError::LocalIo(_) => ErrorKind::LocalIo,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Channel(ChannelError::Timeout { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let timeout: RelayError = ChannelError::Timeout {
            waited: Duration::from_millis(5),
        }
        .into();
        assert_eq!(timeout.kind(), ErrorKind::Channel);
        assert!(timeout.is_timeout());

        let violation: RelayError = ProtocolViolation::AddressMismatch {
            local: 0x1000,
            remote: 0x2000,
        }
        .into();
        assert_eq!(violation.kind(), ErrorKind::Protocol);
        assert!(!violation.is_timeout());
        assert_eq!(
            violation.to_string(),
            "remote wrote at 0x2000 but the relay buffer lives at 0x1000"
        );

        let io: RelayError = LocalIoError::ShortWrite {
            expected: 10,
            written: 3,
        }
        .into();
        assert_eq!(io.kind().to_string(), "LocalIOError");

        let alloc: RelayError = AllocationError::Closed.into();
        assert_eq!(alloc.kind().to_string(), "AllocationError");
    }
}
