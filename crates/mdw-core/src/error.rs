//! # MDW Error Handling
//!
//! Unified error types for the midware stack.
//!
//! Error handling follows these principles:
//! - Errors are typed and categorized by subsystem
//! - No panics in production code paths
//! - Every variant maps to a POSIX-style code at the session boundary

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MDW Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MDW unified error type
///
/// This enum covers all error conditions across the dispatch stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Dependency matrix has a symmetric conflict or cycle
    AdjacencyConflict,
    /// Link producer/consumer index out of range or zero-sized
    LinkOutOfRange,
    /// Subcommand count exceeds the per-command maximum
    TooManySubcmds,
    /// Command buffer layout arithmetic wrapped
    SizeOverflow,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Out of system memory
    OutOfMemory,
    /// Command buffer pool exhausted
    PoolExhausted,
    /// Resource not found
    NotFound,

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    /// Resource is busy
    Busy,
    /// Command still has executions in flight
    CmdRunning,
    /// Object is in the wrong state for the operation
    InvalidState,

    // =========================================================================
    // Remote Processor Errors
    // =========================================================================
    /// RV co-processor reported an error status
    Remote(RemoteStatus),
    /// Remote I/O failure with no finer status
    RemoteIo,
    /// No response within the configured deadline
    Timeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Validation
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::AdjacencyConflict => write!(f, "dependency matrix conflict"),
            Self::LinkOutOfRange => write!(f, "link index out of range"),
            Self::TooManySubcmds => write!(f, "too many subcommands"),
            Self::SizeOverflow => write!(f, "command buffer size overflow"),

            // Resources
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::PoolExhausted => write!(f, "command buffer pool exhausted"),
            Self::NotFound => write!(f, "resource not found"),

            // Concurrency
            Self::Busy => write!(f, "resource busy"),
            Self::CmdRunning => write!(f, "command is running"),
            Self::InvalidState => write!(f, "invalid state"),

            // Remote
            Self::Remote(status) => write!(f, "remote error: {:?}", status),
            Self::RemoteIo => write!(f, "remote i/o error"),
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

// =============================================================================
// REMOTE STATUS
// =============================================================================

/// Status codes reported by the RV co-processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Executor queue full, resubmit later
    Busy,
    /// Execution failed on the remote side
    Error,
    /// Remote-side execution deadline expired
    Timeout,
    /// Unrecognized status word
    Internal(u32),
}

impl RemoteStatus {
    /// Decode from the wire status word (0 = success)
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => None,
            1 => Some(Self::Busy),
            2 => Some(Self::Error),
            3 => Some(Self::Timeout),
            other => Some(Self::Internal(other)),
        }
    }
}

impl From<RemoteStatus> for Error {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Busy => Error::Busy,
            RemoteStatus::Timeout => Error::Timeout,
            RemoteStatus::Error | RemoteStatus::Internal(_) => Error::Remote(status),
        }
    }
}

// =============================================================================
// ERRNO MAPPING
// =============================================================================

/// POSIX-style error numbers surfaced at the session boundary
pub mod errno {
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Device or resource busy
    pub const EBUSY: i32 = 16;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Text file busy (command in flight)
    pub const ETXTBSY: i32 = 26;
    /// Timer expired
    pub const ETIME: i32 = 62;
    /// Remote I/O error
    pub const EREMOTEIO: i32 = 121;
}

impl Error {
    /// Map to the POSIX-style code the session ABI reports
    ///
    /// Lookup failures map to `EINVAL` rather than `ENOENT`: a stale or
    /// unknown command id is a caller bug, not a missing file.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidParameter
            | Self::AdjacencyConflict
            | Self::LinkOutOfRange
            | Self::TooManySubcmds
            | Self::SizeOverflow
            | Self::NotFound
            | Self::InvalidState => errno::EINVAL,

            Self::OutOfMemory | Self::PoolExhausted => errno::ENOMEM,

            Self::Busy => errno::EBUSY,
            Self::CmdRunning => errno::ETXTBSY,

            Self::Remote(_) | Self::RemoteIo => errno::EREMOTEIO,
            Self::Timeout => errno::ETIME,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidParameter.errno(), errno::EINVAL);
        assert_eq!(Error::SizeOverflow.errno(), errno::EINVAL);
        assert_eq!(Error::NotFound.errno(), errno::EINVAL);
        assert_eq!(Error::OutOfMemory.errno(), errno::ENOMEM);
        assert_eq!(Error::Busy.errno(), errno::EBUSY);
        assert_eq!(Error::CmdRunning.errno(), errno::ETXTBSY);
        assert_eq!(Error::Timeout.errno(), errno::ETIME);
        assert_eq!(Error::RemoteIo.errno(), errno::EREMOTEIO);
    }

    #[test]
    fn test_remote_status_decode() {
        assert_eq!(RemoteStatus::from_raw(0), None);
        assert_eq!(RemoteStatus::from_raw(1), Some(RemoteStatus::Busy));
        assert_eq!(RemoteStatus::from_raw(2), Some(RemoteStatus::Error));
        assert_eq!(RemoteStatus::from_raw(3), Some(RemoteStatus::Timeout));
        assert_eq!(RemoteStatus::from_raw(9), Some(RemoteStatus::Internal(9)));
    }

    #[test]
    fn test_remote_status_to_error() {
        assert_eq!(Error::from(RemoteStatus::Busy), Error::Busy);
        assert_eq!(Error::from(RemoteStatus::Timeout), Error::Timeout);
        assert_eq!(
            Error::from(RemoteStatus::Error),
            Error::Remote(RemoteStatus::Error)
        );
        assert_eq!(Error::from(RemoteStatus::Busy).errno(), errno::EBUSY);
        assert_eq!(
            Error::from(RemoteStatus::Error).errno(),
            errno::EREMOTEIO
        );
    }
}
