//! Error type shared by every kernel call
//!
//! Usage errors, timeouts and liveness failures are returned to the caller.
//! Broken scheduler invariants are never represented here; they panic.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

/// Recoverable outcome of a kernel call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Bad handle, bad address, bad mask, bad size
    #[error("invalid argument")]
    InvalidArgument,
    /// The call was not allowed to block and the condition was not met
    #[error("operation would block")]
    WouldBlock,
    /// The timeout expired before the condition was met
    #[error("timed out")]
    TimedOut,
    /// The object was deleted while the caller was blocked on it
    #[error("object deleted while waiting")]
    Gone,
    /// A kernel table or the heap is exhausted
    #[error("out of memory")]
    OutOfMemory,
    /// More event sources than a multiwaiter can hold
    #[error("too many event sources")]
    TooMany,
}

/// newlib errno values
mod errno {
    pub const ENOENT: i32 = 2;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
    pub const ETIMEDOUT: i32 = 116;
}

impl Error {
    /// Negative errno for C-style callers
    pub const fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument | Error::TooMany => -errno::EINVAL,
            Error::WouldBlock => -errno::EAGAIN,
            Error::TimedOut => -errno::ETIMEDOUT,
            Error::Gone => -errno::ENOENT,
            Error::OutOfMemory => -errno::ENOMEM,
        }
    }

    /// Collapse a result into the 0-or-negative-errno convention
    pub fn to_code<T>(result: Result<T>) -> i32 {
        match result {
            Ok(_) => 0,
            Err(e) => e.errno(),
        }
    }
}

/// Kernel result
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        for e in [
            Error::InvalidArgument,
            Error::WouldBlock,
            Error::TimedOut,
            Error::Gone,
            Error::OutOfMemory,
            Error::TooMany,
        ] {
            assert!(e.errno() < 0, "{e:?}");
        }
    }

    #[test]
    fn test_too_many_shares_einval() {
        assert_eq!(Error::TooMany.errno(), Error::InvalidArgument.errno());
        assert_ne!(Error::TimedOut.errno(), Error::WouldBlock.errno());
    }

    #[test]
    fn test_to_code() {
        assert_eq!(Error::to_code(Ok::<u32, Error>(7)), 0);
        assert_eq!(Error::to_code::<()>(Err(Error::TimedOut)), -116);
    }
}
