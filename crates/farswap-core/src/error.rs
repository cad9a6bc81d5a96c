//! Error types for farswap-core.

use crate::pool::{ChunkId, OwnerId};
use thiserror::Error;

/// Errors raised by the chunk pool, the wire codec and configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// Fewer free chunks than requested; nothing was bound.
    #[error("pool exhausted: requested {requested} chunks, {available} available")]
    PoolExhausted {
        /// Chunks requested.
        requested: usize,
        /// Chunks free at the time of the request.
        available: usize,
    },

    /// A chunk was released or touched by a connection that does not own it.
    #[error("ownership violation on chunk {chunk}: caller {caller}, owner {owner:?}")]
    OwnershipViolation {
        /// Chunk involved.
        chunk: ChunkId,
        /// Connection that attempted the operation.
        caller: OwnerId,
        /// Actual owner, if any.
        owner: Option<OwnerId>,
    },

    /// Request is well-formed but cannot be honored (e.g. zero chunks).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Frame carries a tag this protocol does not define.
    #[error("unknown message tag {0}")]
    UnknownTag(u32),

    /// Frame is truncated, inconsistent or otherwise unreadable.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Message carries more entries than the frame can hold.
    #[error("too many entries: {count} exceeds maximum {max}")]
    TooManyEntries {
        /// Entries supplied.
        count: usize,
        /// Frame capacity.
        max: usize,
    },

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backing memory could not be mapped or registered.
    #[error("memory region error: {0}")]
    Region(String),

    /// I/O error (procfs, config files).
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Returns true for errors that indicate an internal bug rather than a
    /// peer or environment problem.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::OwnershipViolation { .. })
    }

    /// Returns true if the connection that triggered the error can continue.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::InvalidRequest(_)
                | Self::UnknownTag(_)
                | Self::MalformedMessage(_)
                | Self::TooManyEntries { .. }
                | Self::Region(_)
        )
    }
}

/// Result type for farswap-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_pool_exhausted() {
        let err = Error::PoolExhausted {
            requested: 20,
            available: 17,
        };
        let msg = err.to_string();
        assert!(msg.contains("20"));
        assert!(msg.contains("17"));
    }

    #[test]
    fn test_error_display_unknown_tag() {
        let err = Error::UnknownTag(42);
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_ownership_violation_is_bug() {
        let err = Error::OwnershipViolation {
            chunk: ChunkId::new(3),
            caller: OwnerId::new(1, 1),
            owner: Some(OwnerId::new(0, 1)),
        };
        assert!(err.is_invariant_violation());
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("chunk 3"));
    }

    #[test]
    fn test_pool_exhausted_is_recoverable() {
        let err = Error::PoolExhausted {
            requested: 1,
            available: 0,
        };
        assert!(err.is_recoverable());
        assert!(!err.is_invariant_violation());
    }

    #[test]
    fn test_error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
