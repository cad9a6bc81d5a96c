//! Daemon error types.

use crate::connection::SendState;
use crate::transport::EndpointId;
use farswap_core::{MessageTag, OwnerId};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the session layer, connections and the process shell.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] farswap_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("session table full ({max} connections)")]
    CapacityExceeded { max: usize },

    #[error("no connection for endpoint {0}")]
    UnknownEndpoint(EndpointId),

    #[error("{tag:?} not permitted in send state {state:?}")]
    SendOutOfOrder { tag: MessageTag, state: SendState },

    #[error("connection {owner} did not acknowledge within {timeout:?}")]
    AckTimeout { owner: OwnerId, timeout: Duration },

    #[error("connection {0} failed")]
    PeerFailed(OwnerId),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

impl DaemonError {
    /// Returns true if the error is confined to one connection and the
    /// daemon keeps serving everyone else.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Core(e) => e.is_recoverable(),
            Self::CapacityExceeded { .. }
            | Self::UnknownEndpoint(_)
            | Self::SendOutOfOrder { .. }
            | Self::AckTimeout { .. }
            | Self::PeerFailed(_) => true,
            Self::Transport(_) | Self::Signal(_) => false,
        }
    }

    /// Returns true if the peer should be treated as failed and torn down.
    pub const fn is_peer_failure(&self) -> bool {
        matches!(self, Self::AckTimeout { .. } | Self::PeerFailed(_))
    }
}
