//! # farswap
//!
//! Remote memory donation for swap clients.
//!
//! This is the workspace root crate that re-exports both members.
//! For direct usage, depend on the individual crates:
//!
//! - [`farswap_core`] - chunk pool, wire protocol, memory-pressure policy
//! - [`farswap_daemon`] - sessions, transports and the `farswap-daemon` binary

pub use farswap_core as core;
pub use farswap_daemon as daemon;

pub use farswap_core::{ChunkPool, Config, Message, WireCodec};
pub use farswap_daemon::Daemon;
