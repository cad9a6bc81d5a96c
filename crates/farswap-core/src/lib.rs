//! Chunk pool, control protocol and memory-pressure policy for farswap.
//!
//! farswap donates spare host memory to remote swap clients. Memory is
//! offered as fixed-size chunks; clients bind chunks, report how often they
//! touch them, and give them back when the server reclaims memory under
//! local pressure.
//!
//! This crate holds the transport-independent pieces:
//!
//! - [`ChunkPool`]: the shared chunk inventory and its ownership rules
//! - [`WireCodec`] and [`Message`]: the fixed-frame control protocol
//! - [`PressurePolicy`]: the smoothed free-memory evict/expand decision
//! - [`Config`]: daemon configuration loaded from TOML
//!
//! # Example
//!
//! ```
//! use farswap_core::{ChunkPool, LocalRegistrar, OwnerId};
//! use std::sync::Arc;
//!
//! let pool = ChunkPool::with_capacity(32, 32, 4096, Arc::new(LocalRegistrar::new())).unwrap();
//! let _a = pool.bind(OwnerId::new(0, 1), 10).unwrap();
//! let _b = pool.bind(OwnerId::new(1, 1), 5).unwrap();
//! assert_eq!(pool.free_count(), 17);
//! assert!(pool.bind(OwnerId::new(2, 1), 20).is_err());
//! assert_eq!(pool.free_count(), 17);
//! ```

#![deny(missing_docs)]
#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod error;
pub mod hostmem;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod units;

pub use config::Config;
pub use error::{Error, Result};
pub use hostmem::{HostMemory, ProcMeminfo};
pub use monitor::{Decision, FreeMemoryAverage, PressurePolicy};
pub use pool::{
    ChunkId, ChunkLease, ChunkPool, ChunkSnapshot, EvictionCandidate, LocalRegistrar,
    MemoryRegion, OwnerId, PoolStats, Registrar, Registration,
};
pub use protocol::{ActivityReport, ChunkDescriptor, Message, MessageTag, RemoteKey, WireCodec};
