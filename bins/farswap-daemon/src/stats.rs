//! Daemon-wide counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the accept loop, dispatchers and monitor.
#[derive(Debug, Default)]
pub struct DaemonStats {
    admissions: AtomicU64,
    admission_rejects: AtomicU64,
    binds: AtomicU64,
    bind_rejects: AtomicU64,
    chunks_bound: AtomicU64,
    eviction_batches: AtomicU64,
    chunks_evicted: AtomicU64,
    expansions: AtomicU64,
    failed_connections: AtomicU64,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_reject(&self) {
        self.admission_rejects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful bind of `chunks` chunks.
    pub fn record_bind(&self, chunks: usize) {
        self.binds.fetch_add(1, Ordering::Relaxed);
        self.chunks_bound.fetch_add(chunks as u64, Ordering::Relaxed);
    }

    pub fn record_bind_reject(&self) {
        self.bind_rejects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one eviction batch that reclaimed `chunks` chunks.
    pub fn record_eviction(&self, chunks: usize) {
        self.eviction_batches.fetch_add(1, Ordering::Relaxed);
        self.chunks_evicted.fetch_add(chunks as u64, Ordering::Relaxed);
    }

    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_connection(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            admission_rejects: self.admission_rejects.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            bind_rejects: self.bind_rejects.load(Ordering::Relaxed),
            chunks_bound: self.chunks_bound.load(Ordering::Relaxed),
            eviction_batches: self.eviction_batches.load(Ordering::Relaxed),
            chunks_evicted: self.chunks_evicted.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DaemonStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub admissions: u64,
    pub admission_rejects: u64,
    pub binds: u64,
    pub bind_rejects: u64,
    pub chunks_bound: u64,
    pub eviction_batches: u64,
    pub chunks_evicted: u64,
    pub expansions: u64,
    pub failed_connections: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connections admitted:  {}", self.admissions)?;
        writeln!(f, "connections rejected:  {}", self.admission_rejects)?;
        writeln!(f, "connections failed:    {}", self.failed_connections)?;
        writeln!(f, "binds:                 {} ({} chunks)", self.binds, self.chunks_bound)?;
        writeln!(f, "binds rejected:        {}", self.bind_rejects)?;
        writeln!(
            f,
            "eviction batches:      {} ({} chunks)",
            self.eviction_batches, self.chunks_evicted
        )?;
        write!(f, "expansions:            {}", self.expansions)
    }
}
