//! Shared chunk pool.
//!
//! The pool owns every chunk's backing memory and registration. Binding hands
//! a connection a [`ChunkLease`]: a non-cloneable capability naming the chunk
//! and the binding epoch it was issued for. Releasing a chunk consumes its
//! lease, so a connection cannot keep using a chunk it has given back, and a
//! lease from an earlier binding can never release a chunk that has since
//! been reused.
//!
//! All mutation happens under one pool-wide lock: allocation and victim
//! selection must observe the same owner/activity snapshot.

mod region;

pub use region::MemoryRegion;

use crate::config::PoolConfig;
use crate::protocol::RemoteKey;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Index of a chunk in the pool table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Wrap a table index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a connection that can own chunks.
///
/// Session slots are reused; the generation distinguishes successive
/// occupants of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId {
    slot: u32,
    generation: u32,
}

impl OwnerId {
    /// Build a handle from a session slot and its generation.
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Session slot.
    #[must_use]
    pub const fn slot(self) -> usize {
        self.slot as usize
    }

    /// Slot generation.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}.{}", self.slot, self.generation)
    }
}

/// Remote-access registration of a chunk region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// Address the client uses for one-sided access.
    pub addr: u64,
    /// Access key.
    pub rkey: RemoteKey,
}

/// Registers chunk memory with the transport for remote access.
pub trait Registrar: Send + Sync {
    /// Make `region` remotely accessible.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Region`] if the transport refuses the registration.
    fn register(&self, region: &MemoryRegion) -> Result<Registration>;

    /// Revoke remote access. Called before the region is unmapped.
    fn deregister(&self, registration: Registration);
}

/// Registrar for transports that address chunks by their local address:
/// keys are handed out sequentially, starting at 1.
#[derive(Debug)]
pub struct LocalRegistrar {
    next_key: AtomicU32,
}

impl LocalRegistrar {
    /// Create a registrar whose first key is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_key: AtomicU32::new(1),
        }
    }
}

impl Default for LocalRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl Registrar for LocalRegistrar {
    fn register(&self, region: &MemoryRegion) -> Result<Registration> {
        let raw = self.next_key.fetch_add(1, Ordering::Relaxed);
        let rkey = RemoteKey::new(raw)
            .ok_or_else(|| Error::Region("remote key space exhausted".to_string()))?;
        Ok(Registration {
            addr: region.addr(),
            rkey,
        })
    }

    fn deregister(&self, _registration: Registration) {}
}

/// Capability to use, and later give back, one bound chunk.
#[must_use = "dropping a lease leaks the chunk until its owner is torn down"]
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkLease {
    chunk: ChunkId,
    owner: OwnerId,
    epoch: u64,
    registration: Registration,
}

impl ChunkLease {
    /// Leased chunk.
    #[must_use]
    pub const fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Connection holding the lease.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Registration the client uses to reach the chunk.
    #[must_use]
    pub const fn registration(&self) -> Registration {
        self.registration
    }
}

/// An owned chunk proposed for reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    /// Chunk to reclaim.
    pub chunk: ChunkId,
    /// Its current owner.
    pub owner: OwnerId,
    /// Activity counter at selection time.
    pub activity: u64,
}

/// Point-in-time view of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSnapshot {
    /// Owning connection.
    pub owner: Option<OwnerId>,
    /// Backing memory is mapped.
    pub allocated: bool,
    /// An EVICT for this chunk awaits acknowledgement.
    pub pending_evict: bool,
    /// Last reported activity.
    pub activity: u64,
}

/// Pool-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Hard maximum.
    pub max_chunks: usize,
    /// Advertised capacity.
    pub capacity: usize,
    /// Owned chunks.
    pub mapped: usize,
    /// Chunks available for binding.
    pub free: usize,
    /// Chunks awaiting an eviction acknowledgement.
    pub pending_evict: usize,
}

#[derive(Debug, Default)]
struct Chunk {
    owner: Option<OwnerId>,
    backing: Option<(MemoryRegion, Registration)>,
    activity: u64,
    pending_evict: bool,
    epoch: u64,
}

#[derive(Debug)]
struct PoolState {
    chunks: Vec<Chunk>,
    capacity: usize,
    mapped: usize,
}

impl PoolState {
    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.mapped)
    }

    fn unbind(&mut self, index: usize, registrar: &dyn Registrar) {
        let chunk = &mut self.chunks[index];
        if let Some((region, registration)) = chunk.backing.take() {
            registrar.deregister(registration);
            drop(region);
        }
        chunk.owner = None;
        chunk.activity = 0;
        chunk.pending_evict = false;
        self.mapped -= 1;
    }

    fn victims(&self, k: usize) -> Vec<EvictionCandidate> {
        let mut candidates: Vec<EvictionCandidate> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.pending_evict)
            .filter_map(|(i, c)| {
                c.owner.map(|owner| EvictionCandidate {
                    chunk: ChunkId::new(i as u32),
                    owner,
                    activity: c.activity,
                })
            })
            .collect();
        candidates.sort_by_key(|c| (c.activity, c.chunk));
        candidates.truncate(k);
        candidates
    }
}

/// The shared inventory of chunks.
pub struct ChunkPool {
    state: Mutex<PoolState>,
    max_chunks: usize,
    chunk_size: usize,
    registrar: Arc<dyn Registrar>,
}

impl fmt::Debug for ChunkPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkPool")
            .field("stats", &self.stats())
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl ChunkPool {
    /// Build a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero sizes or an initial capacity
    /// above the maximum.
    pub fn new(config: &PoolConfig, registrar: Arc<dyn Registrar>) -> Result<Self> {
        let chunk_size = usize::try_from(config.chunk_size)
            .map_err(|_| Error::InvalidConfig("chunk size exceeds address space".to_string()))?;
        Self::with_capacity(
            config.max_chunks,
            config.initial_capacity(),
            chunk_size,
            registrar,
        )
    }

    /// Build a pool with an explicit table size and starting capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for zero sizes or
    /// `capacity > max_chunks`.
    pub fn with_capacity(
        max_chunks: usize,
        capacity: usize,
        chunk_size: usize,
        registrar: Arc<dyn Registrar>,
    ) -> Result<Self> {
        if max_chunks == 0 || u32::try_from(max_chunks).is_err() {
            return Err(Error::InvalidConfig(format!(
                "max_chunks must be in 1..=u32::MAX, got {max_chunks}"
            )));
        }
        if capacity > max_chunks {
            return Err(Error::InvalidConfig(format!(
                "capacity {capacity} exceeds max_chunks {max_chunks}"
            )));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be non-zero".to_string()));
        }
        let chunks = std::iter::repeat_with(Chunk::default)
            .take(max_chunks)
            .collect();
        Ok(Self {
            state: Mutex::new(PoolState {
                chunks,
                capacity,
                mapped: 0,
            }),
            max_chunks,
            chunk_size,
            registrar,
        })
    }

    /// Reserve and commit `n` free chunks for `owner`.
    ///
    /// Chunks are taken in ascending index order. Either all `n` chunks are
    /// bound or the pool is left untouched.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `n` is zero
    /// - [`Error::PoolExhausted`] if fewer than `n` chunks are free
    /// - [`Error::Region`] if backing memory cannot be mapped or registered
    pub fn bind(&self, owner: OwnerId, n: usize) -> Result<Vec<ChunkLease>> {
        if n == 0 {
            return Err(Error::InvalidRequest("bind of zero chunks".to_string()));
        }
        let mut state = self.state.lock();
        let available = state.free();
        if n > available {
            return Err(Error::PoolExhausted {
                requested: n,
                available,
            });
        }

        let picked: Vec<usize> = state
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.owner.is_none())
            .map(|(i, _)| i)
            .take(n)
            .collect();
        if picked.len() < n {
            return Err(Error::PoolExhausted {
                requested: n,
                available: picked.len(),
            });
        }

        // Commit backing memory before touching pool state so a failure
        // leaves nothing half-bound.
        let mut backings = Vec::with_capacity(n);
        for _ in &picked {
            match self.commit() {
                Ok(backing) => backings.push(backing),
                Err(e) => {
                    for (_, registration) in &backings {
                        self.registrar.deregister(*registration);
                    }
                    return Err(e);
                }
            }
        }

        let mut leases = Vec::with_capacity(n);
        for (index, (region, registration)) in picked.into_iter().zip(backings) {
            let chunk = &mut state.chunks[index];
            chunk.owner = Some(owner);
            chunk.backing = Some((region, registration));
            chunk.activity = 0;
            chunk.pending_evict = false;
            chunk.epoch += 1;
            leases.push(ChunkLease {
                chunk: ChunkId::new(index as u32),
                owner,
                epoch: chunk.epoch,
                registration,
            });
        }
        state.mapped += n;
        debug!(%owner, chunks = n, mapped = state.mapped, free = state.free(), "bound chunks");
        Ok(leases)
    }

    fn commit(&self) -> Result<(MemoryRegion, Registration)> {
        let region = MemoryRegion::allocate(self.chunk_size)?;
        let registration = self.registrar.register(&region)?;
        Ok((region, registration))
    }

    /// Return leased chunks to the pool.
    ///
    /// Every lease is validated before any chunk is released; a lease that is
    /// not held by `owner`, or that belongs to an earlier binding of its
    /// chunk, rejects the whole call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnershipViolation`] and leaves the pool unchanged.
    pub fn release(&self, owner: OwnerId, leases: Vec<ChunkLease>) -> Result<usize> {
        let mut state = self.state.lock();
        for lease in &leases {
            let chunk = &state.chunks[lease.chunk.index()];
            if lease.owner != owner || chunk.owner != Some(owner) || chunk.epoch != lease.epoch {
                let err = Error::OwnershipViolation {
                    chunk: lease.chunk,
                    caller: owner,
                    owner: chunk.owner,
                };
                error!(error = %err, "rejected chunk release");
                return Err(err);
            }
        }
        for lease in &leases {
            state.unbind(lease.chunk.index(), self.registrar.as_ref());
        }
        debug!(%owner, chunks = leases.len(), mapped = state.mapped, "released chunks");
        Ok(leases.len())
    }

    /// Release every chunk owned by `owner`, leased or not.
    ///
    /// Used when a connection is torn down; returns the number released.
    pub fn release_all(&self, owner: OwnerId) -> usize {
        let mut state = self.state.lock();
        let owned: Vec<usize> = state
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.owner == Some(owner))
            .map(|(i, _)| i)
            .collect();
        for &index in &owned {
            state.unbind(index, self.registrar.as_ref());
        }
        if !owned.is_empty() {
            debug!(%owner, chunks = owned.len(), mapped = state.mapped, "released all chunks");
        }
        owned.len()
    }

    /// Up to `k` owned chunks, lowest activity first, ties by ascending index.
    /// Chunks already pending eviction are skipped.
    #[must_use]
    pub fn select_eviction_victims(&self, k: usize) -> Vec<EvictionCandidate> {
        self.state.lock().victims(k)
    }

    /// Select victims like [`select_eviction_victims`](Self::select_eviction_victims)
    /// and mark them pending in the same critical section, so no chunk is
    /// ever the target of two outstanding EVICTs.
    #[must_use]
    pub fn begin_eviction(&self, k: usize) -> Vec<EvictionCandidate> {
        let mut state = self.state.lock();
        let victims = state.victims(k);
        for v in &victims {
            state.chunks[v.chunk.index()].pending_evict = true;
        }
        victims
    }

    /// Drop the pending-eviction mark from chunks that were not reclaimed.
    pub fn clear_pending(&self, chunks: &[ChunkId]) {
        let mut state = self.state.lock();
        for id in chunks {
            if let Some(chunk) = state.chunks.get_mut(id.index()) {
                chunk.pending_evict = false;
            }
        }
    }

    /// Store the client-reported access count for a leased chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnershipViolation`] if the lease is stale.
    pub fn record_activity(&self, lease: &ChunkLease, accesses: u64) -> Result<()> {
        let mut state = self.state.lock();
        let chunk = &mut state.chunks[lease.chunk.index()];
        if chunk.owner != Some(lease.owner) || chunk.epoch != lease.epoch {
            return Err(Error::OwnershipViolation {
                chunk: lease.chunk,
                caller: lease.owner,
                owner: chunk.owner,
            });
        }
        chunk.activity = accesses;
        Ok(())
    }

    /// Raise advertised capacity by `step`, up to the hard maximum.
    /// Returns the new capacity.
    pub fn expand(&self, step: usize) -> usize {
        let mut state = self.state.lock();
        state.capacity = state.capacity.saturating_add(step).min(self.max_chunks);
        state.capacity
    }

    /// Lower advertised capacity by `n`, never below the mapped count.
    /// Returns the new capacity.
    pub fn shrink(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        state.capacity = state.capacity.saturating_sub(n).max(state.mapped);
        state.capacity
    }

    /// Chunks available for binding.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free()
    }

    /// Owned chunks.
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.state.lock().mapped
    }

    /// Advertised capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Hard maximum.
    #[must_use]
    pub const fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    /// Bytes per chunk.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Chunks currently owned by `owner`, ascending.
    #[must_use]
    pub fn owned_by(&self, owner: OwnerId) -> Vec<ChunkId> {
        self.state
            .lock()
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.owner == Some(owner))
            .map(|(i, _)| ChunkId::new(i as u32))
            .collect()
    }

    /// Consistent view of every chunk.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChunkSnapshot> {
        self.state
            .lock()
            .chunks
            .iter()
            .map(|c| ChunkSnapshot {
                owner: c.owner,
                allocated: c.backing.is_some(),
                pending_evict: c.pending_evict,
                activity: c.activity,
            })
            .collect()
    }

    /// Pool-wide counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max_chunks: self.max_chunks,
            capacity: state.capacity,
            mapped: state.mapped,
            free: state.free(),
            pending_evict: state.chunks.iter().filter(|c| c.pending_evict).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 64 * 1024;

    fn pool(max: usize) -> ChunkPool {
        ChunkPool::with_capacity(max, max, CHUNK, Arc::new(LocalRegistrar::new())).unwrap()
    }

    fn owner(slot: u32) -> OwnerId {
        OwnerId::new(slot, 1)
    }

    fn assert_consistent(pool: &ChunkPool) {
        let snap = pool.snapshot();
        let owned = snap.iter().filter(|c| c.owner.is_some()).count();
        assert_eq!(owned, pool.mapped_count());
        for c in &snap {
            if c.allocated || c.pending_evict {
                assert!(c.owner.is_some());
            }
        }
    }

    #[test]
    fn test_bind_ascending_order() {
        let pool = pool(8);
        let leases = pool.bind(owner(0), 3).unwrap();
        let ids: Vec<usize> = leases.iter().map(|l| l.chunk().index()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(pool.mapped_count(), 3);
        assert_eq!(pool.free_count(), 5);
        assert_consistent(&pool);
    }

    #[test]
    fn test_bind_fills_lowest_holes() {
        let pool = pool(8);
        let mut a = pool.bind(owner(0), 3).unwrap();
        let _b = pool.bind(owner(1), 2).unwrap();
        let middle = a.remove(1);
        pool.release(owner(0), vec![middle]).unwrap();
        let c = pool.bind(owner(2), 2).unwrap();
        let ids: Vec<usize> = c.iter().map(|l| l.chunk().index()).collect();
        assert_eq!(ids, vec![1, 5]);
        assert_consistent(&pool);
    }

    #[test]
    fn test_two_binds_then_exhausted() {
        let pool = pool(32);
        let _a = pool.bind(owner(0), 10).unwrap();
        let _b = pool.bind(owner(1), 5).unwrap();
        assert_eq!(pool.free_count(), 17);

        let before = pool.snapshot();
        let err = pool.bind(owner(2), 20).unwrap_err();
        assert!(matches!(
            err,
            Error::PoolExhausted {
                requested: 20,
                available: 17
            }
        ));
        assert_eq!(pool.free_count(), 17);
        assert_eq!(pool.snapshot(), before);
    }

    #[test]
    fn test_bind_zero_rejected() {
        let pool = pool(4);
        assert!(matches!(pool.bind(owner(0), 0), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_bound_chunks_are_allocated_and_registered() {
        let pool = pool(4);
        let leases = pool.bind(owner(0), 2).unwrap();
        assert_ne!(leases[0].registration().addr, 0);
        assert_ne!(leases[0].registration().rkey, leases[1].registration().rkey);
        let snap = pool.snapshot();
        assert!(snap[0].allocated && snap[1].allocated);
        assert!(!snap[2].allocated);
    }

    #[test]
    fn test_release_returns_chunks() {
        let pool = pool(4);
        let leases = pool.bind(owner(0), 3).unwrap();
        assert_eq!(pool.release(owner(0), leases).unwrap(), 3);
        assert_eq!(pool.mapped_count(), 0);
        assert!(pool.snapshot().iter().all(|c| !c.allocated && c.activity == 0));
    }

    #[test]
    fn test_release_by_wrong_owner_is_rejected() {
        let pool = pool(4);
        let leases = pool.bind(owner(0), 2).unwrap();
        let before = pool.snapshot();
        let err = pool.release(owner(1), leases).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(pool.snapshot(), before);
        assert_eq!(pool.mapped_count(), 2);
    }

    #[test]
    fn test_stale_lease_cannot_release_rebound_chunk() {
        let pool = pool(1);
        let stale = pool.bind(owner(0), 1).unwrap().remove(0);
        assert_eq!(pool.release_all(owner(0)), 1);
        let _fresh = pool.bind(owner(0), 1).unwrap();
        assert!(pool.release(owner(0), vec![stale]).is_err());
        assert_eq!(pool.mapped_count(), 1);
    }

    #[test]
    fn test_release_all_only_touches_owner() {
        let pool = pool(8);
        let _a = pool.bind(owner(0), 3).unwrap();
        let _b = pool.bind(owner(1), 2).unwrap();
        assert_eq!(pool.release_all(owner(0)), 3);
        assert_eq!(pool.mapped_count(), 2);
        assert_eq!(pool.owned_by(owner(1)), vec![ChunkId::new(3), ChunkId::new(4)]);
        assert!(pool.owned_by(owner(0)).is_empty());
        assert_consistent(&pool);
    }

    #[test]
    fn test_victims_lowest_activity_then_index() {
        let pool = pool(6);
        let a = pool.bind(owner(0), 3).unwrap();
        let b = pool.bind(owner(1), 3).unwrap();
        pool.record_activity(&a[0], 50).unwrap();
        pool.record_activity(&a[1], 5).unwrap();
        pool.record_activity(&a[2], 5).unwrap();
        pool.record_activity(&b[0], 0).unwrap();
        pool.record_activity(&b[1], 100).unwrap();
        pool.record_activity(&b[2], 5).unwrap();

        let victims: Vec<usize> = pool
            .select_eviction_victims(4)
            .iter()
            .map(|v| v.chunk.index())
            .collect();
        assert_eq!(victims, vec![3, 1, 2, 5]);
        assert_eq!(pool.select_eviction_victims(4), pool.select_eviction_victims(4));
    }

    #[test]
    fn test_begin_eviction_skips_pending() {
        let pool = pool(4);
        let _a = pool.bind(owner(0), 4).unwrap();
        let first = pool.begin_eviction(2);
        let second = pool.begin_eviction(4);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|f| !second.contains(f)));
        assert_eq!(pool.stats().pending_evict, 4);

        let ids: Vec<ChunkId> = first.iter().map(|c| c.chunk).collect();
        pool.clear_pending(&ids);
        assert_eq!(pool.stats().pending_evict, 2);
    }

    #[test]
    fn test_release_clears_pending() {
        let pool = pool(2);
        let leases = pool.bind(owner(0), 2).unwrap();
        let _ = pool.begin_eviction(2);
        pool.release(owner(0), leases).unwrap();
        assert_eq!(pool.stats().pending_evict, 0);
    }

    #[test]
    fn test_select_victims_caps_at_owned() {
        let pool = pool(8);
        let _a = pool.bind(owner(0), 2).unwrap();
        assert_eq!(pool.select_eviction_victims(10).len(), 2);
        assert!(pool.select_eviction_victims(0).is_empty());
    }

    #[test]
    fn test_record_activity_stale_lease() {
        let pool = pool(1);
        let lease = pool.bind(owner(0), 1).unwrap().remove(0);
        pool.release_all(owner(0));
        assert!(pool.record_activity(&lease, 3).is_err());
    }

    #[test]
    fn test_expand_and_shrink() {
        let pool = ChunkPool::with_capacity(8, 2, CHUNK, Arc::new(LocalRegistrar::new())).unwrap();
        assert_eq!(pool.free_count(), 2);
        assert!(pool.bind(owner(0), 3).is_err());
        assert_eq!(pool.expand(1), 3);
        let _a = pool.bind(owner(0), 3).unwrap();
        assert_eq!(pool.expand(100), 8);
        assert_eq!(pool.shrink(7), 3);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_invalid_construction() {
        let reg: Arc<dyn Registrar> = Arc::new(LocalRegistrar::new());
        assert!(ChunkPool::with_capacity(0, 0, CHUNK, reg.clone()).is_err());
        assert!(ChunkPool::with_capacity(4, 5, CHUNK, reg.clone()).is_err());
        assert!(ChunkPool::with_capacity(4, 4, 0, reg).is_err());
    }

    #[test]
    fn test_failed_registration_leaves_pool_untouched() {
        struct Refusing;
        impl Registrar for Refusing {
            fn register(&self, _region: &MemoryRegion) -> Result<Registration> {
                Err(Error::Region("no protection domain".to_string()))
            }
            fn deregister(&self, _registration: Registration) {}
        }
        let pool = ChunkPool::with_capacity(4, 4, CHUNK, Arc::new(Refusing)).unwrap();
        assert!(matches!(pool.bind(owner(0), 2), Err(Error::Region(_))));
        assert_eq!(pool.mapped_count(), 0);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_local_registrar_keys_nonzero_and_distinct() {
        let reg = LocalRegistrar::new();
        let region = MemoryRegion::allocate(4096).unwrap();
        let a = reg.register(&region).unwrap();
        let b = reg.register(&region).unwrap();
        assert_eq!(a.rkey.get(), 1);
        assert_eq!(b.rkey.get(), 2);
        assert_eq!(a.addr, region.addr());
    }
}
