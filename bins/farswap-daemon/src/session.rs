//! Session registry.
//!
//! A fixed-size arena of connection slots. Each slot carries a generation so
//! an [`OwnerId`] handed out for one occupant never matches the next one.
//! Transport events are routed to connections through the endpoint map.
//!
//! Connections are always torn down outside the registry lock: teardown
//! waits for the connection's dispatcher, and that dispatcher may itself be
//! blocked behind the pool lock.

use crate::connection::{Connection, EvictTicket};
use crate::dispatcher;
use crate::error::DaemonError;
use crate::stats::DaemonStats;
use crate::transport::{Endpoint, EndpointId};
use farswap_core::config::SessionConfig;
use farswap_core::{ChunkId, ChunkPool, EvictionCandidate, OwnerId, WireCodec};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

struct Occupant {
    conn: Arc<Connection>,
    dispatcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

struct Slots {
    entries: Vec<Slot>,
    by_endpoint: FxHashMap<EndpointId, OwnerId>,
    count: usize,
}

impl Slots {
    fn occupant(&self, owner: OwnerId) -> Option<&Occupant> {
        let slot = self.entries.get(owner.slot())?;
        if slot.generation != owner.generation() {
            return None;
        }
        slot.occupant.as_ref()
    }

    fn take(&mut self, owner: OwnerId) -> Option<Occupant> {
        let slot = self.entries.get_mut(owner.slot())?;
        if slot.generation != owner.generation() {
            return None;
        }
        let occupant = slot.occupant.take()?;
        self.by_endpoint.remove(&occupant.conn.endpoint_id());
        self.count -= 1;
        Some(occupant)
    }
}

/// Result of one eviction batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Chunks selected as victims.
    pub selected: usize,
    /// Chunks returned to the pool, acknowledged or force-released.
    pub reclaimed: usize,
    /// Connections declared failed during the batch.
    pub failed: Vec<OwnerId>,
}

pub struct SessionRegistry {
    slots: Mutex<Slots>,
    pool: Arc<ChunkPool>,
    codec: WireCodec,
    config: SessionConfig,
    stats: Arc<DaemonStats>,
    evict_list: Mutex<Vec<EvictionCandidate>>,
}

impl SessionRegistry {
    pub fn new(
        config: SessionConfig,
        pool: Arc<ChunkPool>,
        codec: WireCodec,
        stats: Arc<DaemonStats>,
    ) -> Self {
        let entries = std::iter::repeat_with(Slot::default)
            .take(config.max_clients)
            .collect();
        Self {
            slots: Mutex::new(Slots {
                entries,
                by_endpoint: FxHashMap::default(),
                count: 0,
            }),
            pool,
            codec,
            config,
            stats,
            evict_list: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.pool
    }

    /// Claim a slot for a connecting endpoint.
    ///
    /// No chunk is allocated here; the endpoint still has to be accepted.
    pub fn admit(&self, endpoint: Arc<dyn Endpoint>) -> Result<OwnerId, DaemonError> {
        let mut slots = self.slots.lock();
        let Some(index) = slots.entries.iter().position(|s| s.occupant.is_none()) else {
            self.stats.record_admission_reject();
            return Err(DaemonError::CapacityExceeded {
                max: self.config.max_clients,
            });
        };
        let slot_index = u32::try_from(index).map_err(|_| DaemonError::CapacityExceeded {
            max: self.config.max_clients,
        })?;

        let slot = &mut slots.entries[index];
        slot.generation = slot.generation.wrapping_add(1);
        let owner = OwnerId::new(slot_index, slot.generation);
        let endpoint_id = endpoint.id();
        let conn = Connection::new(
            owner,
            endpoint,
            self.codec,
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
        );
        slot.occupant = Some(Occupant {
            conn: Arc::new(conn),
            dispatcher: None,
        });
        slots.by_endpoint.insert(endpoint_id, owner);
        slots.count += 1;
        self.stats.record_admission();
        info!(%owner, endpoint = endpoint_id, active = slots.count, "connection admitted");
        Ok(owner)
    }

    /// The endpoint is up: start its dispatcher and greet the client.
    pub fn established(&self, endpoint: EndpointId) -> Result<OwnerId, DaemonError> {
        let conn = {
            let slots = self.slots.lock();
            let owner = *slots
                .by_endpoint
                .get(&endpoint)
                .ok_or(DaemonError::UnknownEndpoint(endpoint))?;
            let occupant = slots
                .occupant(owner)
                .ok_or(DaemonError::UnknownEndpoint(endpoint))?;
            Arc::clone(&occupant.conn)
        };
        let owner = conn.owner();

        let handle = dispatcher::spawn(Arc::clone(&conn), self.config.poll_interval())?;
        let orphaned = {
            let mut slots = self.slots.lock();
            match slots.entries.get_mut(owner.slot()).and_then(|s| s.occupant.as_mut()) {
                Some(occupant) if Arc::ptr_eq(&occupant.conn, &conn) => {
                    occupant.dispatcher = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        if let Some(handle) = orphaned {
            // Removed while the dispatcher was starting.
            conn.teardown();
            let _ = handle.join();
            return Err(DaemonError::UnknownEndpoint(endpoint));
        }
        conn.greet()?;
        debug!(%owner, "connection established");
        Ok(owner)
    }

    pub fn connection(&self, owner: OwnerId) -> Option<Arc<Connection>> {
        self.slots
            .lock()
            .occupant(owner)
            .map(|o| Arc::clone(&o.conn))
    }

    pub fn owner_of(&self, endpoint: EndpointId) -> Option<OwnerId> {
        self.slots.lock().by_endpoint.get(&endpoint).copied()
    }

    /// Active connections.
    pub fn len(&self) -> usize {
        self.slots.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        let slots = self.slots.lock();
        slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, s)| s.occupant.is_some())
            .filter_map(|(i, s)| u32::try_from(i).ok().map(|i| OwnerId::new(i, s.generation)))
            .collect()
    }

    /// Free-chunk count reported in FREE_SIZE.
    pub fn free_chunks(&self) -> usize {
        self.pool.free_count()
    }

    /// Remove the connection bound to `endpoint`. Returns the chunks
    /// released, or `None` if the endpoint is unknown.
    pub fn remove_endpoint(&self, endpoint: EndpointId) -> Option<usize> {
        let owner = self.owner_of(endpoint)?;
        self.remove(owner)
    }

    /// Tear down and forget `owner`. Returns the chunks released.
    pub fn remove(&self, owner: OwnerId) -> Option<usize> {
        let occupant = self.slots.lock().take(owner)?;
        let released = occupant.conn.teardown();
        if let Some(handle) = occupant.dispatcher {
            if handle.join().is_err() {
                warn!(%owner, "dispatcher panicked");
            }
        }
        info!(%owner, released, active = self.len(), "connection removed");
        Some(released)
    }

    /// Tear down `owner` after `reason`. Returns the chunks released, or
    /// `None` if the connection was already gone.
    fn fail(&self, owner: OwnerId, reason: &DaemonError) -> Option<usize> {
        let released = self.remove(owner)?;
        if reason.is_peer_failure() {
            warn!(%owner, error = %reason, released, "declaring connection failed");
        } else {
            error!(%owner, error = %reason, released, "connection failed during eviction");
        }
        self.stats.record_failed_connection();
        Some(released)
    }

    /// Reclaim up to `k` chunks.
    ///
    /// Victims are marked pending and grouped by owner; every affected
    /// connection gets one EVICT, then each acknowledgement is awaited for up
    /// to `timeout`. A connection that fails to acknowledge is torn down,
    /// which force-releases its chunks.
    pub fn evict(&self, k: usize, timeout: Duration) -> EvictionOutcome {
        let victims = self.pool.begin_eviction(k);
        let mut outcome = EvictionOutcome {
            selected: victims.len(),
            ..EvictionOutcome::default()
        };
        if victims.is_empty() {
            *self.evict_list.lock() = victims;
            return outcome;
        }

        let mut by_owner: BTreeMap<OwnerId, Vec<ChunkId>> = BTreeMap::new();
        for victim in &victims {
            by_owner.entry(victim.owner).or_default().push(victim.chunk);
        }

        let mut waiting: Vec<(Arc<Connection>, EvictTicket)> = Vec::new();
        for (owner, chunks) in by_owner {
            let Some(conn) = self.connection(owner) else {
                continue;
            };
            match conn.send_evict(&chunks) {
                Ok(ticket) => waiting.push((conn, ticket)),
                Err(e) => {
                    drop(conn);
                    if let Some(released) = self.fail(owner, &e) {
                        outcome.reclaimed += released;
                        outcome.failed.push(owner);
                    }
                }
            }
        }

        for (conn, ticket) in waiting {
            let owner = conn.owner();
            match conn.finish_evict(ticket, timeout) {
                Ok(released) => outcome.reclaimed += released,
                Err(e) => {
                    drop(conn);
                    // Teardown returns every chunk the owner held, not just
                    // the victims.
                    if let Some(released) = self.fail(owner, &e) {
                        outcome.reclaimed += released;
                        outcome.failed.push(owner);
                    }
                }
            }
        }

        let ids: Vec<ChunkId> = victims.iter().map(|v| v.chunk).collect();
        self.pool.clear_pending(&ids);
        *self.evict_list.lock() = victims;
        info!(
            selected = outcome.selected,
            reclaimed = outcome.reclaimed,
            failed = outcome.failed.len(),
            "eviction batch finished"
        );
        outcome
    }

    /// Victims chosen by the most recent eviction batch.
    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.evict_list.lock().clone()
    }

    /// Run the STOP handshake with every connection, then remove them all.
    ///
    /// STOP goes out to everyone first; all handshakes then share one
    /// `timeout` deadline.
    pub fn stop_all(&self, timeout: Duration) {
        let conns: Vec<Arc<Connection>> = self
            .owners()
            .into_iter()
            .filter_map(|owner| self.connection(owner))
            .collect();
        let mut stopping = Vec::with_capacity(conns.len());
        for conn in &conns {
            match conn.send_stop() {
                Ok(()) => stopping.push(conn),
                Err(e) => warn!(owner = %conn.owner(), error = %e, "STOP not sent"),
            }
        }
        let deadline = Instant::now() + timeout;
        for conn in stopping {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = conn.finish_stop(remaining) {
                warn!(owner = %conn.owner(), error = %e, "STOP handshake incomplete");
            }
        }
        for conn in conns {
            self.remove(conn.owner());
        }
    }
}
