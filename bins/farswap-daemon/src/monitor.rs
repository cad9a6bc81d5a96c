//! Eviction/expansion monitor thread.

use crate::context::Shutdown;
use crate::session::SessionRegistry;
use crate::stats::DaemonStats;
use farswap_core::units::format_size;
use farswap_core::{Decision, HostMemory, PressurePolicy};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Samples host free memory and turns [`PressurePolicy`] decisions into
/// eviction batches and capacity changes.
pub struct Monitor {
    policy: PressurePolicy,
    host: Box<dyn HostMemory>,
    registry: Arc<SessionRegistry>,
    interval: Duration,
    ack_timeout: Duration,
    stats: Arc<DaemonStats>,
}

impl Monitor {
    pub fn new(
        policy: PressurePolicy,
        host: Box<dyn HostMemory>,
        registry: Arc<SessionRegistry>,
        interval: Duration,
        ack_timeout: Duration,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            policy,
            host,
            registry,
            interval,
            ack_timeout,
            stats,
        }
    }

    /// Run one sampling cycle.
    pub fn tick(&mut self) -> Decision {
        let free = match self.host.free_bytes() {
            Ok(free) => free,
            Err(e) => {
                warn!(error = %e, "free memory sample failed");
                return Decision::Hold;
            }
        };
        let decision = self.policy.observe(free);
        let pool = Arc::clone(self.registry.pool());

        match decision {
            Decision::Hold => {
                trace!(free = %format_size(free), avg_gb = ?self.policy.average_gb(), "holding");
            }
            Decision::Evict { chunks } => {
                info!(
                    free = %format_size(free),
                    avg_gb = ?self.policy.average_gb(),
                    chunks,
                    "memory pressure, evicting"
                );
                let outcome = self.registry.evict(chunks, self.ack_timeout);
                if outcome.reclaimed > 0 {
                    let capacity = pool.shrink(outcome.reclaimed);
                    self.stats.record_eviction(outcome.reclaimed);
                    info!(reclaimed = outcome.reclaimed, capacity, "capacity reduced");
                } else {
                    debug!("nothing to evict");
                }
            }
            Decision::Expand { chunks } => {
                if pool.capacity() < pool.max_chunks() {
                    let capacity = pool.expand(chunks);
                    self.stats.record_expansion();
                    info!(capacity, max = pool.max_chunks(), "capacity expanded");
                } else {
                    trace!("already at maximum capacity");
                }
            }
        }
        decision
    }

    /// Sample every interval until shutdown is requested.
    pub fn run(mut self, shutdown: &Shutdown) {
        info!(interval = ?self.interval, "monitor started");
        while !shutdown.wait_timeout(self.interval) {
            self.tick();
        }
        info!("monitor stopped");
    }

    /// Run the monitor on its own thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn spawn(self, shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("farswap-monitor".to_string())
            .spawn(move || self.run(&shutdown))
    }
}
