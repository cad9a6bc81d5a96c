//! farswap-daemon - remote memory donor for swap clients
//!
//! The daemon carves host memory into fixed-size chunks, registers them for
//! remote access and leases them to connected clients that use them as a
//! swap backend. A monitor thread watches host free memory: under pressure
//! it asks clients to give chunks back (least active first), and once memory
//! is plentiful again it offers more.
//!
//! # Threads
//!
//! - the server loop owns the [`Listener`](transport::Listener) and handles
//!   connect, establish and disconnect events one at a time
//! - every connection has a dispatcher thread draining its completions
//! - one monitor thread samples free memory and runs eviction batches
//!
//! # Example
//!
//! ```no_run
//! use farswap_core::{Config, ProcMeminfo, WireCodec};
//! use farswap_daemon::context::ProcessContext;
//! use farswap_daemon::transport::tcp::TcpTransport;
//! use farswap_daemon::Daemon;
//!
//! let config = Config::default();
//! let codec = WireCodec::new(config.pool.max_entries).unwrap();
//! let listener = TcpTransport::bind("0.0.0.0:9400".parse().unwrap(), codec.frame_len()).unwrap();
//! let context = ProcessContext::new().unwrap();
//!
//! let daemon = Daemon::new(listener, &config, context, Box::new(ProcMeminfo::new())).unwrap();
//! let stats = daemon.run().unwrap();
//! println!("{stats}");
//! ```

#![deny(clippy::panic)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod signals;
pub mod stats;
pub mod transport;

pub use error::DaemonError;
pub use session::{EvictionOutcome, SessionRegistry};
pub use stats::{DaemonStats, StatsSnapshot};

use context::{ProcessContext, Shutdown};
use farswap_core::{ChunkPool, Config, HostMemory, PressurePolicy, WireCodec};
use monitor::Monitor;
use server::Server;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use transport::Listener;

/// A fully wired daemon: pool, session registry, monitor and server loop.
pub struct Daemon<L: Listener> {
    server: Server<L>,
    monitor: Monitor,
    registry: Arc<SessionRegistry>,
    stats: Arc<DaemonStats>,
    shutdown: Shutdown,
    ack_timeout: Duration,
}

impl<L: Listener> Daemon<L> {
    /// Build the daemon on top of `listener`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid for this host or the
    /// initial chunks cannot be mapped and registered.
    pub fn new(
        listener: L,
        config: &Config,
        context: ProcessContext,
        host: Box<dyn HostMemory>,
    ) -> Result<Self, DaemonError> {
        config.validate(context.page_size)?;

        let codec = WireCodec::new(config.pool.max_entries)?;
        let pool = Arc::new(ChunkPool::new(&config.pool, listener.registrar())?);
        let stats = Arc::new(DaemonStats::new());
        let registry = Arc::new(SessionRegistry::new(
            config.session.clone(),
            Arc::clone(&pool),
            codec,
            Arc::clone(&stats),
        ));

        let policy = PressurePolicy::new(&config.monitor, config.pool.chunk_size);
        let monitor = Monitor::new(
            policy,
            host,
            Arc::clone(&registry),
            config.monitor.sample_interval(),
            config.session.ack_timeout(),
            Arc::clone(&stats),
        );
        let server = Server::new(
            listener,
            Arc::clone(&registry),
            context.shutdown.clone(),
            config.session.poll_interval(),
        );

        info!(
            max_chunks = pool.max_chunks(),
            capacity = pool.capacity(),
            chunk_size = config.pool.chunk_size,
            max_clients = config.session.max_clients,
            "daemon initialized"
        );

        Ok(Self {
            server,
            monitor,
            registry,
            stats,
            shutdown: context.shutdown,
            ack_timeout: config.session.ack_timeout(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<DaemonStats> {
        &self.stats
    }

    /// Handle used to stop [`Daemon::run`].
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve until shutdown is requested, then STOP every client.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor cannot be started or the listener
    /// fails. Clients are still stopped in the latter case.
    pub fn run(self) -> Result<StatsSnapshot, DaemonError> {
        let Self {
            mut server,
            monitor,
            registry,
            stats,
            shutdown,
            ack_timeout,
        } = self;

        let monitor = monitor.spawn(shutdown.clone())?;
        let served = server.run();

        shutdown.request();
        if monitor.join().is_err() {
            warn!("monitor thread panicked");
        }
        registry.stop_all(ack_timeout);

        let snapshot = stats.snapshot();
        info!(
            admissions = snapshot.admissions,
            eviction_batches = snapshot.eviction_batches,
            expansions = snapshot.expansions,
            "daemon stopped"
        );
        served.map(|()| snapshot)
    }
}
