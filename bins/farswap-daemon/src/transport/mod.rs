//! Transport abstraction.
//!
//! The daemon only needs a handful of things from the wire:
//! - connection lifecycle events (request, established, disconnected)
//! - reliable delivery of fixed-size control frames, with receives gated by
//!   explicitly posted receive credits
//! - registration of chunk memory for remote access
//!
//! `Listener` and `Endpoint` capture exactly that, so the session layer can
//! be driven by the in-process [`loopback`] transport in tests and by
//! [`tcp`] in production.

pub mod loopback;
pub mod tcp;

use farswap_core::Registrar;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transport-assigned endpoint identifier, unique per listener.
pub type EndpointId = u64;

/// Connection lifecycle event.
pub enum TransportEvent {
    /// A peer wants to connect; answer with [`Endpoint::accept`] or
    /// [`Endpoint::reject`].
    ConnectRequest(Arc<dyn Endpoint>),
    /// An accepted endpoint is ready for traffic.
    Established(EndpointId),
    /// The endpoint is gone, from either side.
    Disconnected(EndpointId),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRequest(ep) => f.debug_tuple("ConnectRequest").field(&ep.id()).finish(),
            Self::Established(id) => f.debug_tuple("Established").field(id).finish(),
            Self::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
        }
    }
}

/// Work completed on an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A frame arrived into a posted receive.
    Recv(Vec<u8>),
    /// A posted send finished.
    Send,
}

/// Source of connection lifecycle events.
pub trait Listener: Send {
    /// Wait up to `timeout` for the next event.
    ///
    /// # Errors
    ///
    /// An error here means the listening context itself is broken.
    fn next_event(&mut self, timeout: Duration) -> io::Result<Option<TransportEvent>>;

    /// Registrar for chunk memory reachable through this transport.
    fn registrar(&self) -> Arc<dyn Registrar>;
}

/// One client connection.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Accept a pending connect request. `Established` follows.
    fn accept(&self) -> io::Result<()>;

    /// Refuse a pending connect request.
    fn reject(&self);

    /// Make room for one inbound frame.
    fn post_recv(&self) -> io::Result<()>;

    /// Queue one frame for delivery. A `Send` completion follows.
    fn post_send(&self, frame: Vec<u8>) -> io::Result<()>;

    /// Wait up to `timeout` for the next completion.
    ///
    /// # Errors
    ///
    /// Fails once the endpoint is closed and nothing is left to deliver.
    fn wait_completion(&self, timeout: Duration) -> io::Result<Option<Completion>>;

    /// Close the connection. Idempotent.
    fn disconnect(&self);
}

/// Event queue shared by a listener and the endpoints it created.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<TransportEvent>>,
    ready: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: TransportEvent) {
        self.events.lock().push_back(event);
        self.ready.notify_one();
    }

    /// Pop the next event, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<TransportEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            if self.ready.wait_until(&mut events, deadline).timed_out() {
                return events.pop_front();
            }
        }
    }
}
