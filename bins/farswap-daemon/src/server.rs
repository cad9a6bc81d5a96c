//! Transport event loop.

use crate::context::Shutdown;
use crate::error::DaemonError;
use crate::session::SessionRegistry;
use crate::transport::{Listener, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sequentially dispatches connect-request, established and disconnected
/// events until shutdown is requested.
pub struct Server<L: Listener> {
    listener: L,
    registry: Arc<SessionRegistry>,
    shutdown: Shutdown,
    poll: Duration,
}

impl<L: Listener> Server<L> {
    pub fn new(
        listener: L,
        registry: Arc<SessionRegistry>,
        shutdown: Shutdown,
        poll: Duration,
    ) -> Self {
        Self {
            listener,
            registry,
            shutdown,
            poll,
        }
    }

    /// Serve events until shutdown.
    ///
    /// # Errors
    ///
    /// A listener failure is fatal and ends the loop.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        info!("accepting connections");
        while !self.shutdown.is_requested() {
            if let Some(event) = self.listener.next_event(self.poll)? {
                self.handle_event(event);
            }
        }
        info!(active = self.registry.len(), "accept loop stopped");
        Ok(())
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectRequest(endpoint) => {
                let id = endpoint.id();
                match self.registry.admit(Arc::clone(&endpoint)) {
                    Ok(owner) => {
                        if let Err(e) = endpoint.accept() {
                            warn!(%owner, endpoint = id, error = %e, "accept failed");
                            self.registry.remove(owner);
                        }
                    }
                    Err(e) => {
                        info!(endpoint = id, error = %e, "rejecting connection");
                        endpoint.reject();
                    }
                }
            }
            TransportEvent::Established(id) => {
                if let Err(e) = self.registry.established(id) {
                    if e.is_recoverable() {
                        warn!(endpoint = id, error = %e, "could not start connection");
                    } else {
                        error!(endpoint = id, error = %e, "connection setup failed");
                    }
                    self.registry.remove_endpoint(id);
                }
            }
            TransportEvent::Disconnected(id) => match self.registry.remove_endpoint(id) {
                Some(released) => info!(endpoint = id, released, "client disconnected"),
                None => debug!(endpoint = id, "disconnect for unknown endpoint"),
            },
        }
    }
}
