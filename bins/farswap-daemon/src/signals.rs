//! SIGINT/SIGTERM handling.

use crate::context::Shutdown;
use crate::error::DaemonError;
use tracing::{info, warn};

/// Install handlers for SIGINT and SIGTERM.
///
/// The first signal requests a graceful shutdown: the accept loop stops,
/// the monitor stops and every connection gets the STOP handshake. A second
/// signal exits immediately.
pub fn install(shutdown: Shutdown) -> Result<(), DaemonError> {
    ctrlc::set_handler(move || {
        if shutdown.is_requested() {
            warn!("Received second interrupt, forcing exit");
            std::process::exit(1);
        }
        info!("Received shutdown signal, stopping connections");
        shutdown.request();
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_leaves_shutdown_clear() {
        let shutdown = Shutdown::new();
        // The handler can only be installed once per process.
        let _ = install(shutdown.clone());
        assert!(!shutdown.is_requested());
    }
}
