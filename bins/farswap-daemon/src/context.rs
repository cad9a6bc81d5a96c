//! Process-wide context handed to the accept loop and the monitor.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shutdown signal shared by every long-lived loop.
///
/// Unlike a bare flag, waiters can sleep on it and wake as soon as shutdown
/// is requested.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake all waiters.
    pub fn request(&self) {
        let (flag, cond) = &*self.inner;
        *flag.lock() = true;
        cond.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for up to `timeout`. Returns true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cond) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut requested = flag.lock();
        while !*requested {
            if cond.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        *requested
    }
}

/// Values fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub shutdown: Shutdown,
    pub page_size: u64,
}

impl ProcessContext {
    /// Build a context for the running host.
    ///
    /// # Errors
    ///
    /// Returns an error if the page size cannot be queried.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            shutdown: Shutdown::new(),
            page_size: page_size()?,
        })
    }
}

fn page_size() -> std::io::Result<u64> {
    use nix::unistd::{sysconf, SysconfVar};

    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as u64),
        Ok(_) => Err(std::io::Error::other("page size unavailable")),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_times_out_without_request() {
        let shutdown = Shutdown::new();
        let start = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_request_wakes_waiter() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(10));
        shutdown.request();
        assert!(waiter.join().unwrap());
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let ctx = ProcessContext::new().unwrap();
        assert!(ctx.page_size.is_power_of_two());
        assert!(!ctx.shutdown.is_requested());
    }
}
