//! Bounded-wait acknowledgement rendezvous.
//!
//! The monitor (or the shutdown path) arms a rendezvous before sending a
//! message that needs an acknowledgement, then waits on it. The dispatcher
//! signals it when the acknowledgement arrives; teardown fails it so nothing
//! waits on a dead peer.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Armed,
    Signaled,
    Failed,
}

/// Why a wait ended without an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    PeerFailed,
    NotArmed,
}

#[derive(Debug)]
pub struct Rendezvous {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            cond: Condvar::new(),
        }
    }

    /// Prepare for one acknowledgement. Returns false once failed, or if an
    /// acknowledgement is already outstanding.
    pub fn arm(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {
                *state = State::Armed;
                true
            }
            State::Armed | State::Signaled | State::Failed => false,
        }
    }

    /// Deliver an acknowledgement. Returns false if nobody was expecting one.
    pub fn signal(&self) -> bool {
        let mut state = self.state.lock();
        if *state != State::Armed {
            return false;
        }
        *state = State::Signaled;
        self.cond.notify_all();
        true
    }

    pub fn is_armed(&self) -> bool {
        *self.state.lock() == State::Armed
    }

    /// Wait up to `timeout` for the acknowledgement. The rendezvous is idle
    /// again afterwards unless it has failed.
    pub fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                State::Signaled => {
                    *state = State::Idle;
                    return Ok(());
                }
                State::Failed => return Err(WaitError::PeerFailed),
                State::Idle => return Err(WaitError::NotArmed),
                State::Armed => {}
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() && *state == State::Armed {
                *state = State::Idle;
                return Err(WaitError::TimedOut);
            }
        }
    }

    /// Permanently fail the rendezvous and wake any waiter.
    pub fn fail(&self) {
        *self.state.lock() = State::Failed;
        self.cond.notify_all();
    }
}
