//! Per-connection state machines.
//!
//! Three independent, monotonic axes track the handshake and teardown, and
//! a separate liveness cell guards the dispatcher against teardown.

use farswap_core::MessageTag;
use parking_lot::{Condvar, Mutex};

/// Server-side progress of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Established, nothing bound yet.
    Wait,
    /// At least one bind succeeded.
    Bind,
    /// Final acknowledgement sent.
    Done,
}

/// Last control message class the server sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendState {
    Init,
    MrSent,
    StopSent,
    DoneSent,
}

/// Teardown acknowledgements received from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecvState {
    Init,
    StoppedRecv,
    DoneRecv,
}

/// The three state axes of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStates {
    pub server: ServerState,
    pub send: SendState,
    pub recv: RecvState,
}

impl Default for ConnectionStates {
    fn default() -> Self {
        Self {
            server: ServerState::Wait,
            send: SendState::Init,
            recv: RecvState::Init,
        }
    }
}

fn advance<T: Ord + Copy>(current: &mut T, next: T) {
    if next > *current {
        *current = next;
    }
}

impl ConnectionStates {
    /// Whether the server may send a message with `tag` now.
    pub fn permits(&self, tag: MessageTag) -> bool {
        match tag {
            MessageTag::Info | MessageTag::InfoSingle | MessageTag::Evict | MessageTag::Stop => {
                self.send < SendState::StopSent
            }
            MessageTag::FreeSize => self.send < SendState::DoneSent,
            MessageTag::Done => self.send == SendState::StopSent,
            MessageTag::Activity | MessageTag::Bind | MessageTag::BindSingle | MessageTag::Query => {
                false
            }
        }
    }

    /// Record that a message with `tag` was sent.
    pub fn on_sent(&mut self, tag: MessageTag) {
        match tag {
            MessageTag::Info | MessageTag::InfoSingle => {
                advance(&mut self.send, SendState::MrSent);
                advance(&mut self.server, ServerState::Bind);
            }
            MessageTag::Stop => advance(&mut self.send, SendState::StopSent),
            MessageTag::Done => {
                advance(&mut self.send, SendState::DoneSent);
                advance(&mut self.server, ServerState::Done);
            }
            _ => {}
        }
    }

    /// Record a client acknowledgement during teardown.
    pub fn on_recv_ack(&mut self, next: RecvState) {
        advance(&mut self.recv, next);
    }

    /// Both sides have exchanged their final DONE.
    pub fn is_terminal(&self) -> bool {
        self.send == SendState::DoneSent && self.recv == RecvState::DoneRecv
    }
}

/// Queue-pair liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Idle,
    Busy,
    Down,
}

/// Liveness cell shared by the dispatcher and teardown.
///
/// The dispatcher enters `Busy` before touching a completion and leaves it
/// afterwards. Teardown moves the cell to `Down` and waits for any `Busy`
/// section to finish, so the endpoint is never destroyed under the
/// dispatcher.
#[derive(Debug)]
pub struct QpStateCell {
    state: Mutex<QpState>,
    idle: Condvar,
}

impl Default for QpStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl QpStateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QpState::Idle),
            idle: Condvar::new(),
        }
    }

    /// Idle -> Busy. Returns false if the queue pair is down.
    pub fn enter_busy(&self) -> bool {
        let mut state = self.state.lock();
        if *state == QpState::Down {
            return false;
        }
        *state = QpState::Busy;
        true
    }

    /// Busy -> Idle.
    pub fn leave_busy(&self) {
        let mut state = self.state.lock();
        if *state == QpState::Busy {
            *state = QpState::Idle;
        }
        self.idle.notify_all();
    }

    /// Move to Down once no completion is being processed. Returns false if
    /// the cell was already down.
    pub fn shut_down(&self) -> bool {
        let mut state = self.state.lock();
        while *state == QpState::Busy {
            self.idle.wait(&mut state);
        }
        let was_down = *state == QpState::Down;
        *state = QpState::Down;
        !was_down
    }

    pub fn is_down(&self) -> bool {
        *self.state.lock() == QpState::Down
    }

    pub fn get(&self) -> QpState {
        *self.state.lock()
    }
}
