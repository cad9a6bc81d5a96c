//! In-process transport.
//!
//! A [`LoopbackListener`] hands out endpoints whose peer is a
//! [`LoopbackClient`] in the same process. Frames are moved between two
//! queues; receives are credit-gated exactly like a posted-receive
//! transport, so the daemon's dispatch logic runs unmodified against it.

use super::{Completion, Endpoint, EndpointId, EventQueue, Listener, TransportEvent};
use farswap_core::{LocalRegistrar, Message, Registrar, WireCodec};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Requested,
    Established,
    Rejected,
    Closed,
}

#[derive(Debug)]
struct PipeState {
    phase: Phase,
    to_server: VecDeque<Vec<u8>>,
    to_client: VecDeque<Vec<u8>>,
    completions: VecDeque<Completion>,
    credits: usize,
    disconnect_reported: bool,
}

#[derive(Debug)]
struct Pipe {
    id: EndpointId,
    state: Mutex<PipeState>,
    changed: Condvar,
    events: Arc<EventQueue>,
}

impl Pipe {
    fn close(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Closed;
        let report = !std::mem::replace(&mut state.disconnect_reported, true);
        drop(state);
        self.changed.notify_all();
        if report {
            self.events.push(TransportEvent::Disconnected(self.id));
        }
    }
}

/// Server half of a loopback connection.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    pipe: Arc<Pipe>,
    frame_len: usize,
}

impl Endpoint for LoopbackEndpoint {
    fn id(&self) -> EndpointId {
        self.pipe.id
    }

    fn accept(&self) -> io::Result<()> {
        let mut state = self.pipe.state.lock();
        if state.phase != Phase::Requested {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connect request withdrawn",
            ));
        }
        state.phase = Phase::Established;
        drop(state);
        self.pipe.changed.notify_all();
        self.pipe.events.push(TransportEvent::Established(self.pipe.id));
        Ok(())
    }

    fn reject(&self) {
        let mut state = self.pipe.state.lock();
        if state.phase == Phase::Requested {
            state.phase = Phase::Rejected;
        }
        drop(state);
        self.pipe.changed.notify_all();
    }

    fn post_recv(&self) -> io::Result<()> {
        let mut state = self.pipe.state.lock();
        if state.phase == Phase::Closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        state.credits += 1;
        drop(state);
        self.pipe.changed.notify_all();
        Ok(())
    }

    fn post_send(&self, frame: Vec<u8>) -> io::Result<()> {
        if frame.len() != self.frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame is {} bytes, expected {}", frame.len(), self.frame_len),
            ));
        }
        let mut state = self.pipe.state.lock();
        if state.phase != Phase::Established {
            return Err(io::ErrorKind::NotConnected.into());
        }
        state.to_client.push_back(frame);
        state.completions.push_back(Completion::Send);
        drop(state);
        self.pipe.changed.notify_all();
        Ok(())
    }

    fn wait_completion(&self, timeout: Duration) -> io::Result<Option<Completion>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.state.lock();
        loop {
            if let Some(done) = state.completions.pop_front() {
                return Ok(Some(done));
            }
            if state.credits > 0 {
                if let Some(frame) = state.to_server.pop_front() {
                    state.credits -= 1;
                    return Ok(Some(Completion::Recv(frame)));
                }
            }
            if state.phase == Phase::Closed {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }
            if self.pipe.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn disconnect(&self) {
        self.pipe.close();
    }
}

/// Client half of a loopback connection.
#[derive(Debug)]
pub struct LoopbackClient {
    pipe: Arc<Pipe>,
    codec: WireCodec,
}

impl LoopbackClient {
    pub fn id(&self) -> EndpointId {
        self.pipe.id
    }

    /// Wait until the server accepts or rejects. Returns true once accepted.
    pub fn wait_established(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.state.lock();
        while state.phase == Phase::Requested {
            if self.pipe.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.phase == Phase::Established
    }

    pub fn is_rejected(&self) -> bool {
        self.pipe.state.lock().phase == Phase::Rejected
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.state.lock().phase == Phase::Closed
    }

    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed or the message does not encode.
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let frame = self
            .codec
            .encode(msg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.send_frame(frame)
    }

    /// Send a raw frame to the server.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed.
    pub fn send_frame(&self, frame: Vec<u8>) -> io::Result<()> {
        let mut state = self.pipe.state.lock();
        if state.phase == Phase::Closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        state.to_server.push_back(frame);
        drop(state);
        self.pipe.changed.notify_all();
        Ok(())
    }

    /// Wait up to `timeout` for the next frame from the server and decode it.
    ///
    /// Returns `None` on timeout, or once the connection is closed and
    /// drained.
    pub fn recv(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.state.lock();
        loop {
            if let Some(frame) = state.to_client.pop_front() {
                drop(state);
                return self.codec.decode(&frame).ok();
            }
            if state.phase == Phase::Closed {
                return None;
            }
            if self.pipe.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Wait until the server closes the connection.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.pipe.state.lock();
        while state.phase != Phase::Closed {
            if self.pipe.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.phase == Phase::Closed
    }

    /// Drop the connection from the client side.
    pub fn disconnect(&self) {
        self.pipe.close();
    }
}

/// Creates loopback connections against one [`LoopbackListener`].
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    events: Arc<EventQueue>,
    next_id: Arc<AtomicU64>,
    codec: WireCodec,
}

impl LoopbackConnector {
    /// Issue a connect request. The server sees `ConnectRequest`.
    pub fn connect(&self) -> LoopbackClient {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pipe = Arc::new(Pipe {
            id,
            state: Mutex::new(PipeState {
                phase: Phase::Requested,
                to_server: VecDeque::new(),
                to_client: VecDeque::new(),
                completions: VecDeque::new(),
                credits: 0,
                disconnect_reported: false,
            }),
            changed: Condvar::new(),
            events: Arc::clone(&self.events),
        });
        let endpoint = Arc::new(LoopbackEndpoint {
            pipe: Arc::clone(&pipe),
            frame_len: self.codec.frame_len(),
        });
        self.events.push(TransportEvent::ConnectRequest(endpoint));
        LoopbackClient {
            pipe,
            codec: self.codec,
        }
    }
}

/// Listener side of the loopback transport.
#[derive(Debug)]
pub struct LoopbackListener {
    events: Arc<EventQueue>,
    registrar: Arc<LocalRegistrar>,
}

impl LoopbackListener {
    /// Create a listener and the connector clients use to reach it.
    pub fn new(codec: WireCodec) -> (Self, LoopbackConnector) {
        let events = Arc::new(EventQueue::new());
        let connector = LoopbackConnector {
            events: Arc::clone(&events),
            next_id: Arc::new(AtomicU64::new(1)),
            codec,
        };
        (
            Self {
                events,
                registrar: Arc::new(LocalRegistrar::new()),
            },
            connector,
        )
    }
}

impl Listener for LoopbackListener {
    fn next_event(&mut self, timeout: Duration) -> io::Result<Option<TransportEvent>> {
        Ok(self.events.pop(timeout))
    }

    fn registrar(&self) -> Arc<dyn Registrar> {
        self.registrar.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (LoopbackListener, LoopbackClient, Arc<dyn Endpoint>) {
        let codec = WireCodec::new(4).unwrap();
        let (mut listener, connector) = LoopbackListener::new(codec);
        let client = connector.connect();
        let endpoint = match listener.next_event(WAIT).unwrap() {
            Some(TransportEvent::ConnectRequest(ep)) => ep,
            other => panic!("expected connect request, got {other:?}"),
        };
        (listener, client, endpoint)
    }

    #[test]
    fn test_accept_emits_established() {
        let (mut listener, client, endpoint) = setup();
        endpoint.accept().unwrap();
        assert!(client.wait_established(WAIT));
        assert!(matches!(
            listener.next_event(WAIT).unwrap(),
            Some(TransportEvent::Established(id)) if id == endpoint.id()
        ));
    }

    #[test]
    fn test_reject() {
        let (_listener, client, endpoint) = setup();
        endpoint.reject();
        assert!(!client.wait_established(WAIT));
        assert!(client.is_rejected());
        assert!(endpoint.accept().is_err());
    }

    #[test]
    fn test_receives_wait_for_credit() {
        let (_listener, client, endpoint) = setup();
        endpoint.accept().unwrap();
        client.send(&Message::Query).unwrap();
        assert_eq!(endpoint.wait_completion(Duration::from_millis(10)).unwrap(), None);

        endpoint.post_recv().unwrap();
        match endpoint.wait_completion(WAIT).unwrap() {
            Some(Completion::Recv(frame)) => assert_eq!(frame.len(), 8 + 4 * 12),
            other => panic!("expected recv, got {other:?}"),
        }
    }

    #[test]
    fn test_send_reaches_client_with_completion() {
        let (_listener, client, endpoint) = setup();
        endpoint.accept().unwrap();
        let codec = WireCodec::new(4).unwrap();
        let frame = codec.encode(&Message::FreeSize { free_chunks: 9 }).unwrap();
        endpoint.post_send(frame).unwrap();
        assert_eq!(endpoint.wait_completion(WAIT).unwrap(), Some(Completion::Send));
        assert_eq!(client.recv(WAIT), Some(Message::FreeSize { free_chunks: 9 }));
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let (_listener, _client, endpoint) = setup();
        endpoint.accept().unwrap();
        assert!(endpoint.post_send(vec![0; 3]).is_err());
    }

    #[test]
    fn test_client_disconnect_reports_once() {
        let (mut listener, client, endpoint) = setup();
        endpoint.accept().unwrap();
        let _ = listener.next_event(WAIT).unwrap();

        client.disconnect();
        endpoint.disconnect();
        assert!(matches!(
            listener.next_event(WAIT).unwrap(),
            Some(TransportEvent::Disconnected(_))
        ));
        assert!(listener.next_event(Duration::from_millis(10)).unwrap().is_none());
        assert!(endpoint.wait_completion(WAIT).is_err());
    }

    #[test]
    fn test_queued_frames_drain_before_close_error() {
        let (_listener, client, endpoint) = setup();
        endpoint.accept().unwrap();
        endpoint.post_recv().unwrap();
        client.send(&Message::Done).unwrap();
        client.disconnect();
        assert!(matches!(
            endpoint.wait_completion(WAIT).unwrap(),
            Some(Completion::Recv(_))
        ));
        assert!(endpoint.wait_completion(WAIT).is_err());
    }
}
