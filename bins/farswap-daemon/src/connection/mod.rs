//! One client connection.
//!
//! A [`Connection`] owns the leases for every chunk its client has bound,
//! laid out in the client's own slot space, and runs the protocol handlers
//! the dispatcher invokes for each inbound frame. Eviction and the STOP
//! handshake are driven from other threads through acknowledgement
//! rendezvous.

mod state;

pub use state::{ConnectionStates, QpState, QpStateCell, RecvState, SendState, ServerState};

use crate::error::DaemonError;
use crate::rendezvous::{Rendezvous, WaitError};
use crate::stats::DaemonStats;
use crate::transport::{Completion, Endpoint, EndpointId};
use farswap_core::{
    ActivityReport, ChunkDescriptor, ChunkId, ChunkLease, ChunkPool, Message, MessageTag, OwnerId,
    WireCodec,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Leases indexed by the client's slot.
#[derive(Debug)]
struct ChunkMap {
    slots: Vec<Option<ChunkLease>>,
}

impl ChunkMap {
    fn new(max_entries: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(max_entries).collect(),
        }
    }

    /// Lowest `n` unused slots, if there are that many.
    fn free_slots(&self, n: usize) -> Option<Vec<usize>> {
        let free: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .take(n)
            .collect();
        (free.len() == n).then_some(free)
    }

    fn get(&self, slot: usize) -> Option<&ChunkLease> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn slot_of(&self, chunk: ChunkId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|l| l.chunk() == chunk))
    }

    /// Take the lease in `slot` if it still holds `chunk`.
    fn take_if(&mut self, slot: usize, chunk: ChunkId) -> Option<ChunkLease> {
        let entry = self.slots.get_mut(slot)?;
        if entry.as_ref().is_some_and(|l| l.chunk() == chunk) {
            entry.take()
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<ChunkLease> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// EVICT sent to one connection, awaiting acknowledgement.
#[derive(Debug, Default)]
#[must_use]
pub struct EvictTicket {
    entries: Vec<(usize, ChunkId)>,
}

impl EvictTicket {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.entries.iter().map(|&(_, chunk)| chunk)
    }
}

pub struct Connection {
    owner: OwnerId,
    endpoint: Arc<dyn Endpoint>,
    codec: WireCodec,
    pool: Arc<ChunkPool>,
    chunks: Mutex<ChunkMap>,
    states: Mutex<ConnectionStates>,
    qp: QpStateCell,
    evict_ack: Rendezvous,
    stop_ack: Rendezvous,
    rearm_on_send: AtomicBool,
    stats: Arc<DaemonStats>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("owner", &self.owner)
            .field("endpoint", &self.endpoint.id())
            .field("states", &*self.states.lock())
            .field("qp", &self.qp.get())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        owner: OwnerId,
        endpoint: Arc<dyn Endpoint>,
        codec: WireCodec,
        pool: Arc<ChunkPool>,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            owner,
            endpoint,
            chunks: Mutex::new(ChunkMap::new(codec.max_entries())),
            codec,
            pool,
            states: Mutex::new(ConnectionStates::default()),
            qp: QpStateCell::new(),
            evict_ack: Rendezvous::new(),
            stop_ack: Rendezvous::new(),
            rearm_on_send: AtomicBool::new(false),
            stats,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn states(&self) -> ConnectionStates {
        *self.states.lock()
    }

    pub fn qp(&self) -> &QpStateCell {
        &self.qp
    }

    /// Chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// (slot, chunk) for every held chunk, by slot.
    pub fn chunk_slots(&self) -> Vec<(usize, ChunkId)> {
        self.chunks
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, l)| l.as_ref().map(|l| (slot, l.chunk())))
            .collect()
    }

    /// Encode and post `msg`, enforcing the send-state ordering.
    pub fn send(&self, msg: &Message) -> Result<(), DaemonError> {
        let tag = msg.tag();
        let frame = self.codec.encode(msg)?;
        let mut states = self.states.lock();
        if !states.permits(tag) {
            return Err(DaemonError::SendOutOfOrder {
                tag,
                state: states.send,
            });
        }
        self.endpoint.post_send(frame)?;
        states.on_sent(tag);
        Ok(())
    }

    /// Send a reply to an inbound frame; the receive is re-armed when the
    /// reply's send completes.
    fn reply(&self, msg: &Message) -> Result<(), DaemonError> {
        self.rearm_on_send.store(true, Ordering::Release);
        let sent = self.send(msg);
        if sent.is_err() {
            self.rearm_on_send.store(false, Ordering::Release);
        }
        sent
    }

    fn rearm(&self) {
        if let Err(e) = self.endpoint.post_recv() {
            debug!(owner = %self.owner, error = %e, "could not re-arm receive");
        }
    }

    /// Arm the first receive and advertise the free-chunk count.
    pub fn greet(&self) -> Result<(), DaemonError> {
        self.endpoint.post_recv()?;
        self.send(&Message::FreeSize {
            free_chunks: self.free_chunks(),
        })
    }

    fn free_chunks(&self) -> u32 {
        u32::try_from(self.pool.free_count()).unwrap_or(u32::MAX)
    }

    /// Process one transport completion.
    pub fn handle_completion(&self, completion: Completion) {
        match completion {
            Completion::Send => {
                if self.rearm_on_send.swap(false, Ordering::AcqRel) {
                    self.rearm();
                }
            }
            Completion::Recv(frame) => {
                if !self.handle_frame(&frame) {
                    self.rearm();
                }
            }
        }
    }

    /// Returns true if a reply was posted (re-arm happens on its completion).
    fn handle_frame(&self, frame: &[u8]) -> bool {
        let msg = match self.codec.decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(owner = %self.owner, error = %e, "dropping malformed frame");
                return false;
            }
        };
        match msg {
            Message::Bind { chunks } => self.handle_bind(chunks as usize, false),
            Message::BindSingle => self.handle_bind(1, true),
            Message::Query => self.reply_free_size(),
            Message::Activity { reports } => {
                self.handle_activity(&reports);
                false
            }
            Message::Done => self.handle_done(),
            other => {
                warn!(owner = %self.owner, tag = ?other.tag(), "unexpected message from client");
                false
            }
        }
    }

    fn reply_free_size(&self) -> bool {
        let msg = Message::FreeSize {
            free_chunks: self.free_chunks(),
        };
        match self.reply(&msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(owner = %self.owner, error = %e, "FREE_SIZE not sent");
                false
            }
        }
    }

    fn handle_bind(&self, n: usize, single: bool) -> bool {
        if n == 0 {
            self.stats.record_bind_reject();
            return self.reply_free_size();
        }

        let mut map = self.chunks.lock();
        if !self.states.lock().permits(MessageTag::Info) {
            warn!(owner = %self.owner, chunks = n, "bind refused after STOP");
            self.stats.record_bind_reject();
            return false;
        }
        let Some(slots) = map.free_slots(n) else {
            debug!(owner = %self.owner, chunks = n, held = map.len(), "bind exceeds connection slots");
            self.stats.record_bind_reject();
            return self.reply_free_size();
        };
        let leases = match self.pool.bind(self.owner, n) {
            Ok(leases) => leases,
            Err(e) => {
                info!(owner = %self.owner, error = %e, "bind rejected");
                self.stats.record_bind_reject();
                return self.reply_free_size();
            }
        };

        let descriptors: Vec<ChunkDescriptor> = slots
            .iter()
            .zip(&leases)
            .map(|(&slot, lease)| ChunkDescriptor {
                slot,
                addr: lease.registration().addr,
                rkey: lease.registration().rkey,
            })
            .collect();
        let bound: Vec<(usize, ChunkId)> = slots.iter().copied().zip(leases.iter().map(ChunkLease::chunk)).collect();
        for (slot, lease) in slots.into_iter().zip(leases) {
            map.slots[slot] = Some(lease);
        }

        let msg = match descriptors.as_slice() {
            [chunk] if single => Message::InfoSingle { chunk: *chunk },
            _ => Message::Info {
                chunks: descriptors,
            },
        };
        match self.reply(&msg) {
            Ok(()) => {
                self.stats.record_bind(n);
                info!(owner = %self.owner, chunks = n, free = self.pool.free_count(), "bound chunks");
                true
            }
            Err(e) => {
                warn!(owner = %self.owner, error = %e, "INFO not sent, returning chunks");
                let leases = bound
                    .into_iter()
                    .filter_map(|(slot, chunk)| map.take_if(slot, chunk))
                    .collect();
                if let Err(e) = self.pool.release(self.owner, leases) {
                    error!(owner = %self.owner, error = %e, "rollback failed");
                }
                false
            }
        }
    }

    fn handle_activity(&self, reports: &[ActivityReport]) {
        let map = self.chunks.lock();
        for report in reports {
            match map.get(report.slot) {
                Some(lease) if lease.registration().rkey == report.rkey => {
                    if let Err(e) = self.pool.record_activity(lease, report.accesses) {
                        warn!(owner = %self.owner, error = %e, "activity not recorded");
                    }
                }
                _ => debug!(owner = %self.owner, slot = report.slot, "activity for unknown slot"),
            }
        }
    }

    fn handle_done(&self) -> bool {
        if self.evict_ack.signal() {
            debug!(owner = %self.owner, "eviction acknowledged");
            return false;
        }

        let (send, recv) = {
            let states = self.states.lock();
            (states.send, states.recv)
        };
        match (send, recv) {
            (SendState::StopSent, RecvState::Init) => {
                self.states.lock().on_recv_ack(RecvState::StoppedRecv);
                let released = self.release_all_leases();
                debug!(owner = %self.owner, released, "client stopped");
                match self.reply(&Message::Done) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(owner = %self.owner, error = %e, "final DONE not sent");
                        false
                    }
                }
            }
            (SendState::DoneSent, RecvState::StoppedRecv) => {
                self.states.lock().on_recv_ack(RecvState::DoneRecv);
                info!(owner = %self.owner, "teardown handshake complete");
                self.stop_ack.signal();
                self.endpoint.disconnect();
                false
            }
            _ => {
                warn!(owner = %self.owner, ?send, ?recv, "unexpected DONE");
                false
            }
        }
    }

    fn release_all_leases(&self) -> usize {
        let leases = self.chunks.lock().drain();
        match self.pool.release(self.owner, leases) {
            Ok(n) => n,
            Err(e) => {
                error!(owner = %self.owner, error = %e, "lease release rejected, forcing");
                self.pool.release_all(self.owner)
            }
        }
    }

    /// Send EVICT for those of `chunks` this connection still holds.
    ///
    /// The acknowledgement rendezvous is armed before the message is posted.
    pub fn send_evict(&self, chunks: &[ChunkId]) -> Result<EvictTicket, DaemonError> {
        let map = self.chunks.lock();
        let mut ticket = EvictTicket::default();
        let mut descriptors = Vec::new();
        for &chunk in chunks {
            let Some(slot) = map.slot_of(chunk) else {
                continue;
            };
            if let Some(lease) = map.get(slot) {
                descriptors.push(ChunkDescriptor {
                    slot,
                    addr: lease.registration().addr,
                    rkey: lease.registration().rkey,
                });
                ticket.entries.push((slot, chunk));
            }
        }
        if ticket.is_empty() {
            return Ok(ticket);
        }
        if !self.evict_ack.arm() {
            return Err(DaemonError::PeerFailed(self.owner));
        }
        self.send(&Message::Evict {
            chunks: descriptors,
        })?;
        debug!(owner = %self.owner, chunks = ticket.len(), "EVICT sent");
        Ok(ticket)
    }

    /// Wait for the acknowledgement of `ticket` and return its chunks to the
    /// pool. Returns the number released.
    pub fn finish_evict(&self, ticket: EvictTicket, timeout: Duration) -> Result<usize, DaemonError> {
        if ticket.is_empty() {
            return Ok(0);
        }
        match self.evict_ack.wait(timeout) {
            Ok(()) => {}
            Err(WaitError::TimedOut) => {
                return Err(DaemonError::AckTimeout {
                    owner: self.owner,
                    timeout,
                })
            }
            Err(WaitError::PeerFailed | WaitError::NotArmed) => {
                return Err(DaemonError::PeerFailed(self.owner))
            }
        }
        let mut map = self.chunks.lock();
        let leases = ticket
            .entries
            .into_iter()
            .filter_map(|(slot, chunk)| map.take_if(slot, chunk))
            .collect();
        Ok(self.pool.release(self.owner, leases)?)
    }

    /// Run the STOP handshake and wait up to `timeout` for it to complete.
    pub fn stop(&self, timeout: Duration) -> Result<(), DaemonError> {
        self.send_stop()?;
        self.finish_stop(timeout)
    }

    /// Arm the teardown acknowledgement and send STOP.
    pub fn send_stop(&self) -> Result<(), DaemonError> {
        if !self.stop_ack.arm() {
            return Err(DaemonError::PeerFailed(self.owner));
        }
        self.send(&Message::Stop)
    }

    /// Wait up to `timeout` for the client's final DONE.
    pub fn finish_stop(&self, timeout: Duration) -> Result<(), DaemonError> {
        match self.stop_ack.wait(timeout) {
            Ok(()) => Ok(()),
            Err(WaitError::TimedOut) => Err(DaemonError::AckTimeout {
                owner: self.owner,
                timeout,
            }),
            Err(_) => Err(DaemonError::PeerFailed(self.owner)),
        }
    }

    /// Take the connection down: stop the dispatcher, fail pending waits,
    /// return every chunk and close the endpoint. Returns the number of
    /// chunks released; zero on repeated calls.
    pub fn teardown(&self) -> usize {
        if !self.qp.shut_down() {
            return 0;
        }
        self.evict_ack.fail();
        self.stop_ack.fail();
        let released = self.release_all_leases();
        self.endpoint.disconnect();
        info!(owner = %self.owner, released, "connection torn down");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackClient, LoopbackListener};
    use crate::transport::{Listener, TransportEvent};
    use farswap_core::{LocalRegistrar, RemoteKey};
    use std::thread;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        conn: Arc<Connection>,
        client: LoopbackClient,
        pool: Arc<ChunkPool>,
        _listener: LoopbackListener,
    }

    fn fixture(pool_chunks: usize, max_entries: usize) -> Fixture {
        let codec = WireCodec::new(max_entries).unwrap();
        let (mut listener, connector) = LoopbackListener::new(codec);
        let client = connector.connect();
        let endpoint = match listener.next_event(WAIT).unwrap() {
            Some(TransportEvent::ConnectRequest(ep)) => ep,
            other => panic!("expected connect request, got {other:?}"),
        };
        endpoint.accept().unwrap();
        let pool = Arc::new(
            ChunkPool::with_capacity(pool_chunks, pool_chunks, 4096, Arc::new(LocalRegistrar::new()))
                .unwrap(),
        );
        let conn = Arc::new(Connection::new(
            OwnerId::new(0, 1),
            endpoint,
            codec,
            Arc::clone(&pool),
            Arc::new(DaemonStats::new()),
        ));
        conn.greet().unwrap();
        assert_eq!(
            client.recv(WAIT),
            Some(Message::FreeSize {
                free_chunks: pool_chunks as u32
            })
        );
        Fixture {
            conn,
            client,
            pool,
            _listener: listener,
        }
    }

    /// Process completions until the endpoint stays quiet.
    fn pump(conn: &Connection) {
        while let Ok(Some(c)) = conn.endpoint().wait_completion(Duration::from_millis(30)) {
            conn.handle_completion(c);
        }
    }

    fn request(f: &Fixture, msg: &Message) -> Option<Message> {
        f.client.send(msg).unwrap();
        pump(&f.conn);
        f.client.recv(Duration::from_millis(200))
    }

    #[test]
    fn test_bind_replies_with_info() {
        let f = fixture(8, 4);
        let Some(Message::Info { chunks }) = request(&f, &Message::Bind { chunks: 3 }) else {
            panic!("expected INFO");
        };
        let slots: Vec<usize> = chunks.iter().map(|c| c.slot).collect();
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(f.pool.mapped_count(), 3);
        assert_eq!(f.conn.chunk_count(), 3);
        assert_eq!(f.conn.states().server, ServerState::Bind);
        assert_eq!(f.conn.states().send, SendState::MrSent);
    }

    #[test]
    fn test_consecutive_requests_rearm_receive() {
        let f = fixture(8, 4);
        assert!(matches!(request(&f, &Message::Bind { chunks: 1 }), Some(Message::Info { .. })));
        assert_eq!(request(&f, &Message::Query), Some(Message::FreeSize { free_chunks: 7 }));
        assert!(matches!(request(&f, &Message::BindSingle), Some(Message::InfoSingle { chunk }) if chunk.slot == 1));
    }

    #[test]
    fn test_bind_exhausted_replies_free_size() {
        let f = fixture(4, 8);
        assert_eq!(
            request(&f, &Message::Bind { chunks: 5 }),
            Some(Message::FreeSize { free_chunks: 4 })
        );
        assert_eq!(f.pool.mapped_count(), 0);
        assert_eq!(f.conn.states().server, ServerState::Wait);
    }

    #[test]
    fn test_bind_beyond_connection_slots_rejected() {
        let f = fixture(8, 2);
        assert_eq!(
            request(&f, &Message::Bind { chunks: 3 }),
            Some(Message::FreeSize { free_chunks: 8 })
        );
        assert_eq!(f.pool.mapped_count(), 0);
    }

    #[test]
    fn test_bind_zero_replies_free_size() {
        let f = fixture(4, 4);
        assert_eq!(
            request(&f, &Message::Bind { chunks: 0 }),
            Some(Message::FreeSize { free_chunks: 4 })
        );
    }

    #[test]
    fn test_activity_updates_matching_chunks() {
        let f = fixture(8, 4);
        let Some(Message::Info { chunks }) = request(&f, &Message::Bind { chunks: 2 }) else {
            panic!("expected INFO");
        };
        let reports = vec![
            ActivityReport {
                slot: 0,
                rkey: chunks[0].rkey,
                accesses: 42,
            },
            ActivityReport {
                slot: 1,
                rkey: RemoteKey::new(999).unwrap(),
                accesses: 7,
            },
        ];
        assert_eq!(request(&f, &Message::Activity { reports }), None);
        let snap = f.pool.snapshot();
        assert_eq!(snap[0].activity, 42);
        assert_eq!(snap[1].activity, 0);
        // Receive is re-armed after a message with no reply.
        assert_eq!(request(&f, &Message::Query), Some(Message::FreeSize { free_chunks: 6 }));
    }

    #[test]
    fn test_evict_after_ack_releases() {
        let f = fixture(8, 4);
        assert!(matches!(request(&f, &Message::Bind { chunks: 3 }), Some(Message::Info { .. })));
        let victim = f.conn.chunk_slots()[1].1;

        let ticket = f.conn.send_evict(&[victim]).unwrap();
        assert_eq!(ticket.len(), 1);
        let Some(Message::Evict { chunks }) = f.client.recv(WAIT) else {
            panic!("expected EVICT");
        };
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].slot, 1);

        f.client.send(&Message::Done).unwrap();
        pump(&f.conn);
        assert_eq!(f.conn.finish_evict(ticket, WAIT).unwrap(), 1);
        assert_eq!(f.pool.mapped_count(), 2);
        assert_eq!(f.conn.chunk_slots().iter().map(|s| s.0).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_evict_without_ack_times_out() {
        let f = fixture(8, 4);
        assert!(matches!(request(&f, &Message::Bind { chunks: 2 }), Some(Message::Info { .. })));
        let victim = f.conn.chunk_slots()[0].1;
        let ticket = f.conn.send_evict(&[victim]).unwrap();
        let err = f.conn.finish_evict(ticket, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, DaemonError::AckTimeout { .. }));
        assert_eq!(f.pool.mapped_count(), 2);
    }

    #[test]
    fn test_evict_of_unheld_chunk_is_empty() {
        let f = fixture(8, 4);
        let ticket = f.conn.send_evict(&[ChunkId::new(5)]).unwrap();
        assert!(ticket.is_empty());
        assert_eq!(f.conn.finish_evict(ticket, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_bind_after_stop_refused() {
        let f = fixture(8, 4);
        f.conn.send(&Message::Stop).unwrap();
        assert_eq!(f.client.recv(WAIT), Some(Message::Stop));
        assert_eq!(request(&f, &Message::Bind { chunks: 1 }), None);
        assert_eq!(f.pool.mapped_count(), 0);
        assert!(matches!(
            f.conn.send(&Message::Info { chunks: vec![] }),
            Err(DaemonError::SendOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_stop_handshake() {
        let f = fixture(8, 4);
        assert!(matches!(request(&f, &Message::Bind { chunks: 2 }), Some(Message::Info { .. })));

        let dispatcher = {
            let conn = Arc::clone(&f.conn);
            thread::spawn(move || crate::dispatcher::run(&conn, Duration::from_millis(10)))
        };
        let client = thread::spawn(move || {
            assert_eq!(f.client.recv(WAIT), Some(Message::Stop));
            f.client.send(&Message::Done).unwrap();
            assert_eq!(f.client.recv(WAIT), Some(Message::Done));
            f.client.send(&Message::Done).unwrap();
            assert!(f.client.wait_closed(WAIT));
        });

        f.conn.stop(WAIT).unwrap();
        client.join().unwrap();
        let states = f.conn.states();
        assert!(states.is_terminal());
        assert_eq!(states.server, ServerState::Done);
        assert_eq!(f.pool.mapped_count(), 0);

        f.conn.teardown();
        dispatcher.join().unwrap();
    }

    #[test]
    fn test_teardown_releases_and_fails_waiters() {
        let f = fixture(8, 4);
        assert!(matches!(request(&f, &Message::Bind { chunks: 3 }), Some(Message::Info { .. })));
        let victim = f.conn.chunk_slots()[0].1;
        let ticket = f.conn.send_evict(&[victim]).unwrap();

        assert_eq!(f.conn.teardown(), 3);
        assert_eq!(f.pool.mapped_count(), 0);
        assert!(f.conn.qp().is_down());
        assert!(matches!(
            f.conn.finish_evict(ticket, WAIT),
            Err(DaemonError::PeerFailed(_))
        ));
        assert_eq!(f.conn.teardown(), 0);
        assert!(f.client.wait_closed(WAIT));
    }
}
