//! TCP transport.
//!
//! Carries control frames over a stream socket. Chunk memory is registered
//! with a [`LocalRegistrar`]; one-sided data access is out of this
//! transport's reach, so it suits deployments that only exercise the control
//! plane and for local testing against real sockets.

use super::{Completion, Endpoint, EndpointId, EventQueue, Listener, TransportEvent};
use farswap_core::{LocalRegistrar, Registrar};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Listening socket plus the events its endpoints raise.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
    events: Arc<EventQueue>,
    registrar: Arc<LocalRegistrar>,
    next_id: EndpointId,
    frame_len: usize,
}

impl TcpTransport {
    /// Bind and listen on `addr`.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub fn bind(addr: SocketAddr, frame_len: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            events: Arc::new(EventQueue::new()),
            registrar: Arc::new(LocalRegistrar::new()),
            next_id: 1,
            frame_len,
        })
    }

    /// Address actually bound (resolves port 0).
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn try_accept(&mut self) -> io::Result<Option<TransportEvent>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                let id = self.next_id;
                self.next_id += 1;
                debug!(endpoint = id, %peer, "incoming connection");
                let endpoint = TcpEndpoint::new(id, stream, self.frame_len, Arc::clone(&self.events))?;
                Ok(Some(TransportEvent::ConnectRequest(Arc::new(endpoint))))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Listener for TcpTransport {
    fn next_event(&mut self, timeout: Duration) -> io::Result<Option<TransportEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.events.pop(Duration::ZERO) {
                return Ok(Some(event));
            }
            if let Some(event) = self.try_accept()? {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if let Some(event) = self.events.pop(ACCEPT_POLL.min(deadline - now)) {
                return Ok(Some(event));
            }
        }
    }

    fn registrar(&self) -> Arc<dyn Registrar> {
        self.registrar.clone()
    }
}

#[derive(Debug)]
struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
    filled: usize,
}

/// One accepted TCP connection.
#[derive(Debug)]
pub struct TcpEndpoint {
    id: EndpointId,
    reader: Mutex<FrameReader>,
    writer: Mutex<TcpStream>,
    completions: Mutex<VecDeque<Completion>>,
    credits: AtomicUsize,
    closed: AtomicBool,
    reported: AtomicBool,
    events: Arc<EventQueue>,
    frame_len: usize,
}

impl TcpEndpoint {
    fn new(
        id: EndpointId,
        stream: TcpStream,
        frame_len: usize,
        events: Arc<EventQueue>,
    ) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Self {
            id,
            reader: Mutex::new(FrameReader {
                stream,
                buf: vec![0; frame_len],
                filled: 0,
            }),
            writer: Mutex::new(writer),
            completions: Mutex::new(VecDeque::new()),
            credits: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reported: AtomicBool::new(false),
            events,
            frame_len,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        if !self.reported.swap(true, Ordering::AcqRel) {
            self.events.push(TransportEvent::Disconnected(self.id));
        }
    }

    fn read_frame(&self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            reader
                .stream
                .set_read_timeout(Some(remaining.max(MIN_READ_TIMEOUT)))?;
            let FrameReader {
                stream,
                buf,
                filled,
            } = &mut *reader;
            let read = stream.read(&mut buf[*filled..]);
            match read {
                Ok(0) => {
                    drop(reader);
                    self.close();
                    return Err(io::ErrorKind::ConnectionAborted.into());
                }
                Ok(n) => {
                    reader.filled += n;
                    if reader.filled == self.frame_len {
                        reader.filled = 0;
                        return Ok(Some(reader.buf.clone()));
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    drop(reader);
                    self.close();
                    return Err(e);
                }
            }
        }
    }
}

impl Endpoint for TcpEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn accept(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.events.push(TransportEvent::Established(self.id));
        Ok(())
    }

    fn reject(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        self.reported.store(true, Ordering::Release);
    }

    fn post_recv(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.credits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn post_send(&self, frame: Vec<u8>) -> io::Result<()> {
        if frame.len() != self.frame_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame is {} bytes, expected {}", frame.len(), self.frame_len),
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let written = self.writer.lock().write_all(&frame);
        if let Err(e) = written {
            self.close();
            return Err(e);
        }
        self.completions.lock().push_back(Completion::Send);
        Ok(())
    }

    fn wait_completion(&self, timeout: Duration) -> io::Result<Option<Completion>> {
        if let Some(done) = self.completions.lock().pop_front() {
            return Ok(Some(done));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        if self.credits.load(Ordering::Acquire) == 0 {
            std::thread::sleep(timeout.min(ACCEPT_POLL));
            return Ok(None);
        }
        match self.read_frame(Instant::now() + timeout)? {
            Some(frame) => {
                self.credits.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(Completion::Recv(frame)))
            }
            None => Ok(None),
        }
    }

    fn disconnect(&self) {
        self.close();
    }
}
