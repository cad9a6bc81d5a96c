//! Per-connection completion dispatcher.

use crate::connection::Connection;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Run the dispatcher for `conn` on its own thread.
///
/// # Errors
///
/// Fails if the thread cannot be spawned.
pub fn spawn(conn: Arc<Connection>, poll: Duration) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("farswap-{}", conn.owner()))
        .spawn(move || run(&conn, poll))
}

/// Wait for completions and hand them to the connection until the queue
/// pair goes down or the endpoint fails.
///
/// The wait itself happens outside the busy section; a completion is only
/// processed after the dispatcher has claimed the queue pair, so teardown
/// never races a handler.
pub fn run(conn: &Connection, poll: Duration) {
    let owner = conn.owner();
    debug!(%owner, "dispatcher started");
    loop {
        if conn.qp().is_down() {
            break;
        }
        let completion = match conn.endpoint().wait_completion(poll) {
            Ok(Some(completion)) => completion,
            Ok(None) => continue,
            Err(e) => {
                debug!(%owner, error = %e, "endpoint closed");
                break;
            }
        };
        if !conn.qp().enter_busy() {
            trace!(%owner, "dropping completion after teardown");
            break;
        }
        conn.handle_completion(completion);
        conn.qp().leave_busy();
    }
    debug!(%owner, "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::DaemonStats;
    use crate::transport::loopback::LoopbackListener;
    use crate::transport::{Listener, TransportEvent};
    use farswap_core::{ChunkPool, LocalRegistrar, Message, OwnerId, WireCodec};

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_dispatcher_serves_until_teardown() {
        let codec = WireCodec::new(4).unwrap();
        let (mut listener, connector) = LoopbackListener::new(codec);
        let client = connector.connect();
        let Some(TransportEvent::ConnectRequest(endpoint)) = listener.next_event(WAIT).unwrap() else {
            panic!("expected connect request");
        };
        endpoint.accept().unwrap();
        let pool = Arc::new(ChunkPool::with_capacity(4, 4, 4096, Arc::new(LocalRegistrar::new())).unwrap());
        let conn = Arc::new(Connection::new(
            OwnerId::new(0, 1),
            endpoint,
            codec,
            Arc::clone(&pool),
            Arc::new(DaemonStats::new()),
        ));
        conn.greet().unwrap();
        let handle = spawn(Arc::clone(&conn), Duration::from_millis(10)).unwrap();

        assert_eq!(client.recv(WAIT), Some(Message::FreeSize { free_chunks: 4 }));
        client.send(&Message::Bind { chunks: 2 }).unwrap();
        assert!(matches!(client.recv(WAIT), Some(Message::Info { chunks }) if chunks.len() == 2));
        client.send(&Message::Query).unwrap();
        assert_eq!(client.recv(WAIT), Some(Message::FreeSize { free_chunks: 2 }));

        assert_eq!(conn.teardown(), 2);
        handle.join().unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn test_dispatcher_exits_on_client_disconnect() {
        let codec = WireCodec::new(4).unwrap();
        let (mut listener, connector) = LoopbackListener::new(codec);
        let client = connector.connect();
        let Some(TransportEvent::ConnectRequest(endpoint)) = listener.next_event(WAIT).unwrap() else {
            panic!("expected connect request");
        };
        endpoint.accept().unwrap();
        let pool = Arc::new(ChunkPool::with_capacity(4, 4, 4096, Arc::new(LocalRegistrar::new())).unwrap());
        let conn = Arc::new(Connection::new(
            OwnerId::new(1, 1),
            endpoint,
            codec,
            pool,
            Arc::new(DaemonStats::new()),
        ));
        let handle = spawn(Arc::clone(&conn), Duration::from_millis(10)).unwrap();
        client.disconnect();
        handle.join().unwrap();
        assert!(!conn.qp().is_down());
    }
}
