//! Outbound transport
//!
//! An [`Emitter`] delivers one [`EventMessage`] to whichever node currently
//! owns the target partition. [`TcpEmitter`] keeps one connection per
//! destination address, shared by every partition routed there, and opens it
//! on first use. A failed write drops the connection so the next send
//! reconnects.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::assignment::{Assignment, AssignmentSnapshot};
use crate::codec::SerializerDeserializer;
use crate::config::RuntimeConfig;
use crate::error::TransportError;
use crate::event::EventMessage;
use crate::frame::encode_frame;

/// Sends framed messages to the owner of a partition
pub trait Emitter: Send + Sync {
    /// Deliver `message` to the node owning `partition`.
    ///
    /// Failures are returned as-is; nothing is retried.
    fn send(&self, partition: u32, message: &EventMessage) -> Result<(), TransportError>;

    /// Drop every pooled connection; later sends fail with `Closed`
    fn close(&self);
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct EmitterStats {
    sent: AtomicU64,
    failures: Mutex<AHashMap<String, u64>>,
}

impl EmitterStats {
    /// Messages written successfully
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Failed sends across all destinations
    pub fn failures(&self) -> u64 {
        self.failures.lock().values().sum()
    }

    /// Failed sends to one `host:port`
    pub fn failures_for(&self, address: &str) -> u64 {
        self.failures.lock().get(address).copied().unwrap_or(0)
    }

    fn record_failure(&self, address: &str) -> u64 {
        let mut failures = self.failures.lock();
        let count = failures.entry(address.to_owned()).or_insert(0);
        *count += 1;
        *count
    }
}

/// An outbound stream. Writers serialize on `write`; shutdown needs no lock
/// and wakes a writer stalled on a peer that stopped reading.
struct Connection {
    stream: TcpStream,
    write: Mutex<()>,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            write: Mutex::new(()),
        }
    }

    fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let _writing = self.write.lock();
        let mut stream = &self.stream;
        stream.write_all(frame)?;
        stream.flush()
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

type ConnectionMap = Mutex<AHashMap<String, Arc<Connection>>>;

/// TCP emitter with one lazily opened connection per destination
pub struct TcpEmitter {
    assignment: Arc<dyn Assignment>,
    codec: Arc<dyn SerializerDeserializer>,
    connections: Arc<ConnectionMap>,
    max_frame_size: usize,
    connect_timeout: Duration,
    stats: EmitterStats,
    closed: AtomicBool,
}

impl TcpEmitter {
    /// Create an emitter resolving destinations through `assignment`.
    ///
    /// Connections to nodes that disappear from a published snapshot are
    /// dropped.
    pub fn new(
        assignment: Arc<dyn Assignment>,
        codec: Arc<dyn SerializerDeserializer>,
        config: &RuntimeConfig,
    ) -> Self {
        let connections: Arc<ConnectionMap> = Arc::new(Mutex::new(AHashMap::new()));

        let weak: Weak<ConnectionMap> = Arc::downgrade(&connections);
        assignment.subscribe(Box::new(move |snapshot| {
            if let Some(connections) = weak.upgrade() {
                prune_connections(&connections, snapshot);
            }
        }));

        Self {
            assignment,
            codec,
            connections,
            max_frame_size: config.max_frame_size,
            connect_timeout: config.connect_timeout(),
            stats: EmitterStats::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// Delivery counters
    pub fn stats(&self) -> &EmitterStats {
        &self.stats
    }

    /// Number of open outbound connections
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn connection(&self, address: &str) -> Result<Arc<Connection>, TransportError> {
        if let Some(conn) = self.connections.lock().get(address) {
            return Ok(Arc::clone(conn));
        }

        let stream = self.connect(address)?;
        let mut connections = self.connections.lock();
        if self.closed.load(Ordering::Acquire) {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(TransportError::Closed);
        }
        // Another sender may have connected meanwhile; keep the first one.
        let conn = connections
            .entry(address.to_owned())
            .or_insert_with(|| Arc::new(Connection::new(stream)));
        Ok(Arc::clone(conn))
    }

    fn connect(&self, address: &str) -> Result<TcpStream, TransportError> {
        let unreachable = |source| TransportError::Unreachable {
            address: address.to_owned(),
            source,
        };

        let mut last_err = None;
        for addr in address.to_socket_addrs().map_err(unreachable)? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(address, error = %e, "could not set TCP_NODELAY");
                    }
                    debug!(address, "connected");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(unreachable(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
        })))
    }

    fn fail(&self, address: &str, err: TransportError) -> TransportError {
        let count = self.stats.record_failure(address);
        warn!(address, failures = count, error = %err, "send failed");
        err
    }
}

impl Emitter for TcpEmitter {
    fn send(&self, partition: u32, message: &EventMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let node = self
            .assignment
            .current_node_for(partition)
            .ok_or(TransportError::NoAssignment { partition })?;
        let address = node.address();

        let payload = self.codec.encode_message(message)?;
        let frame = encode_frame(&payload, self.max_frame_size)?;

        let conn = self
            .connection(&address)
            .map_err(|e| self.fail(&address, e))?;

        match conn.write_frame(&frame) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                {
                    let mut connections = self.connections.lock();
                    if connections
                        .get(&address)
                        .is_some_and(|current| Arc::ptr_eq(current, &conn))
                    {
                        connections.remove(&address);
                    }
                }
                conn.shutdown();
                Err(self.fail(&address, TransportError::Send { address: address.clone(), source }))
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<_> = self.connections.lock().drain().collect();
        for (address, conn) in drained {
            conn.shutdown();
            debug!(address = %address, "connection closed");
        }
    }
}

impl Drop for TcpEmitter {
    fn drop(&mut self) {
        self.close();
    }
}

fn prune_connections(connections: &ConnectionMap, snapshot: &AssignmentSnapshot) {
    let live: AHashSet<String> = snapshot.nodes().map(|n| n.address()).collect();
    let mut dropped = Vec::new();
    connections.lock().retain(|address, conn| {
        let keep = live.contains(address);
        if !keep {
            dropped.push((address.clone(), Arc::clone(conn)));
        }
        keep
    });
    for (address, conn) in dropped {
        conn.shutdown();
        debug!(address = %address, "dropped connection to unassigned node");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{AssignmentView, ClusterNode};
    use crate::codec::BincodeCodec;
    use crate::frame::FrameReader;
    use std::net::TcpListener;

    fn emitter_for(view: &Arc<AssignmentView>) -> TcpEmitter {
        let config = RuntimeConfig::new().with_connect_timeout(Duration::from_millis(500));
        TcpEmitter::new(
            Arc::clone(view) as Arc<dyn Assignment>,
            Arc::new(BincodeCodec),
            &config,
        )
    }

    #[test]
    fn test_no_assignment() {
        let view = Arc::new(AssignmentView::default());
        let emitter = emitter_for(&view);
        let msg = EventMessage::new(3, "words", vec![1]);

        let err = emitter.send(3, &msg).unwrap_err();
        assert!(matches!(err, TransportError::NoAssignment { partition: 3 }));
    }

    #[test]
    fn test_unreachable_destination_is_counted() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let view = Arc::new(AssignmentView::from_nodes([ClusterNode::new(
            0,
            "127.0.0.1",
            port,
        )]));
        let emitter = emitter_for(&view);

        let err = emitter
            .send(0, &EventMessage::new(0, "s", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
        assert_eq!(emitter.stats().failures_for(&format!("127.0.0.1:{port}")), 1);
        assert_eq!(emitter.connection_count(), 0);
    }

    #[test]
    fn test_partitions_on_same_node_share_connection() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let view = Arc::new(AssignmentView::from_nodes([
            ClusterNode::new(0, "127.0.0.1", port),
            ClusterNode::new(1, "127.0.0.1", port),
        ]));
        let emitter = emitter_for(&view);

        emitter.send(0, &EventMessage::new(0, "s", vec![0])).unwrap();
        emitter.send(1, &EventMessage::new(1, "s", vec![1])).unwrap();
        assert_eq!(emitter.connection_count(), 1);

        let (stream, _) = server.accept().unwrap();
        let mut reader = FrameReader::new(stream, 1024);
        let codec = BincodeCodec;
        for partition in 0..2u32 {
            let frame = reader.read_frame().unwrap().unwrap();
            let msg = codec.decode_message(&frame).unwrap();
            assert_eq!(msg.target_partition, partition);
        }
        assert_eq!(emitter.stats().sent(), 2);
    }

    #[test]
    fn test_closed_emitter_rejects_sends() {
        let view = Arc::new(AssignmentView::default());
        let emitter = emitter_for(&view);
        emitter.close();
        emitter.close();
        assert!(matches!(
            emitter.send(0, &EventMessage::new(0, "s", Vec::new())),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_reassignment_prunes_connections() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let view = Arc::new(AssignmentView::from_nodes([ClusterNode::new(
            0,
            "127.0.0.1",
            port,
        )]));
        let emitter = emitter_for(&view);
        emitter.send(0, &EventMessage::new(0, "s", vec![0])).unwrap();
        assert_eq!(emitter.connection_count(), 1);

        view.replace(AssignmentSnapshot::new(
            1,
            [ClusterNode::new(0, "127.0.0.1", port.wrapping_add(1))],
        ));
        assert_eq!(emitter.connection_count(), 0);
    }

    #[test]
    fn test_reassignment_does_not_wait_for_stalled_writer() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let view = Arc::new(AssignmentView::from_nodes([ClusterNode::new(
            0,
            "127.0.0.1",
            port,
        )]));
        let emitter = Arc::new(emitter_for(&view));

        // Nobody reads from the accepted stream, so the writer blocks once
        // the socket buffers are full.
        let writer = {
            let emitter = Arc::clone(&emitter);
            std::thread::spawn(move || loop {
                if let Err(e) = emitter.send(0, &EventMessage::new(0, "s", vec![0; 900_000])) {
                    return e;
                }
            })
        };
        let (_held, _) = server.accept().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let mut last = emitter.stats().sent();
        loop {
            std::thread::sleep(Duration::from_millis(200));
            let sent = emitter.stats().sent();
            if (sent == last && sent > 0) || std::time::Instant::now() > deadline {
                break;
            }
            last = sent;
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let view = Arc::clone(&view);
            std::thread::spawn(move || {
                view.replace(AssignmentSnapshot::new(
                    1,
                    [ClusterNode::new(0, "127.0.0.1", port.wrapping_add(1))],
                ));
                let _ = done_tx.send(());
            });
        }
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(emitter.connection_count(), 0);

        let err = writer.join().unwrap();
        assert!(
            matches!(err, TransportError::Send { .. } | TransportError::Unreachable { .. }),
            "unexpected error: {err}"
        );
    }
}
