//! Inbound transport
//!
//! [`TcpListener`] accepts connections on a background thread and gives each
//! one a reader thread. Readers decode frames and hand the payloads to a
//! bounded queue drained through [`Listener::recv`]. When the queue is full a
//! reader stops reading its socket, so the sender sees TCP backpressure.
//!
//! A malformed frame closes only the connection it arrived on.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Receiver, SendTimeoutError, Sender};
use crate::config::RuntimeConfig;
use crate::error::{Error, ProtocolError, TransportError};
use crate::frame::FrameReader;

/// How often blocked threads look at the closed flag
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Source of inbound payloads
pub trait Listener: Send + Sync {
    /// Next payload; blocks until one arrives. `None` once closed.
    fn recv(&self) -> Option<Vec<u8>>;

    /// Stop accepting and close every connection
    fn close(&self);
}

/// Inbound counters
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    frames: AtomicU64,
    protocol_errors: AtomicU64,
}

impl ListenerStats {
    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Frames handed to the queue
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Connections dropped for malformed frames
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }
}

struct Shared {
    closed: AtomicBool,
    connections: Mutex<AHashMap<u64, TcpStream>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    next_conn: AtomicU64,
    handoff: Sender<Vec<u8>>,
    max_frame_size: usize,
    idle_timeout: Option<Duration>,
    stats: ListenerStats,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// TCP listener feeding a bounded handoff queue
pub struct TcpListener {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    queue: Receiver<Vec<u8>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpListener {
    /// Bind `addr` and start accepting connections
    pub fn bind(addr: &str, config: &RuntimeConfig) -> Result<Self, TransportError> {
        let requested = |source| TransportError::Bind {
            address: addr.to_owned(),
            source,
        };
        let socket = StdTcpListener::bind(addr).map_err(requested)?;
        let local_addr = socket.local_addr().map_err(requested)?;
        let bind_err = |source| TransportError::Bind {
            address: local_addr.to_string(),
            source,
        };
        socket.set_nonblocking(true).map_err(bind_err)?;

        let (handoff, queue) = Channel::handoff(config.handoff_capacity);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            connections: Mutex::new(AHashMap::new()),
            readers: Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(1),
            handoff,
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout(),
            stats: ListenerStats::default(),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || accept_loop(socket, accept_shared))
            .map_err(bind_err)?;

        info!(address = %local_addr, "listening");
        Ok(Self {
            local_addr,
            shared,
            queue,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    /// Address actually bound (useful after binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently open
    pub fn active_connections(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Inbound counters
    pub fn stats(&self) -> &ListenerStats {
        &self.shared.stats
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Like [`Listener::recv`], giving up after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.shared.is_closed() {
                return Ok(None);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            match self.queue.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
                Ok(payload) => return Ok(Some(payload)),
                Err(Error::Timeout) => continue,
                Err(_) => return Ok(None),
            }
        }
    }
}

impl Listener for TcpListener {
    fn recv(&self) -> Option<Vec<u8>> {
        loop {
            if self.shared.is_closed() {
                return None;
            }
            match self.queue.recv_timeout(POLL_INTERVAL) {
                Ok(payload) => return Some(payload),
                Err(Error::Timeout) => continue,
                Err(_) => return None,
            }
        }
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                warn!(address = %self.local_addr, "accept thread panicked");
            }
        }

        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let readers: Vec<_> = self.shared.readers.lock().drain(..).collect();
        for reader in readers {
            if reader.join().is_err() {
                warn!(address = %self.local_addr, "connection reader panicked");
            }
        }
        info!(address = %self.local_addr, "listener closed");
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(socket: StdTcpListener, shared: Arc<Shared>) {
    while !shared.is_closed() {
        match socket.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping connection");
                    continue;
                }
                spawn_reader(stream, peer, &shared);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    // Dropping `socket` releases the port.
}

fn spawn_reader(stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) {
    let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let registered = match stream.try_clone() {
        Ok(clone) => clone,
        Err(e) => {
            warn!(%peer, error = %e, "dropping connection");
            return;
        }
    };
    shared.connections.lock().insert(id, registered);
    shared.stats.accepted.fetch_add(1, Ordering::Relaxed);

    let reader_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("conn-{}", id))
        .spawn(move || read_connection(id, peer, stream, &reader_shared));

    match spawned {
        Ok(handle) => {
            let mut readers = shared.readers.lock();
            readers.retain(|h| !h.is_finished());
            readers.push(handle);
        }
        Err(e) => {
            warn!(%peer, error = %e, "could not spawn connection reader");
            if let Some(stream) = shared.connections.lock().remove(&id) {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

fn read_connection(id: u64, peer: SocketAddr, stream: TcpStream, shared: &Shared) {
    debug!(conn = id, %peer, "connection opened");
    if let Err(e) = stream.set_read_timeout(shared.idle_timeout) {
        warn!(conn = id, error = %e, "could not set idle timeout");
    }

    let mut frames = FrameReader::new(BufReader::new(stream), shared.max_frame_size);
    while !shared.is_closed() {
        match frames.read_frame() {
            Ok(Some(payload)) => {
                if !hand_off(shared, payload) {
                    break;
                }
                shared.stats.frames.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                debug!(conn = id, %peer, "closed by peer");
                break;
            }
            Err(ProtocolError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                debug!(conn = id, %peer, "idle timeout");
                break;
            }
            Err(ProtocolError::Io(e)) => {
                if !shared.is_closed() {
                    debug!(conn = id, %peer, error = %e, "read failed");
                }
                break;
            }
            Err(e) => {
                shared.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(conn = id, %peer, error = %e, "protocol error, closing connection");
                break;
            }
        }
    }

    if let Some(stream) = shared.connections.lock().remove(&id) {
        let _ = stream.shutdown(Shutdown::Both);
    }
    debug!(conn = id, %peer, "connection closed");
}

/// Push one payload, waiting while the queue is full. False once closed.
fn hand_off(shared: &Shared, mut payload: Vec<u8>) -> bool {
    loop {
        if shared.is_closed() {
            return false;
        }
        match shared.handoff.send_timeout(payload, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(p)) => payload = p,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}
