//! Bounded channels used inside a node
//!
//! Two shapes are needed:
//!
//! - **handoff**: between network readers and the receive threads. Backed by
//!   crossbeam, whose zero-capacity channel is a true rendezvous, so a reader
//!   stays blocked until a receive thread takes the payload.
//! - **mailbox**: per dispatch worker. Backed by flume.
//!
//! Both are bounded; a full channel blocks the sender, which is how
//! backpressure travels from processing back to the TCP socket.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache line size for padding (typically 64 bytes on x86-64)
const CACHE_LINE_SIZE: usize = 64;

/// Channel type selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Network → processing handoff (crossbeam)
    Handoff,

    /// Dispatch worker mailbox (flume)
    Mailbox,
}

/// Statistics for channel monitoring
#[repr(align(64))] // Align to cache line
#[derive(Debug)]
pub struct ChannelStats {
    /// Number of messages sent
    pub messages_sent: AtomicU64,

    /// Number of messages received
    pub messages_received: AtomicU64,

    /// Number of sends that found the channel full
    pub full_stalls: AtomicU64,

    /// Number of send errors
    pub send_errors: AtomicU64,

    _padding: [u8; CACHE_LINE_SIZE - 32], // Pad to cache line
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            full_stalls: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 32],
        }
    }
}

impl ChannelStats {
    /// Get the number of messages sent
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Get the number of messages received
    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Get the number of timed sends that gave up because the channel stayed full
    pub fn full_stalls(&self) -> u64 {
        self.full_stalls.load(Ordering::Relaxed)
    }

    /// Get the number of send errors
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}

/// Error from [`Sender::send_timeout`]; hands the message back
#[derive(Debug)]
pub enum SendTimeoutError<T> {
    /// The channel stayed full for the whole timeout
    Timeout(T),
    /// All receivers are gone
    Disconnected(T),
}

/// Sender half of a channel
pub struct Sender<T> {
    inner: SenderInner<T>,
    stats: Arc<ChannelStats>,
}

enum SenderInner<T> {
    Flume(flume::Sender<T>),
    Crossbeam(crossbeam::channel::Sender<T>),
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: match &self.inner {
                SenderInner::Flume(s) => SenderInner::Flume(s.clone()),
                SenderInner::Crossbeam(s) => SenderInner::Crossbeam(s.clone()),
            },
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> Sender<T> {
    /// Send a message, blocking while the channel is full
    pub fn send(&self, msg: T) -> Result<()> {
        let result = match &self.inner {
            SenderInner::Flume(s) => s.send(msg).map_err(Error::from),
            SenderInner::Crossbeam(s) => s.send(msg).map_err(Error::from),
        };
        self.record(result)
    }

    /// Send a message, giving it back if the channel stays full for `timeout`
    pub fn send_timeout(&self, msg: T, timeout: Duration) -> std::result::Result<(), SendTimeoutError<T>> {
        let result = match &self.inner {
            SenderInner::Flume(s) => s.send_timeout(msg, timeout).map_err(|e| match e {
                flume::SendTimeoutError::Timeout(m) => SendTimeoutError::Timeout(m),
                flume::SendTimeoutError::Disconnected(m) => SendTimeoutError::Disconnected(m),
            }),
            SenderInner::Crossbeam(s) => s.send_timeout(msg, timeout).map_err(|e| match e {
                crossbeam::channel::SendTimeoutError::Timeout(m) => SendTimeoutError::Timeout(m),
                crossbeam::channel::SendTimeoutError::Disconnected(m) => {
                    SendTimeoutError::Disconnected(m)
                }
            }),
        };

        match &result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.full_stalls.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Messages currently queued
    pub fn len(&self) -> usize {
        match &self.inner {
            SenderInner::Flume(s) => s.len(),
            SenderInner::Crossbeam(s) => s.len(),
        }
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get channel statistics
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    fn record(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

/// Receiver half of a channel
pub struct Receiver<T> {
    inner: ReceiverInner<T>,
    stats: Arc<ChannelStats>,
}

enum ReceiverInner<T> {
    Flume(flume::Receiver<T>),
    Crossbeam(crossbeam::channel::Receiver<T>),
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: match &self.inner {
                ReceiverInner::Flume(r) => ReceiverInner::Flume(r.clone()),
                ReceiverInner::Crossbeam(r) => ReceiverInner::Crossbeam(r.clone()),
            },
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> Receiver<T> {
    /// Receive a message from the channel
    pub fn recv(&self) -> Result<T> {
        let result = match &self.inner {
            ReceiverInner::Flume(r) => r.recv().map_err(Error::from),
            ReceiverInner::Crossbeam(r) => r.recv().map_err(Error::from),
        };
        self.record(result)
    }

    /// Receive a message, failing with [`Error::Timeout`] after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        let result = match &self.inner {
            ReceiverInner::Flume(r) => r.recv_timeout(timeout).map_err(|e| match e {
                flume::RecvTimeoutError::Timeout => Error::Timeout,
                flume::RecvTimeoutError::Disconnected => {
                    Error::ReceiveError("Channel disconnected".to_string())
                }
            }),
            ReceiverInner::Crossbeam(r) => r.recv_timeout(timeout).map_err(|e| match e {
                crossbeam::channel::RecvTimeoutError::Timeout => Error::Timeout,
                crossbeam::channel::RecvTimeoutError::Disconnected => {
                    Error::ReceiveError("Channel disconnected".to_string())
                }
            }),
        };
        self.record(result)
    }

    /// Try to receive a message without blocking
    pub fn try_recv(&self) -> Result<T> {
        let result = match &self.inner {
            ReceiverInner::Flume(r) => r.try_recv().map_err(|e| match e {
                flume::TryRecvError::Empty => Error::ReceiveError("Channel empty".to_string()),
                flume::TryRecvError::Disconnected => {
                    Error::ReceiveError("Channel disconnected".to_string())
                }
            }),
            ReceiverInner::Crossbeam(r) => r.try_recv().map_err(|e| match e {
                crossbeam::channel::TryRecvError::Empty => {
                    Error::ReceiveError("Channel empty".to_string())
                }
                crossbeam::channel::TryRecvError::Disconnected => {
                    Error::ReceiveError("Channel disconnected".to_string())
                }
            }),
        };
        self.record(result)
    }

    /// Get channel statistics
    pub fn stats(&self) -> Arc<ChannelStats> {
        Arc::clone(&self.stats)
    }

    fn record(&self, result: Result<T>) -> Result<T> {
        if result.is_ok() {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Channel factory
pub struct Channel;

impl Channel {
    /// Create a bounded channel of the given type (capacity 0 = rendezvous)
    pub fn new<T>(capacity: usize, channel_type: ChannelType) -> (Sender<T>, Receiver<T>) {
        let stats = Arc::new(ChannelStats::default());

        let (tx, rx) = match channel_type {
            ChannelType::Handoff => {
                let (tx, rx) = crossbeam::channel::bounded(capacity);
                (SenderInner::Crossbeam(tx), ReceiverInner::Crossbeam(rx))
            }
            ChannelType::Mailbox => {
                let (tx, rx) = flume::bounded(capacity);
                (SenderInner::Flume(tx), ReceiverInner::Flume(rx))
            }
        };

        (
            Sender {
                inner: tx,
                stats: Arc::clone(&stats),
            },
            Receiver { inner: rx, stats },
        )
    }

    /// Create a handoff queue (0 = rendezvous)
    pub fn handoff<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        Self::new(capacity, ChannelType::Handoff)
    }

    /// Create a worker mailbox
    pub fn mailbox<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        Self::new(capacity, ChannelType::Mailbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_mailbox_channel() {
        let (tx, rx) = Channel::mailbox::<i32>(10);

        tx.send(42).unwrap();
        tx.send(43).unwrap();

        assert_eq!(rx.recv().unwrap(), 42);
        assert_eq!(rx.recv().unwrap(), 43);

        assert_eq!(tx.stats().sent(), 2);
        assert_eq!(rx.stats().received(), 2);
    }

    #[test]
    fn test_rendezvous_handoff_blocks_until_taken() {
        let (tx, rx) = Channel::handoff::<u32>(0);

        // Nobody is receiving, so a rendezvous send cannot complete.
        match tx.send_timeout(1, Duration::from_millis(20)) {
            Err(SendTimeoutError::Timeout(msg)) => assert_eq!(msg, 1),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(tx.stats().full_stalls(), 1);

        let consumer = thread::spawn(move || rx.recv().unwrap());
        tx.send(7).unwrap();
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn test_bounded_mailbox_applies_backpressure() {
        let (tx, rx) = Channel::mailbox::<u32>(1);
        tx.send(1).unwrap();
        assert!(matches!(
            tx.send_timeout(2, Duration::from_millis(20)),
            Err(SendTimeoutError::Timeout(2))
        ));
        assert_eq!(rx.recv().unwrap(), 1);
        assert!(tx.send_timeout(2, Duration::from_millis(20)).is_ok());
        assert_eq!(tx.stats().full_stalls(), 1);
    }

    #[test]
    fn test_recv_timeout() {
        let (_tx, rx) = Channel::handoff::<u32>(4);
        let start = Instant::now();
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(30)),
            Err(Error::Timeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_disconnected_receiver() {
        let (tx, rx) = Channel::mailbox::<u32>(4);
        drop(tx);
        assert!(matches!(rx.recv(), Err(Error::ReceiveError(_))));
    }
}
