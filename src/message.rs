//! Mailbox envelopes and worker control messages

use std::time::{Duration, Instant};

/// A mailbox entry: the payload plus when it was queued
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// The actual message payload
    pub payload: T,

    /// When the envelope entered the mailbox
    pub enqueued_at: Instant,
}

impl<T> Envelope<T> {
    /// Wrap a payload, stamping the enqueue time
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent waiting in the mailbox so far
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Control messages for worker lifecycle management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop the worker; with `drain`, finish queued messages first
    Stop {
        /// Process what is already in the mailbox before exiting
        drain: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new(42);
        assert_eq!(envelope.payload, 42);
        assert!(envelope.queued_for() < Duration::from_secs(5));
    }
}
