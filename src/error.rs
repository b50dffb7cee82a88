//! Error types for the keyflow runtime

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for keyflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for runtime operations
#[derive(Debug, Error)]
pub enum Error {
    /// Outbound delivery failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame on the wire
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// PE instance could not be created or looked up
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Payload could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Checkpoint storage failure
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Coordinator retries exhausted
    #[error(transparent)]
    CoordinatorTimeout(#[from] CoordinatorTimeout),

    /// A PE's processing path failed
    #[error("processing failed for {pe_type}/{key}: {reason}")]
    Processing {
        /// PE type name.
        pe_type: String,
        /// Printable instance key.
        key: String,
        /// Reason reported by the PE.
        reason: String,
    },

    /// Channel send error
    #[error("channel send error: {0}")]
    SendError(String),

    /// Channel receive error
    #[error("channel receive error: {0}")]
    ReceiveError(String),

    /// Worker is not running
    #[error("worker is not running")]
    WorkerNotRunning,

    /// Worker thread panicked
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// Thread could not be spawned
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failures delivering a message to its destination node.
///
/// Reported to the caller of `send`; the transport never retries on its own.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The assignment view has no owner for the partition.
    #[error("no node assigned to partition {partition}")]
    NoAssignment {
        /// Target partition.
        partition: u32,
    },

    /// The destination address could not be resolved or connected.
    #[error("destination {address} unreachable: {source}")]
    Unreachable {
        /// Destination `host:port`.
        address: String,
        /// Underlying connect error.
        #[source]
        source: io::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested listen address.
        address: String,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// Writing the frame to an open connection failed.
    #[error("send to {address} failed: {source}")]
    Send {
        /// Destination `host:port`.
        address: String,
        /// Underlying write error.
        #[source]
        source: io::Error,
    },

    /// The payload could not be framed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The emitter was closed.
    #[error("emitter closed")]
    Closed,
}

/// Framing errors. The offending connection is closed; others are unaffected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix exceeds the configured maximum.
    ///
    /// Detected before any payload allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Length announced by the prefix.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes announced.
        expected: usize,
        /// Bytes read before EOF.
        actual: usize,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while resolving a PE instance.
///
/// Propagated to whoever invoked dispatch; the event counts as undelivered.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No factory registered for the PE type.
    #[error("unknown PE type: {0}")]
    UnknownType(String),

    /// The factory refused to build the instance.
    #[error("factory for {pe_type} failed for key {key}: {reason}")]
    FactoryFailed {
        /// PE type name.
        pe_type: String,
        /// Printable instance key.
        key: String,
        /// Reason reported by the factory.
        reason: String,
    },
}

/// Payload codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding failed.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Checkpoint storage errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Storage backend I/O error.
    #[error("checkpoint storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// The PE could not produce or restore a snapshot.
    #[error("snapshot failed for {pe_type}/{key}: {reason}")]
    Snapshot {
        /// PE type name.
        pe_type: String,
        /// Printable instance key.
        key: String,
        /// Reason reported by the PE.
        reason: String,
    },
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an out-of-range value.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Read(#[from] io::Error),

    /// The configuration document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Raised when an acquisition exhausts the configured retry cap.
#[derive(Debug, Clone, Error)]
#[error("could not acquire {permit} permit for instance {instance} after {attempts} waits of {wait:?}")]
pub struct CoordinatorTimeout {
    /// Which permit was requested.
    pub permit: &'static str,
    /// Instance identifier.
    pub instance: u64,
    /// Number of wait attempts made.
    pub attempts: u32,
    /// Bound applied to each wait.
    pub wait: Duration,
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(err: flume::SendError<T>) -> Self {
        Error::SendError(err.to_string())
    }
}

impl From<flume::RecvError> for Error {
    fn from(err: flume::RecvError) -> Self {
        Error::ReceiveError(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::SendError(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::ReceiveError(err.to_string())
    }
}
