//! Runtime configuration
//!
//! All knobs consumed by the transport, the coordinator and the dispatch pool
//! live in [`RuntimeConfig`]. Values can be built in code with the `with_*`
//! methods or deserialized from a JSON document; missing fields take their
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::codec::CodecKind;
use crate::error::ConfigError;

/// Default maximum frame payload, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 999_999;

/// Runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Largest frame payload accepted or sent, in bytes
    pub max_frame_size: usize,

    /// Timeout for opening outbound connections, in milliseconds
    pub connect_timeout_ms: u64,

    /// Read timeout on inbound connections, in milliseconds (0 = none)
    pub idle_timeout_ms: u64,

    /// Handoff queue capacity between network readers and processing (0 = rendezvous)
    pub handoff_capacity: usize,

    /// Bound on a single coordinator wait, in milliseconds
    pub max_coordinator_wait_ms: u64,

    /// Cap on coordinator wait attempts (None = retry forever)
    pub max_acquire_retries: Option<u32>,

    /// Number of routing partitions in the cluster
    pub partition_count: u32,

    /// Number of dispatch workers
    pub num_workers: usize,

    /// Mailbox capacity per dispatch worker
    pub worker_queue_capacity: usize,

    /// Threads draining the handoff queue
    pub receive_threads: usize,

    /// Period of the checkpoint trigger, in milliseconds (0 = disabled)
    pub checkpoint_interval_ms: u64,

    /// Pin dispatch workers to cores
    pub enable_cpu_affinity: bool,

    /// Payload codec
    pub codec: CodecKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: 5_000,
            idle_timeout_ms: 0,
            handoff_capacity: 0,
            max_coordinator_wait_ms: 10_000,
            max_acquire_retries: None,
            partition_count: 1,
            num_workers: default_workers(),
            worker_queue_capacity: 1024,
            receive_threads: 1,
            checkpoint_interval_ms: 0,
            enable_cpu_affinity: false,
            codec: CodecKind::default(),
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file and validate it
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::invalid("max_frame_size", "must be positive"));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::invalid(
                "max_frame_size",
                "must fit the 4-byte length prefix",
            ));
        }
        if self.partition_count == 0 {
            return Err(ConfigError::invalid("partition_count", "must be positive"));
        }
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("num_workers", "must be positive"));
        }
        if self.worker_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "worker_queue_capacity",
                "must be positive",
            ));
        }
        if self.receive_threads == 0 {
            return Err(ConfigError::invalid("receive_threads", "must be positive"));
        }
        if self.max_coordinator_wait_ms == 0 {
            return Err(ConfigError::invalid(
                "max_coordinator_wait_ms",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the inbound idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the handoff queue capacity
    pub fn with_handoff_capacity(mut self, capacity: usize) -> Self {
        self.handoff_capacity = capacity;
        self
    }

    /// Set the coordinator wait bound
    pub fn with_max_coordinator_wait(mut self, wait: Duration) -> Self {
        self.max_coordinator_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Cap coordinator wait attempts
    pub fn with_max_acquire_retries(mut self, retries: u32) -> Self {
        self.max_acquire_retries = Some(retries);
        self
    }

    /// Set the partition count
    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    /// Set the number of dispatch workers
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Set the per-worker mailbox capacity
    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    /// Set the number of receive threads
    pub fn with_receive_threads(mut self, threads: usize) -> Self {
        self.receive_threads = threads;
        self
    }

    /// Set the checkpoint trigger period
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable CPU affinity pinning
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.enable_cpu_affinity = enable;
        self
    }

    /// Select the payload codec
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout as a duration, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Coordinator wait bound as a duration
    pub fn max_coordinator_wait(&self) -> Duration {
        Duration::from_millis(self.max_coordinator_wait_ms)
    }

    /// Checkpoint period, if enabled
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }
}

/// Available parallelism, or 4 when it cannot be determined
pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.handoff_capacity, 0);
        assert!(config.max_acquire_retries.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{ "partition_count": 8, "codec": "json", "max_acquire_retries": 3 }"#,
        )
        .unwrap();
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.codec, CodecKind::Json);
        assert_eq!(config.max_acquire_retries, Some(3));
        assert_eq!(config.worker_queue_capacity, 1024);
    }

    #[test]
    fn test_rejects_zero_partitions() {
        let err = RuntimeConfig::from_json_str(r#"{ "partition_count": 0 }"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "partition_count",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(matches!(
            RuntimeConfig::from_json_str(r#"{ "partitions": 4 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_builder_durations() {
        let config = RuntimeConfig::new()
            .with_max_coordinator_wait(Duration::from_millis(250))
            .with_checkpoint_interval(Duration::from_secs(2));
        assert_eq!(config.max_coordinator_wait(), Duration::from_millis(250));
        assert_eq!(config.checkpoint_interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.idle_timeout(), None);
    }
}
