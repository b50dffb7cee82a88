//! Checkpointing
//!
//! [`Checkpointer`] takes the serializing permit for an instance, snapshots
//! its state and hands the bytes to a [`CheckpointStorage`] backend.
//! [`CheckpointScheduler`] drives it periodically for every instance that
//! processed events since its last snapshot.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Sender};
use crate::coordinator::CheckpointingCoordinator;
use crate::error::{CheckpointError, Error, Result};
use crate::registry::{PeInstance, PeRegistry};

/// Where serialized PE state ends up
pub trait CheckpointStorage: Send + Sync {
    /// Persist the latest snapshot of (type, key)
    fn save(&self, pe_type: &str, key: &[u8], bytes: &[u8]) -> std::result::Result<(), CheckpointError>;

    /// Latest snapshot of (type, key), if any
    fn fetch(&self, pe_type: &str, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, CheckpointError>;
}

/// Discards every snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStorage;

impl CheckpointStorage for NoOpStorage {
    fn save(&self, _pe_type: &str, _key: &[u8], _bytes: &[u8]) -> std::result::Result<(), CheckpointError> {
        Ok(())
    }

    fn fetch(&self, _pe_type: &str, _key: &[u8]) -> std::result::Result<Option<Vec<u8>>, CheckpointError> {
        Ok(None)
    }
}

/// Keeps snapshots in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshots: Mutex<AHashMap<(String, Vec<u8>), Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStorage for MemoryStorage {
    fn save(&self, pe_type: &str, key: &[u8], bytes: &[u8]) -> std::result::Result<(), CheckpointError> {
        self.snapshots
            .lock()
            .insert((pe_type.to_owned(), key.to_vec()), bytes.to_vec());
        Ok(())
    }

    fn fetch(&self, pe_type: &str, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, CheckpointError> {
        Ok(self
            .snapshots
            .lock()
            .get(&(pe_type.to_owned(), key.to_vec()))
            .cloned())
    }
}

/// One file per instance under `root/<pe_type>/<hex key>.ckpt`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a partial snapshot behind.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    root: PathBuf,
}

impl FileSystemStorage {
    /// Use `root` as the storage directory, creating it if needed
    pub fn new(root: impl Into<PathBuf>) -> std::result::Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Storage directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, pe_type: &str, key: &[u8]) -> PathBuf {
        self.root
            .join(sanitize(pe_type))
            .join(format!("{}.ckpt", hex(key)))
    }
}

impl CheckpointStorage for FileSystemStorage {
    fn save(&self, pe_type: &str, key: &[u8], bytes: &[u8]) -> std::result::Result<(), CheckpointError> {
        let path = self.path_for(pe_type, key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("ckpt.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn fetch(&self, pe_type: &str, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, CheckpointError> {
        match fs::read(self.path_for(pe_type, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

fn sanitize(pe_type: &str) -> String {
    pe_type
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Snapshots PE instances under the coordinator's serializing permit
pub struct Checkpointer {
    coordinator: Arc<CheckpointingCoordinator>,
    storage: Arc<dyn CheckpointStorage>,
}

impl Checkpointer {
    /// Create a checkpointer writing to `storage`
    pub fn new(coordinator: Arc<CheckpointingCoordinator>, storage: Arc<dyn CheckpointStorage>) -> Self {
        Self {
            coordinator,
            storage,
        }
    }

    /// Snapshot one instance and save it.
    ///
    /// Returns `false` when the instance produced no snapshot (not
    /// checkpointable, or removed meanwhile).
    pub fn checkpoint(&self, instance: &PeInstance) -> Result<bool> {
        let snapshot = {
            let _permit = self.coordinator.serialization(instance.id())?;
            instance.snapshot()?
        };

        match snapshot {
            Some(bytes) => {
                if let Err(e) = self.storage.save(instance.pe_type(), instance.key(), &bytes) {
                    instance.mark_dirty();
                    return Err(e.into());
                }
                debug!(instance = %instance.id(), bytes = bytes.len(), "checkpoint saved");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Checkpoint every dirty instance of `registry`; returns how many were saved
    pub fn checkpoint_dirty(&self, registry: &PeRegistry) -> usize {
        let mut saved = 0;
        for instance in registry.instances() {
            if !instance.is_dirty() {
                continue;
            }
            match self.checkpoint(&instance) {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(Error::CoordinatorTimeout(e)) => {
                    warn!(instance = %instance.id(), error = %e, "checkpoint skipped");
                }
                Err(e) => {
                    warn!(instance = %instance.id(), error = %e, "checkpoint failed");
                }
            }
        }
        saved
    }
}

/// Background thread running [`Checkpointer::checkpoint_dirty`] periodically
pub struct CheckpointScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointScheduler {
    /// Start checkpointing `registry` every `interval`
    pub fn spawn(
        checkpointer: Arc<Checkpointer>,
        registry: Arc<PeRegistry>,
        interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = Channel::mailbox::<()>(1);

        let handle = thread::Builder::new()
            .name("checkpoint-trigger".to_string())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "checkpoint trigger started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(Error::Timeout) => {
                            let saved = checkpointer.checkpoint_dirty(&registry);
                            if saved > 0 {
                                debug!(saved, "checkpoint round complete");
                            }
                        }
                        _ => break,
                    }
                }
                info!("checkpoint trigger stopped");
            })
            .map_err(Error::Spawn)?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the trigger thread and wait for it
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("checkpoint trigger thread panicked");
            }
        }
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
