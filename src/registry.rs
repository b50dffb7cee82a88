//! PE instance registry
//!
//! Owns every PE instance on the node. Instances are created on first use
//! through the factory registered for their type, looked up by (type, key)
//! afterwards, and dropped on explicit removal or idle eviction.
//!
//! Creation happens under the registry write lock, so two concurrent first
//! events for the same key always end up on the same instance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStorage;
use crate::coordinator::CheckpointingCoordinator;
use crate::error::{CheckpointError, Error, RegistryError, Result};
use crate::event::Event;
use crate::pe::{
    display_key, Emission, FnFactory, InstanceId, PeError, PeFactory, ProcessContext,
    ProcessingElement,
};

/// One live PE instance
pub struct PeInstance {
    id: InstanceId,
    pe_type: Arc<str>,
    key: Vec<u8>,
    // Serializes callers of `process` so each holds the processing permit alone.
    gate: Mutex<()>,
    pe: Mutex<Box<dyn ProcessingElement>>,
    last_access_ms: AtomicU64,
    dirty: AtomicBool,
    removed: AtomicBool,
}

impl PeInstance {
    /// Node-local identity
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// PE type
    pub fn pe_type(&self) -> &str {
        &self.pe_type
    }

    /// Instance key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Whether events were applied since the last snapshot
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether the instance has been removed from the registry
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Run the processing path under the coordinator's processing permit.
    ///
    /// Returns `None` if the instance was removed while the caller held a
    /// stale reference.
    fn process(
        &self,
        coordinator: &CheckpointingCoordinator,
        event: &Event,
        now_ms: u64,
    ) -> Result<Option<Vec<Emission>>> {
        let _gate = self.gate.lock();
        let _permit = coordinator.processing(self.id);
        let mut pe = self.pe.lock();
        if self.is_removed() {
            return Ok(None);
        }

        let mut ctx = ProcessContext::new(&self.pe_type, &self.key);
        pe.process(event, &mut ctx).map_err(|e| Error::Processing {
            pe_type: self.pe_type.to_string(),
            key: display_key(&self.key),
            reason: e.to_string(),
        })?;
        self.dirty.store(true, Ordering::Release);
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
        Ok(Some(ctx.into_emissions()))
    }

    /// Serialize the state. The caller must hold the serializing permit.
    pub(crate) fn snapshot(&self) -> std::result::Result<Option<Vec<u8>>, CheckpointError> {
        let pe = self.pe.lock();
        if self.is_removed() {
            return Ok(None);
        }
        let snapshot = pe.snapshot().map_err(|e| self.snapshot_error(e))?;
        self.dirty.store(false, Ordering::Release);
        Ok(snapshot)
    }

    /// Flag the state as unsaved again after a snapshot could not be stored
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn finalize_removal(&self) {
        // In-flight processing and serialization both hold the state lock.
        let mut pe = self.pe.lock();
        if !self.removed.swap(true, Ordering::AcqRel) {
            pe.on_remove();
        }
    }

    fn snapshot_error(&self, e: PeError) -> CheckpointError {
        CheckpointError::Snapshot {
            pe_type: self.pe_type.to_string(),
            key: display_key(&self.key),
            reason: e.to_string(),
        }
    }
}

impl std::fmt::Debug for PeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeInstance")
            .field("id", &self.id)
            .field("pe_type", &self.pe_type)
            .field("key", &display_key(&self.key))
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

type InstanceMap = AHashMap<Arc<str>, AHashMap<Vec<u8>, Arc<PeInstance>>>;

/// Creates, finds and removes PE instances
pub struct PeRegistry {
    factories: RwLock<AHashMap<String, Arc<dyn PeFactory>>>,
    instances: RwLock<InstanceMap>,
    coordinator: Arc<CheckpointingCoordinator>,
    storage: Arc<dyn CheckpointStorage>,
    next_id: AtomicU64,
    epoch: Instant,
}

impl PeRegistry {
    /// Create an empty registry.
    ///
    /// New instances are restored from `storage` when a checkpoint exists.
    pub fn new(
        coordinator: Arc<CheckpointingCoordinator>,
        storage: Arc<dyn CheckpointStorage>,
    ) -> Self {
        Self {
            factories: RwLock::new(AHashMap::new()),
            instances: RwLock::new(AHashMap::new()),
            coordinator,
            storage,
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    /// Register the factory for a PE type, replacing any previous one
    pub fn register(&self, pe_type: impl Into<String>, factory: Arc<dyn PeFactory>) {
        let pe_type = pe_type.into();
        debug!(pe_type = %pe_type, "registered PE factory");
        self.factories.write().insert(pe_type, factory);
    }

    /// Register a closure building instances of `pe_type` from their key
    pub fn register_fn<F>(&self, pe_type: impl Into<String>, factory: F)
    where
        F: Fn(&[u8]) -> std::result::Result<Box<dyn ProcessingElement>, PeError>
            + Send
            + Sync
            + 'static,
    {
        self.register(pe_type, Arc::new(FnFactory(factory)));
    }

    /// Coordinator gating this registry's instances
    pub fn coordinator(&self) -> &Arc<CheckpointingCoordinator> {
        &self.coordinator
    }

    /// Existing instance for (type, key), if any
    pub fn get(&self, pe_type: &str, key: &[u8]) -> Option<Arc<PeInstance>> {
        self.instances
            .read()
            .get(pe_type)
            .and_then(|by_key| by_key.get(key))
            .cloned()
    }

    /// The single instance for (type, key), created on first use
    pub fn get_or_create(
        &self,
        pe_type: &str,
        key: &[u8],
    ) -> std::result::Result<Arc<PeInstance>, RegistryError> {
        if let Some(instance) = self.get(pe_type, key) {
            return Ok(instance);
        }

        let factory = self
            .factories
            .read()
            .get(pe_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(pe_type.to_owned()))?;

        let mut instances = self.instances.write();
        if let Some(existing) = instances.get(pe_type).and_then(|by_key| by_key.get(key)) {
            return Ok(Arc::clone(existing));
        }

        let failed = |e: PeError| RegistryError::FactoryFailed {
            pe_type: pe_type.to_owned(),
            key: display_key(key),
            reason: e.to_string(),
        };
        let mut pe = factory.create(pe_type, key).map_err(failed)?;
        self.restore(pe_type, key, pe.as_mut());
        pe.on_create().map_err(failed)?;

        let pe_type: Arc<str> = Arc::from(pe_type);
        let instance = Arc::new(PeInstance {
            id: InstanceId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            pe_type: Arc::clone(&pe_type),
            key: key.to_vec(),
            gate: Mutex::new(()),
            pe: Mutex::new(pe),
            last_access_ms: AtomicU64::new(self.now_ms()),
            dirty: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        instances
            .entry(pe_type)
            .or_default()
            .insert(key.to_vec(), Arc::clone(&instance));

        debug!(instance = %instance.id, pe_type = %instance.pe_type, key = %display_key(key), "created PE instance");
        Ok(instance)
    }

    /// Deliver `event` to the (type, key) instance.
    ///
    /// Returns the events the PE emitted. A factory failure is returned as a
    /// [`RegistryError`] and the event is not delivered.
    pub fn dispatch(&self, pe_type: &str, key: &[u8], event: &Event) -> Result<Vec<Emission>> {
        loop {
            let instance = self.get_or_create(pe_type, key)?;
            if let Some(emissions) = instance.process(&self.coordinator, event, self.now_ms())? {
                return Ok(emissions);
            }
            // Evicted between lookup and processing; a fresh instance takes over.
            debug!(instance = %instance.id, "instance removed during dispatch, retrying");
        }
    }

    /// Remove the (type, key) instance and run its removal hook.
    ///
    /// Waits for any processing or snapshot in progress on the instance.
    pub fn remove(&self, pe_type: &str, key: &[u8]) -> bool {
        let removed = {
            let mut instances = self.instances.write();
            instances
                .get_mut(pe_type)
                .and_then(|by_key| by_key.remove(key))
        };
        match removed {
            Some(instance) => {
                instance.finalize_removal();
                debug!(instance = %instance.id, "removed PE instance");
                true
            }
            None => false,
        }
    }

    /// Remove every instance idle for at least `max_idle`; returns how many
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = self.now_ms();
        let max_idle_ms = max_idle.as_millis() as u64;

        let evicted: Vec<Arc<PeInstance>> = {
            let mut instances = self.instances.write();
            let mut evicted = Vec::new();
            for by_key in instances.values_mut() {
                by_key.retain(|_, instance| {
                    let idle = now.saturating_sub(instance.last_access_ms.load(Ordering::Relaxed));
                    if idle >= max_idle_ms {
                        evicted.push(Arc::clone(instance));
                        false
                    } else {
                        true
                    }
                });
            }
            evicted
        };

        for instance in &evicted {
            instance.finalize_removal();
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted idle PE instances");
        }
        evicted.len()
    }

    /// Snapshot of all live instances
    pub fn instances(&self) -> Vec<Arc<PeInstance>> {
        self.instances
            .read()
            .values()
            .flat_map(|by_key| by_key.values().cloned())
            .collect()
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.instances.read().values().map(|by_key| by_key.len()).sum()
    }

    /// Whether there are no live instances
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn restore(&self, pe_type: &str, key: &[u8], pe: &mut dyn ProcessingElement) {
        match self.storage.fetch(pe_type, key) {
            Ok(Some(bytes)) => match pe.restore(&bytes) {
                Ok(()) => debug!(pe_type, key = %display_key(key), "restored PE state from checkpoint"),
                Err(e) => warn!(pe_type, key = %display_key(key), error = %e, "checkpoint restore failed, starting fresh"),
            },
            Ok(None) => {}
            Err(e) => warn!(pe_type, key = %display_key(key), error = %e, "checkpoint fetch failed, starting fresh"),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{MemoryStorage, NoOpStorage};
    use std::sync::Barrier;
    use std::thread;

    struct Tally {
        total: i64,
        removed: Arc<AtomicU64>,
    }

    impl ProcessingElement for Tally {
        fn process(&mut self, event: &Event, ctx: &mut ProcessContext<'_>) -> std::result::Result<(), PeError> {
            self.total += event.get_int("n").unwrap_or(0);
            ctx.emit("totals", Event::builder(ctx.key().to_vec()).field("total", self.total).build());
            Ok(())
        }

        fn snapshot(&self) -> std::result::Result<Option<Vec<u8>>, PeError> {
            Ok(Some(self.total.to_be_bytes().to_vec()))
        }

        fn restore(&mut self, snapshot: &[u8]) -> std::result::Result<(), PeError> {
            let bytes: [u8; 8] = snapshot.try_into().map_err(|_| "bad snapshot length")?;
            self.total = i64::from_be_bytes(bytes);
            Ok(())
        }

        fn on_remove(&mut self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry_with(storage: Arc<dyn CheckpointStorage>) -> (PeRegistry, Arc<AtomicU64>, Arc<AtomicU64>) {
        let coordinator = Arc::new(CheckpointingCoordinator::new(Duration::from_secs(1)));
        let registry = PeRegistry::new(coordinator, storage);
        let created = Arc::new(AtomicU64::new(0));
        let removed = Arc::new(AtomicU64::new(0));
        let (c, r) = (Arc::clone(&created), Arc::clone(&removed));
        registry.register_fn("tally", move |_key| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Tally {
                total: 0,
                removed: Arc::clone(&r),
            }))
        });
        (registry, created, removed)
    }

    fn n(value: i64) -> Event {
        Event::builder("k").field("n", value).build()
    }

    #[test]
    fn test_dispatch_accumulates_and_emits() {
        let (registry, created, _) = registry_with(Arc::new(NoOpStorage));
        registry.dispatch("tally", b"a", &n(2)).unwrap();
        let emissions = registry.dispatch("tally", b"a", &n(3)).unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].event.get_int("total"), Some(5));
        assert!(registry.get("tally", b"a").unwrap().is_dirty());
        assert!(!registry.coordinator().is_processing(registry.get("tally", b"a").unwrap().id()));
    }

    #[test]
    fn test_unknown_type_is_registry_error() {
        let (registry, _, _) = registry_with(Arc::new(NoOpStorage));
        let err = registry.dispatch("missing", b"a", &n(1)).unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownType(_))));
    }

    #[test]
    fn test_factory_failure_propagates() {
        let (registry, _, _) = registry_with(Arc::new(NoOpStorage));
        registry.register_fn("broken", |_key| Err("no capacity".into()));
        match registry.dispatch("broken", b"a", &n(1)) {
            Err(Error::Registry(RegistryError::FactoryFailed { reason, .. })) => {
                assert_eq!(reason, "no capacity");
            }
            other => panic!("expected factory failure, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_first_use_creates_one_instance() {
        let (registry, created, _) = registry_with(Arc::new(NoOpStorage));
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("tally", b"shared").unwrap().id()
                })
            })
            .collect();
        let ids: Vec<InstanceId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_runs_hook_and_next_dispatch_recreates() {
        let (registry, created, removed) = registry_with(Arc::new(NoOpStorage));
        registry.dispatch("tally", b"a", &n(4)).unwrap();
        let old = registry.get("tally", b"a").unwrap();

        assert!(registry.remove("tally", b"a"));
        assert!(!registry.remove("tally", b"a"));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(old.is_removed());

        let emissions = registry.dispatch("tally", b"a", &n(1)).unwrap();
        assert_eq!(emissions[0].event.get_int("total"), Some(1));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_ne!(registry.get("tally", b"a").unwrap().id(), old.id());
    }

    #[test]
    fn test_evict_idle() {
        let (registry, _, removed) = registry_with(Arc::new(NoOpStorage));
        registry.dispatch("tally", b"a", &n(1)).unwrap();
        registry.dispatch("tally", b"b", &n(1)).unwrap();

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)), 0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.evict_idle(Duration::from_millis(10)), 2);
        assert_eq!(removed.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_new_instance_restores_checkpoint() {
        let storage = Arc::new(MemoryStorage::new());
        storage.save("tally", b"a", &40i64.to_be_bytes()).unwrap();
        let (registry, _, _) = registry_with(storage);

        let emissions = registry.dispatch("tally", b"a", &n(2)).unwrap();
        assert_eq!(emissions[0].event.get_int("total"), Some(42));
    }

    #[test]
    fn test_snapshot_clears_dirty() {
        let (registry, _, _) = registry_with(Arc::new(NoOpStorage));
        registry.dispatch("tally", b"a", &n(7)).unwrap();
        let instance = registry.get("tally", b"a").unwrap();

        let bytes = instance.snapshot().unwrap().unwrap();
        assert_eq!(bytes, 7i64.to_be_bytes().to_vec());
        assert!(!instance.is_dirty());
    }
}
