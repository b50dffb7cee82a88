//! Key-affine worker pool
//!
//! The pool owns a fixed set of workers and routes each message to one of
//! them by hashing its key, so all messages for a key are handled in order by
//! the same thread. [`DispatchPool`] is the pool the node runs PE events on.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::message::Envelope;
use crate::config::default_workers;
use crate::partition::compute_hash;
use crate::pe::display_key;
use crate::registry::PeRegistry;
use crate::router::Router;
use crate::worker::{spawn, Worker, WorkerConfig, WorkerHandle};
use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{trace, warn};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers in the pool
    pub num_workers: usize,

    /// Configuration template for workers
    pub worker_config: WorkerConfig,

    /// Whether to enable CPU affinity pinning
    pub enable_cpu_affinity: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_workers(),
            worker_config: WorkerConfig::default(),
            enable_cpu_affinity: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers
    pub fn with_num_workers(mut self, num: usize) -> Self {
        self.num_workers = num;
        self
    }

    /// Set the worker configuration template
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Enable CPU affinity pinning
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.enable_cpu_affinity = enable;
        self
    }
}

/// A pool of workers that share no state
pub struct WorkerPool<M>
where
    M: Send + 'static,
{
    /// Worker handles, indexed by key hash
    workers: RwLock<Vec<WorkerHandle<M>>>,
}

impl<M> WorkerPool<M>
where
    M: Send + 'static,
{
    /// Create a new worker pool with a factory function
    pub fn new<W, F>(config: PoolConfig, mut factory: F) -> Result<Self>
    where
        W: Worker<Message = M>,
        F: FnMut(usize) -> W,
    {
        let mut workers = Vec::with_capacity(config.num_workers);
        let cores = default_workers();

        for i in 0..config.num_workers {
            let mut worker_config = config.worker_config.clone();

            if config.enable_cpu_affinity {
                worker_config.cpu_affinity = Some(i % cores);
            }

            if worker_config.name.is_none() {
                worker_config = worker_config.with_name(format!("dispatch-{}", i));
            }

            let worker = factory(i);
            workers.push(spawn(worker, worker_config)?);
        }

        Ok(Self {
            workers: RwLock::new(workers),
        })
    }

    /// Send a message to the worker owning `key`.
    ///
    /// Blocks while that worker's mailbox is full.
    pub fn send_partitioned<K: Hash + ?Sized>(&self, key: &K, message: M) -> Result<()> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return Err(Error::WorkerNotRunning);
        }

        let index = (compute_hash(key) % workers.len() as u64) as usize;
        workers[index].send(message)
    }

    /// Get the number of workers in the pool
    pub fn num_workers(&self) -> usize {
        self.workers.read().len()
    }

    /// Messages queued across all mailboxes
    pub fn queued(&self) -> usize {
        self.workers.read().iter().map(|w| w.queue_len()).sum()
    }

    /// Stop all workers after they drain their mailboxes.
    ///
    /// Returns the first failure; every worker is stopped regardless.
    pub fn stop_all(&self) -> Result<()> {
        let mut workers = self.workers.write();
        let mut first_error = None;

        for worker in workers.iter_mut() {
            if let Err(e) = worker.stop() {
                warn!(worker = worker.id(), error = %e, "failed to stop worker");
                first_error.get_or_insert(e);
            }
        }

        workers.clear();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<M> Drop for WorkerPool<M>
where
    M: Send + 'static,
{
    fn drop(&mut self) {
        // Best effort to stop all workers
        let _ = self.stop_all();
    }
}

/// One event bound for one PE type
#[derive(Debug, Clone)]
pub struct DispatchTask {
    /// PE type subscribed to the event's stream
    pub pe_type: Arc<str>,
    /// The event; shared when several PE types subscribe to a stream
    pub event: Arc<Event>,
}

impl DispatchTask {
    /// Bundle an event with its target PE type
    pub fn new(pe_type: Arc<str>, event: Arc<Event>) -> Self {
        Self { pe_type, event }
    }

    /// Key the task is partitioned on
    pub fn key(&self) -> &[u8] {
        self.event.key()
    }
}

/// Runs dispatch tasks against the registry and routes what PEs emit
pub struct DispatchWorker {
    registry: Arc<PeRegistry>,
    router: Arc<Router>,
}

impl DispatchWorker {
    /// Create a worker bound to `registry` and `router`
    pub fn new(registry: Arc<PeRegistry>, router: Arc<Router>) -> Self {
        Self { registry, router }
    }
}

impl Worker for DispatchWorker {
    type State = ();
    type Message = DispatchTask;

    fn init(&mut self) -> Result<Self::State> {
        Ok(())
    }

    fn handle_message(&mut self, _state: &mut Self::State, message: Envelope<Self::Message>) -> Result<()> {
        let queued = message.queued_for();
        let task = message.payload;
        trace!(pe_type = %task.pe_type, ?queued, "dispatching event");

        let emissions = match self.registry.dispatch(&task.pe_type, task.key(), &task.event) {
            Ok(emissions) => emissions,
            Err(e) => {
                warn!(
                    pe_type = %task.pe_type,
                    key = %display_key(task.key()),
                    error = %e,
                    "event dropped"
                );
                return Ok(());
            }
        };

        for emission in emissions {
            if let Err(e) = self.router.route(&emission.stream, &emission.event) {
                warn!(stream = %emission.stream, error = %e, "failed to route emitted event");
            }
        }
        Ok(())
    }
}

/// The pool PE events run on
pub type DispatchPool = WorkerPool<DispatchTask>;
