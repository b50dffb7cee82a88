//! A processing node
//!
//! A node wires the runtime together:
//!
//! ```text
//!  network ─> TcpListener ─> handoff queue ─> receive threads
//!                                                 │ decode, look up subscribers
//!                                                 ▼
//!                      DispatchPool (one worker per key) ─> PeRegistry
//!                                                 │ emissions
//!                                                 ▼
//!                                Router ─> TcpEmitter ─> network
//! ```
//!
//! A checkpoint trigger thread snapshots dirty instances in the background
//! when an interval is configured.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use tracing::{debug, info, warn};

use crate::assignment::{Assignment, AssignmentView};
use crate::checkpoint::{CheckpointScheduler, CheckpointStorage, Checkpointer, NoOpStorage};
use crate::codec::{self, SerializerDeserializer};
use crate::config::RuntimeConfig;
use crate::coordinator::CheckpointingCoordinator;
use crate::emitter::{Emitter, EmitterStats, TcpEmitter};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::listener::{Listener, ListenerStats, TcpListener};
use crate::partition::DefaultHasher;
use crate::pe::{FnFactory, PeError, PeFactory, ProcessingElement};
use crate::pool::{DispatchPool, DispatchTask, DispatchWorker, PoolConfig, WorkerPool};
use crate::registry::PeRegistry;
use crate::router::Router;
use crate::worker::WorkerConfig;

type Subscriptions = AHashMap<String, Vec<Arc<str>>>;

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: RuntimeConfig,
    bind_addr: String,
    assignment: Option<Arc<dyn Assignment>>,
    storage: Arc<dyn CheckpointStorage>,
    factories: Vec<(String, Arc<dyn PeFactory>)>,
    subscriptions: Subscriptions,
}

impl NodeBuilder {
    /// Start from `config`, listening on an ephemeral localhost port
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            bind_addr: "127.0.0.1:0".to_owned(),
            assignment: None,
            storage: Arc::new(NoOpStorage),
            factories: Vec::new(),
            subscriptions: AHashMap::new(),
        }
    }

    /// Listen address
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Partition ownership view (defaults to an empty one)
    pub fn assignment(mut self, assignment: Arc<dyn Assignment>) -> Self {
        self.assignment = Some(assignment);
        self
    }

    /// Checkpoint backend (defaults to [`NoOpStorage`])
    pub fn storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Register a PE type
    pub fn pe(mut self, pe_type: impl Into<String>, factory: Arc<dyn PeFactory>) -> Self {
        self.factories.push((pe_type.into(), factory));
        self
    }

    /// Register a PE type built by a closure over the key
    pub fn pe_fn<F>(self, pe_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&[u8]) -> std::result::Result<Box<dyn ProcessingElement>, PeError>
            + Send
            + Sync
            + 'static,
    {
        self.pe(pe_type, Arc::new(FnFactory(factory)))
    }

    /// Deliver events of `stream` to `pe_type`
    pub fn subscribe(mut self, stream: impl Into<String>, pe_type: impl Into<String>) -> Self {
        let pe_type: Arc<str> = Arc::from(pe_type.into());
        let subscribers = self.subscriptions.entry(stream.into()).or_default();
        if !subscribers.contains(&pe_type) {
            subscribers.push(pe_type);
        }
        self
    }

    /// Validate the configuration, bind the listener and start every thread
    pub fn start(self) -> Result<Node> {
        let config = self.config;
        config.validate()?;

        let codec = codec::from_kind(config.codec);
        let coordinator = Arc::new(
            CheckpointingCoordinator::new(config.max_coordinator_wait())
                .with_max_retries(config.max_acquire_retries),
        );

        let registry = Arc::new(PeRegistry::new(
            Arc::clone(&coordinator),
            Arc::clone(&self.storage),
        ));
        for (pe_type, factory) in self.factories {
            registry.register(pe_type, factory);
        }

        let assignment = self
            .assignment
            .unwrap_or_else(|| Arc::new(AssignmentView::default()) as Arc<dyn Assignment>);
        let hasher = Arc::new(DefaultHasher::new(config.partition_count)?);
        let emitter = Arc::new(TcpEmitter::new(assignment, Arc::clone(&codec), &config));
        let router = Arc::new(Router::new(
            hasher,
            Arc::clone(&emitter) as Arc<dyn Emitter>,
            Arc::clone(&codec),
        ));

        let pool_config = PoolConfig::new()
            .with_num_workers(config.num_workers)
            .with_worker_config(WorkerConfig::new().with_queue_capacity(config.worker_queue_capacity))
            .with_cpu_affinity(config.enable_cpu_affinity);
        let pool: Arc<DispatchPool> = Arc::new(WorkerPool::new(pool_config, |_| {
            DispatchWorker::new(Arc::clone(&registry), Arc::clone(&router))
        })?);

        let checkpointer = Arc::new(Checkpointer::new(Arc::clone(&coordinator), self.storage));
        let scheduler = match config.checkpoint_interval() {
            Some(interval) => Some(CheckpointScheduler::spawn(
                Arc::clone(&checkpointer),
                Arc::clone(&registry),
                interval,
            )?),
            None => None,
        };

        let listener = Arc::new(TcpListener::bind(&self.bind_addr, &config)?);
        let subscriptions = Arc::new(self.subscriptions);

        let mut receivers = Vec::with_capacity(config.receive_threads);
        for i in 0..config.receive_threads {
            let receiver = ReceiveLoop {
                listener: Arc::clone(&listener),
                codec: Arc::clone(&codec),
                subscriptions: Arc::clone(&subscriptions),
                pool: Arc::clone(&pool),
            };
            let handle = thread::Builder::new()
                .name(format!("receive-{}", i))
                .spawn(move || receiver.run())
                .map_err(Error::Spawn);
            match handle {
                Ok(handle) => receivers.push(handle),
                Err(e) => {
                    listener.close();
                    return Err(e);
                }
            }
        }

        info!(
            address = %listener.local_addr(),
            workers = config.num_workers,
            partitions = config.partition_count,
            "node started"
        );

        Ok(Node {
            listener,
            receivers,
            pool,
            registry,
            checkpointer,
            scheduler,
            router,
            emitter,
            stopped: false,
        })
    }
}

/// Pulls payloads off the listener and submits them to the pool
struct ReceiveLoop {
    listener: Arc<TcpListener>,
    codec: Arc<dyn SerializerDeserializer>,
    subscriptions: Arc<Subscriptions>,
    pool: Arc<DispatchPool>,
}

impl ReceiveLoop {
    fn run(self) {
        while let Some(payload) = self.listener.recv() {
            self.deliver(&payload);
        }
        debug!("receive thread stopped");
    }

    fn deliver(&self, payload: &[u8]) {
        let message = match self.codec.decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable message dropped");
                return;
            }
        };

        let Some(subscribers) = self.subscriptions.get(&message.stream_name) else {
            debug!(%message, "no subscribers for stream");
            return;
        };

        let event = match self.codec.decode_event(&message.payload) {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(%message, error = %e, "undecodable event dropped");
                return;
            }
        };

        for pe_type in subscribers {
            let task = DispatchTask::new(Arc::clone(pe_type), Arc::clone(&event));
            if let Err(e) = self.pool.send_partitioned(event.key(), task) {
                warn!(%message, pe_type = %pe_type, error = %e, "could not dispatch event");
            }
        }
    }
}

/// A running node
pub struct Node {
    listener: Arc<TcpListener>,
    receivers: Vec<JoinHandle<()>>,
    pool: Arc<DispatchPool>,
    registry: Arc<PeRegistry>,
    checkpointer: Arc<Checkpointer>,
    scheduler: Option<CheckpointScheduler>,
    router: Arc<Router>,
    emitter: Arc<TcpEmitter>,
    stopped: bool,
}

impl Node {
    /// Start building a node
    pub fn builder(config: RuntimeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Inject `event` on `stream`; returns the partition it was sent to
    pub fn emit(&self, stream: &str, event: &Event) -> Result<u32> {
        self.router.route(stream, event)
    }

    /// Checkpoint every dirty instance now; returns how many were saved
    pub fn checkpoint_now(&self) -> usize {
        self.checkpointer.checkpoint_dirty(&self.registry)
    }

    /// The node's PE instances
    pub fn registry(&self) -> &Arc<PeRegistry> {
        &self.registry
    }

    /// Inbound counters
    pub fn listener_stats(&self) -> &ListenerStats {
        self.listener.stats()
    }

    /// Outbound counters
    pub fn emitter_stats(&self) -> &EmitterStats {
        self.emitter.stats()
    }

    /// Events waiting in dispatch mailboxes
    pub fn queued(&self) -> usize {
        self.pool.queued()
    }

    /// Stop the node.
    ///
    /// Inbound traffic stops first; events already queued for dispatch are
    /// processed before the workers exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.listener.close();
        for receiver in self.receivers.drain(..) {
            if receiver.join().is_err() {
                warn!("receive thread panicked");
            }
        }

        let drained = self.pool.stop_all();

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
            let saved = self.checkpoint_now();
            debug!(saved, "final checkpoint round");
        }

        self.emitter.close();
        info!(address = %self.listener.local_addr(), "node stopped");
        drained
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "error stopping node");
        }
    }
}
