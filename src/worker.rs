//! Worker threads
//!
//! A worker is one OS thread with its own state and a bounded mailbox. It
//! handles its messages strictly one at a time, in arrival order.

use crate::channel::{Channel, Sender};
use crate::error::{Error, Result};
use crate::message::{ControlMessage, Envelope};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Unique identifier for a worker
pub type WorkerId = u64;

/// Global worker ID counter
static WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How long an idle worker waits in its mailbox before checking for a stop
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker name (used for the thread name)
    pub name: Option<String>,

    /// CPU core to pin this worker to (None = no pinning)
    pub cpu_affinity: Option<usize>,

    /// Mailbox capacity
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            cpu_affinity: None,
            queue_capacity: 1024,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Worker handle for managing a running worker
pub struct WorkerHandle<M> {
    /// Unique worker ID
    id: WorkerId,

    /// Sender for messages to the worker
    message_tx: Sender<Envelope<M>>,

    /// Sender for control messages
    control_tx: Sender<ControlMessage>,

    /// Thread handle
    thread_handle: Option<JoinHandle<Result<()>>>,

    /// Running state
    running: Arc<AtomicBool>,
}

impl<M> WorkerHandle<M>
where
    M: Send + 'static,
{
    /// Get the worker ID
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Send a message to the worker, blocking while its mailbox is full
    pub fn send(&self, message: M) -> Result<()> {
        self.message_tx.send(Envelope::new(message))
    }

    /// Messages waiting in the mailbox
    pub fn queue_len(&self) -> usize {
        self.message_tx.len()
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the worker after it drains its mailbox, and wait for it
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::WorkerNotRunning);
        }

        self.control_tx.send(ControlMessage::Stop { drain: true })?;

        // Wait for worker to finish
        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| Error::WorkerPanicked("Worker thread panicked".to_string()))??;
        }

        Ok(())
    }
}

/// Trait for worker message handlers
pub trait Worker: Send + Sized + 'static {
    /// The type of state this worker maintains
    type State: Send + 'static;

    /// The type of messages this worker processes
    type Message: Send + 'static;

    /// Initialize the worker state
    fn init(&mut self) -> Result<Self::State>;

    /// Handle an incoming message
    fn handle_message(&mut self, state: &mut Self::State, message: Envelope<Self::Message>) -> Result<()>;

    /// Called when the worker is about to shutdown (optional)
    fn shutdown(&mut self, _state: Self::State) -> Result<()> {
        Ok(())
    }
}

/// Spawn a worker with the given configuration
pub fn spawn<W>(mut worker: W, config: WorkerConfig) -> Result<WorkerHandle<W::Message>>
where
    W: Worker,
{
    let id = WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let (message_tx, message_rx) = Channel::mailbox(config.queue_capacity);
    let (control_tx, control_rx) = Channel::mailbox(16);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    let name = config.name.unwrap_or_else(|| format!("worker-{}", id));
    let cpu_affinity = config.cpu_affinity;

    let thread_handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Some(cpu) = cpu_affinity {
                if let Some(core_ids) = core_affinity::get_core_ids() {
                    if cpu < core_ids.len() && !core_affinity::set_for_current(core_ids[cpu]) {
                        warn!(worker = id, cpu, "could not pin worker to core");
                    }
                }
            }

            let mut state = match worker.init() {
                Ok(state) => state,
                Err(e) => {
                    running_clone.store(false, Ordering::Release);
                    return Err(e);
                }
            };

            loop {
                if let Ok(ControlMessage::Stop { drain }) = control_rx.try_recv() {
                    if drain {
                        while let Ok(envelope) = message_rx.try_recv() {
                            if let Err(e) = worker.handle_message(&mut state, envelope) {
                                warn!(worker = id, error = %e, "error handling message");
                            }
                        }
                    }
                    break;
                }

                match message_rx.recv_timeout(IDLE_POLL) {
                    Ok(envelope) => {
                        if let Err(e) = worker.handle_message(&mut state, envelope) {
                            warn!(worker = id, error = %e, "error handling message");
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(_) => break,
                }
            }

            running_clone.store(false, Ordering::Release);
            debug!(worker = id, "worker stopped");
            worker.shutdown(state)
        })
        .map_err(Error::Spawn)?;

    Ok(WorkerHandle {
        id,
        message_tx,
        control_tx,
        thread_handle: Some(thread_handle),
        running,
    })
}
