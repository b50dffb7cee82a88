//! Checkpointing coordinator
//!
//! Keeps the event-processing path and the snapshot path from touching the
//! same PE instance at the same time. A snapshot taken while an event is half
//! applied would be neither the state before nor after that event.
//!
//! The coordinator holds two permit sets: instances currently processing and
//! instances currently serializing. An instance is never in both.
//!
//! Contention is expected to be rare (any one instance is checkpointed far less
//! often than it processes events), so the uncontended path is a single lock
//! and a set insert.
//!
//! The two sides resolve a timed-out wait differently:
//!
//! - processing clears the serializing permit of that instance and proceeds,
//!   logging that the checkpoint may be inconsistent.
//! - serializing never clears a processing permit. It waits again, up to
//!   `max_retries` attempts if a cap is configured.
//!
//! Each wait is bounded by a deadline, so spurious wakeups never extend it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::error::CoordinatorTimeout;
use crate::pe::InstanceId;

#[derive(Debug, Default)]
struct PermitState {
    processing: AHashSet<InstanceId>,
    serializing: AHashSet<InstanceId>,
}

/// Counters describing contention on the coordinator
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    forced_releases: AtomicU64,
    serialization_retries: AtomicU64,
    serialization_timeouts: AtomicU64,
    release_mismatches: AtomicU64,
}

impl CoordinatorStats {
    /// Serializing permits cleared by a timed-out processing wait
    pub fn forced_releases(&self) -> u64 {
        self.forced_releases.load(Ordering::Relaxed)
    }

    /// Serialization waits that expired and were retried
    pub fn serialization_retries(&self) -> u64 {
        self.serialization_retries.load(Ordering::Relaxed)
    }

    /// Serialization acquisitions abandoned after the retry cap
    pub fn serialization_timeouts(&self) -> u64 {
        self.serialization_timeouts.load(Ordering::Relaxed)
    }

    /// Releases for an instance that did not hold the permit
    pub fn release_mismatches(&self) -> u64 {
        self.release_mismatches.load(Ordering::Relaxed)
    }
}

/// Node-wide gate between processing and serialization of PE instances
#[derive(Debug)]
pub struct CheckpointingCoordinator {
    state: Mutex<PermitState>,
    processing_finished: Condvar,
    serializing_finished: Condvar,
    max_wait: Duration,
    max_retries: Option<u32>,
    stats: CoordinatorStats,
}

impl CheckpointingCoordinator {
    /// Create a coordinator whose waits are bounded by `max_wait`.
    ///
    /// Serialization retries forever; see [`with_max_retries`](Self::with_max_retries).
    pub fn new(max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(PermitState::default()),
            processing_finished: Condvar::new(),
            serializing_finished: Condvar::new(),
            max_wait,
            max_retries: None,
            stats: CoordinatorStats::default(),
        }
    }

    /// Cap the number of waits a serialization acquisition makes
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Bound applied to each wait
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Contention counters
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Take the processing permit for `id`.
    ///
    /// Blocks while `id` is being serialized, for at most `max_wait`. If the
    /// wait expires the serializing permit is cleared and processing goes
    /// ahead.
    pub fn acquire_for_processing(&self, id: InstanceId) {
        let mut state = self.state.lock();

        if state.serializing.contains(&id) {
            trace!(instance = %id, "processing must wait for serialization to finish");
            let deadline = Instant::now() + self.max_wait;
            let released = wait_until_clear(
                &self.serializing_finished,
                &mut state,
                deadline,
                |s| s.serializing.contains(&id),
            );
            if !released {
                error!(
                    instance = %id,
                    wait_ms = self.max_wait.as_millis() as u64,
                    "could not acquire processing permit within the wait bound; \
                     proceeding anyway, checkpoint may be inconsistent"
                );
                state.serializing.remove(&id);
                self.stats.forced_releases.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !state.processing.insert(id) {
            warn!(instance = %id, "instance already holds a processing permit");
        }
    }

    /// Give back the processing permit for `id` and wake serialization waiters.
    ///
    /// Releasing a permit that is not held is logged and otherwise ignored.
    pub fn release_from_processing(&self, id: InstanceId) {
        let mut state = self.state.lock();
        if state.processing.remove(&id) {
            drop(state);
            self.processing_finished.notify_all();
        } else {
            self.stats.release_mismatches.fetch_add(1, Ordering::Relaxed);
            warn!(
                instance = %id,
                "cannot release from processing an instance that is not in processing state"
            );
        }
    }

    /// Take the serializing permit for `id`.
    ///
    /// Blocks while `id` is processing. Each expired wait is retried; the
    /// processing permit is never cleared from this side. With a retry cap,
    /// running out of attempts returns [`CoordinatorTimeout`] and the caller
    /// should skip this checkpoint.
    pub fn acquire_for_serialization(&self, id: InstanceId) -> Result<(), CoordinatorTimeout> {
        let mut state = self.state.lock();
        let mut attempts: u32 = 0;

        while state.processing.contains(&id) {
            if let Some(max) = self.max_retries {
                if attempts >= max {
                    self.stats
                        .serialization_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        instance = %id,
                        attempts,
                        "giving up serialization permit, instance still processing"
                    );
                    return Err(CoordinatorTimeout {
                        permit: "serialization",
                        instance: id.get(),
                        attempts,
                        wait: self.max_wait,
                    });
                }
            }

            trace!(instance = %id, attempts, "serialization must wait for processing to finish");
            let deadline = Instant::now() + self.max_wait;
            let released = wait_until_clear(
                &self.processing_finished,
                &mut state,
                deadline,
                |s| s.processing.contains(&id),
            );
            attempts = attempts.saturating_add(1);
            if !released {
                self.stats
                    .serialization_retries
                    .fetch_add(1, Ordering::Relaxed);
                debug!(instance = %id, attempts, "serialization wait expired, retrying");
            }
        }

        if !state.serializing.insert(id) {
            warn!(instance = %id, "instance already holds a serializing permit");
        }
        Ok(())
    }

    /// Give back the serializing permit for `id` and wake processing waiters.
    ///
    /// The permit may already be gone if a processing wait forced it out.
    pub fn release_from_serialization(&self, id: InstanceId) {
        let mut state = self.state.lock();
        if state.serializing.remove(&id) {
            drop(state);
            self.serializing_finished.notify_all();
        } else {
            debug!(instance = %id, "serializing permit already released");
        }
    }

    /// RAII form of [`acquire_for_processing`](Self::acquire_for_processing)
    pub fn processing(&self, id: InstanceId) -> ProcessingPermit<'_> {
        self.acquire_for_processing(id);
        ProcessingPermit {
            coordinator: self,
            id,
        }
    }

    /// RAII form of [`acquire_for_serialization`](Self::acquire_for_serialization)
    pub fn serialization(&self, id: InstanceId) -> Result<SerializationPermit<'_>, CoordinatorTimeout> {
        self.acquire_for_serialization(id)?;
        Ok(SerializationPermit {
            coordinator: self,
            id,
        })
    }

    /// Whether `id` holds a processing permit
    pub fn is_processing(&self, id: InstanceId) -> bool {
        self.state.lock().processing.contains(&id)
    }

    /// Whether `id` holds a serializing permit
    pub fn is_serializing(&self, id: InstanceId) -> bool {
        self.state.lock().serializing.contains(&id)
    }
}

/// Wait on `condvar` until `blocked` turns false or `deadline` passes.
///
/// Returns whether the condition cleared.
fn wait_until_clear(
    condvar: &Condvar,
    state: &mut MutexGuard<'_, PermitState>,
    deadline: Instant,
    blocked: impl Fn(&PermitState) -> bool,
) -> bool {
    while blocked(&**state) {
        if condvar.wait_until(state, deadline).timed_out() {
            return !blocked(&**state);
        }
    }
    true
}

/// Processing permit released on drop
#[derive(Debug)]
pub struct ProcessingPermit<'a> {
    coordinator: &'a CheckpointingCoordinator,
    id: InstanceId,
}

impl Drop for ProcessingPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.release_from_processing(self.id);
    }
}

/// Serializing permit released on drop
#[derive(Debug)]
pub struct SerializationPermit<'a> {
    coordinator: &'a CheckpointingCoordinator,
    id: InstanceId,
}

impl Drop for SerializationPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.release_from_serialization(self.id);
    }
}
