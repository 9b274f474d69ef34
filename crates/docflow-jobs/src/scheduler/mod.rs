//! Schedulers decide where and when jobs run.
//!
//! Three implementations share one contract:
//!
//! | Scheduler | Execution | Suited for |
//! |-----------|-----------|------------|
//! | [`PoolScheduler`] | N worker threads, chunked dispatch | CPU-heavy stages |
//! | [`AsyncScheduler`] | one thread, bounded cooperative tasks | I/O-heavy stages |
//! | [`DistributedScheduler`] | durable queue, remote workers | scale-out |
//!
//! ## Cancellation
//!
//! `cancel` means "no new work": jobs not yet dispatched stay `Pending` and
//! are never run. Jobs already executing are allowed to finish (pool,
//! cooperative) or are left to the remote workers that hold them
//! (distributed, whose unclaimed messages are purged from the queue).
//! Nothing in flight is interrupted.

mod cooperative;
mod distributed;
mod pool;

pub use cooperative::AsyncScheduler;
pub use distributed::DistributedScheduler;
pub use pool::PoolScheduler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use docflow_core::{Job, ProgressSnapshot, Result, Strategy};

/// Common scheduler contract.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// Accept jobs for dispatch. Returns how many were accepted. Does not
    /// wait for them to run.
    async fn submit(&self, batch_id: Uuid, jobs: &[Job]) -> Result<usize>;

    /// Stop dispatching new jobs of the batch.
    async fn cancel(&self, batch_id: Uuid) -> Result<()>;

    async fn progress(&self, batch_id: Uuid) -> Result<ProgressSnapshot>;

    /// Cancelled and nothing of the batch is still executing here.
    fn is_settled(&self, batch_id: Uuid) -> bool;

    /// Drop per-batch bookkeeping once the batch is no longer tracked.
    /// Returns `false`, keeping the state, while the scheduler still holds
    /// queued or running work for the batch.
    fn forget(&self, batch_id: Uuid) -> bool;

    /// Interval used by [`Scheduler::wait_for_batch`].
    fn poll_interval(&self) -> Duration;

    /// Wait until the batch completes or, once cancelled, settles.
    async fn wait_for_batch(&self, batch_id: Uuid) -> Result<ProgressSnapshot> {
        loop {
            let snapshot = self.progress(batch_id).await?;
            if snapshot.is_complete() || self.is_settled(batch_id) {
                return Ok(snapshot);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Stop workers. Jobs already running finish first.
    async fn shutdown(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Gate {
    cancelled: bool,
    in_flight: usize,
    /// Admitted jobs not yet passed through `try_begin`.
    queued: usize,
}

impl Gate {
    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.queued == 0
    }
}

/// Per-batch cancellation flag, queued and in-flight counters.
///
/// Checking for cancellation and counting a job as in flight happen under
/// one lock, so a cancel can never miss a job that was about to start.
#[derive(Clone, Default)]
pub struct BatchControl {
    gates: Arc<DashMap<Uuid, Gate>>,
}

impl BatchControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call cancelled the batch.
    pub fn cancel(&self, batch_id: Uuid) -> bool {
        let mut gate = self.gates.entry(batch_id).or_default();
        !std::mem::replace(&mut gate.cancelled, true)
    }

    pub fn is_cancelled(&self, batch_id: Uuid) -> bool {
        self.gates.get(&batch_id).is_some_and(|g| g.cancelled)
    }

    /// Record `n` jobs handed to the scheduler but not yet started.
    pub fn admit(&self, batch_id: Uuid, n: usize) {
        self.gates.entry(batch_id).or_default().queued += n;
    }

    /// Take back `n` admitted jobs that will never reach `try_begin`.
    pub fn release(&self, batch_id: Uuid, n: usize) {
        if let Some(mut gate) = self.gates.get_mut(&batch_id) {
            gate.queued = gate.queued.saturating_sub(n);
        }
    }

    /// Count a job as in flight unless the batch is cancelled. Either way
    /// the job no longer counts as queued.
    pub fn try_begin(&self, batch_id: Uuid) -> Option<InFlightToken> {
        let mut gate = self.gates.entry(batch_id).or_default();
        gate.queued = gate.queued.saturating_sub(1);
        if gate.cancelled {
            return None;
        }
        gate.in_flight += 1;
        Some(InFlightToken {
            control: self.clone(),
            batch_id,
        })
    }

    /// Count a job as in flight even if the batch is cancelled. Used for
    /// jobs that were already running when their worker died.
    pub fn begin_resumed(&self, batch_id: Uuid) -> InFlightToken {
        self.gates.entry(batch_id).or_default().in_flight += 1;
        InFlightToken {
            control: self.clone(),
            batch_id,
        }
    }

    pub fn in_flight(&self, batch_id: Uuid) -> usize {
        self.gates.get(&batch_id).map_or(0, |g| g.in_flight)
    }

    pub fn queued(&self, batch_id: Uuid) -> usize {
        self.gates.get(&batch_id).map_or(0, |g| g.queued)
    }

    /// Remove the batch's gate if nothing is queued or running. Returns
    /// `true` when no gate remains.
    pub fn forget(&self, batch_id: Uuid) -> bool {
        match self.gates.entry(batch_id) {
            Entry::Occupied(gate) if gate.get().is_idle() => {
                gate.remove();
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(_) => true,
        }
    }

    /// Batches with a gate.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    fn end(&self, batch_id: Uuid) {
        if let Some(mut gate) = self.gates.get_mut(&batch_id) {
            gate.in_flight = gate.in_flight.saturating_sub(1);
        }
    }
}

/// Decrements the batch's in-flight count when dropped, panics included.
pub struct InFlightToken {
    control: BatchControl,
    batch_id: Uuid,
}

impl Drop for InFlightToken {
    fn drop(&mut self) {
        self.control.end(self.batch_id);
    }
}
