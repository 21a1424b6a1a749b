//! Priority dispatcher with a fixed worker pool.
//!
//! Jobs wait in a binary heap ordered by `(priority desc, sequence asc)`.
//! Exactly `workers` tokio tasks pull from the heap, so at most that many jobs
//! run at once. A job id may be queued or active at most once.
//!
//! Each running job receives a [`Slot`]. Dropping the slot takes the id out of
//! the active set; jobs drop it before publishing a settled status so a caller
//! that reacts to that status can submit the same id again straight away.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::record::{Priority, TransferId};

/// Unit of work accepted by the [`Scheduler`].
pub trait Job: Send + 'static {
    /// Identity used for duplicate detection and removal.
    fn id(&self) -> TransferId;

    /// Dispatch priority.
    fn priority(&self) -> Priority;

    /// Runs the job on a worker. `slot` marks the id active until dropped.
    fn run(self, slot: Slot) -> impl Future<Output = ()> + Send;
}

/// Error returned by [`Scheduler::submit`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The id is already queued or running.
    #[error("transfer {id} is already queued or running")]
    Duplicate {
        /// The rejected id.
        id: TransferId,
    },

    /// The scheduler no longer accepts work.
    #[error("scheduler has shut down")]
    ShutDown,
}

struct Entry<J> {
    priority: Priority,
    sequence: u64,
    job: J,
}

impl<J> PartialEq for Entry<J> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<J> Eq for Entry<J> {}

impl<J> PartialOrd for Entry<J> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<J> Ord for Entry<J> {
    // Max-heap: higher priority first, then the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Queue<J> {
    heap: BinaryHeap<Entry<J>>,
    queued: HashSet<TransferId>,
    closed: bool,
}

#[derive(Default)]
struct ActiveSet(Mutex<HashSet<TransferId>>);

impl ActiveSet {
    fn lock(&self) -> MutexGuard<'_, HashSet<TransferId>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a job id as active; released on drop.
pub struct Slot {
    id: TransferId,
    active: Arc<ActiveSet>,
}

impl Slot {
    /// Id this slot belongs to.
    #[must_use]
    pub fn id(&self) -> TransferId {
        self.id
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot").field("id", &self.id).finish()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
    }
}

struct Shared<J> {
    queue: Mutex<Queue<J>>,
    active: Arc<ActiveSet>,
    notify: Notify,
    next_sequence: AtomicU64,
}

impl<J: Job> Shared<J> {
    fn lock(&self) -> MutexGuard<'_, Queue<J>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the next job, or `None` once closed and drained.
    async fn next(&self) -> Option<(J, Slot)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the heap so a submit in between is not missed.
            notified.as_mut().enable();
            {
                let mut queue = self.lock();
                if let Some(entry) = queue.heap.pop() {
                    let id = entry.job.id();
                    queue.queued.remove(&id);
                    self.active.lock().insert(id);
                    let slot = Slot {
                        id,
                        active: Arc::clone(&self.active),
                    };
                    return Some((entry.job, slot));
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Bounded priority worker pool.
pub struct Scheduler<J: Job> {
    shared: Arc<Shared<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl<J: Job> std::fmt::Debug for Scheduler<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("queued", &self.queued_len())
            .field("active", &self.active_len())
            .finish_non_exhaustive()
    }
}

impl<J: Job> Scheduler<J> {
    /// Spawns `workers` worker tasks on `handle`.
    #[must_use]
    pub fn start(workers: usize, handle: &Handle) -> Self {
        let worker_count = workers.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                queued: HashSet::new(),
                closed: false,
            }),
            active: Arc::new(ActiveSet::default()),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(1),
        });
        let handles = (0..worker_count)
            .map(|worker| handle.spawn(worker_loop(Arc::clone(&shared), worker)))
            .collect();
        debug!(worker_count, "scheduler started");
        Self {
            shared,
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    /// Number of worker tasks.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queues `job` and returns its sequence number.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::Duplicate`] if the id is queued or active,
    /// [`ScheduleError::ShutDown`] after [`close`](Self::close).
    pub fn submit(&self, job: J) -> Result<u64, ScheduleError> {
        let id = job.id();
        let sequence = {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(ScheduleError::ShutDown);
            }
            if queue.queued.contains(&id) || self.shared.active.lock().contains(&id) {
                return Err(ScheduleError::Duplicate { id });
            }
            let sequence = self.shared.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
            queue.queued.insert(id);
            queue.heap.push(Entry {
                priority: job.priority(),
                sequence,
                job,
            });
            sequence
        };
        self.shared.notify.notify_one();
        debug!(transfer_id = %id, sequence, "job queued");
        Ok(sequence)
    }

    /// Withdraws a job that has not started yet.
    pub fn remove(&self, id: TransferId) -> Option<J> {
        let mut queue = self.shared.lock();
        if !queue.queued.remove(&id) {
            return None;
        }
        let mut entries = std::mem::take(&mut queue.heap).into_vec();
        let removed = entries
            .iter()
            .position(|entry| entry.job.id() == id)
            .map(|index| entries.swap_remove(index).job);
        queue.heap = BinaryHeap::from(entries);
        debug!(transfer_id = %id, "job withdrawn from queue");
        removed
    }

    /// Whether `id` is waiting in the queue.
    #[must_use]
    pub fn is_queued(&self, id: TransferId) -> bool {
        self.shared.lock().queued.contains(&id)
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// Jobs currently holding a slot.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.shared.active.lock().len()
    }

    /// Stops accepting work and returns the jobs that never started.
    ///
    /// Running jobs are not interrupted; callers signal them separately.
    /// Calling this again returns an empty list.
    pub fn close(&self) -> Vec<J> {
        let drained: Vec<J> = {
            let mut queue = self.shared.lock();
            queue.closed = true;
            queue.queued.clear();
            std::mem::take(&mut queue.heap)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|entry| entry.job)
                .collect()
        };
        self.shared.notify.notify_waiters();
        drained
    }

    /// Waits up to `grace` for every worker task to exit. Returns whether all
    /// of them did; stragglers are aborted.
    pub async fn join(&self, grace: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if handles.is_empty() {
            return true;
        }
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_ok() {
            info!(workers = aborts.len(), "scheduler workers stopped");
            true
        } else {
            warn!(
                grace_ms = grace.as_millis(),
                "workers still running after grace period; aborting"
            );
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}

impl<J: Job> Drop for Scheduler<J> {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }
}

async fn worker_loop<J: Job>(shared: Arc<Shared<J>>, worker: usize) {
    while let Some((job, slot)) = shared.next().await {
        let id = job.id();
        debug!(worker, transfer_id = %id, "worker picked job");
        if AssertUnwindSafe(job.run(slot)).catch_unwind().await.is_err() {
            error!(worker, transfer_id = %id, "job panicked; worker continues");
        }
    }
    debug!(worker, "worker exiting");
}
