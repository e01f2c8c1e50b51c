//! Shared auto-flush scheduler.
//!
//! One process-wide worker drives periodic best-effort flushes for every
//! enlisted loader. The queue is ordered by next-flush deadline
//! (`last flush + auto-flush frequency`); after each tick the loader is
//! re-enqueued one period ahead. Loaders are held weakly: a dropped or
//! closed loader simply falls out of the queue.
//!
//! Enlisting bumps the loader's epoch, so stale queue entries from an
//! earlier enlist/delist cycle are recognised and dropped instead of
//! double-ticking.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::loader::LoaderInner;

/// How long the idle worker waits before re-checking for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(PartialEq, Eq)]
struct QueueEntry {
    deadline: Instant,
    loader_id: u64,
    epoch: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.loader_id.cmp(&other.loader_id))
            .then_with(|| self.epoch.cmp(&other.epoch))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerState {
    /// Enlisted loaders: id → (current epoch, loader).
    loaders: HashMap<u64, (u64, Weak<LoaderInner>)>,
    /// Min-heap of upcoming flush deadlines.
    queue: BinaryHeap<Reverse<QueueEntry>>,
    next_epoch: u64,
}

/// Process-wide driver of periodic loader flushes.
pub struct FlushScheduler {
    state: Arc<Mutex<SchedulerState>>,
    notify: Arc<Notify>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FlushScheduler {
    /// Creates a scheduler and starts its worker task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(SchedulerState {
            loaders: HashMap::new(),
            queue: BinaryHeap::new(),
            next_epoch: 0,
        }));
        let notify = Arc::new(Notify::new());

        tokio::spawn(Self::worker(Arc::downgrade(&state), Arc::clone(&notify)));

        Arc::new(Self { state, notify })
    }

    /// Enlists a loader for periodic flushing at its current frequency.
    pub(crate) fn enlist(&self, loader: &Arc<LoaderInner>) {
        let freq = Duration::from_millis(loader.auto_flush_freq_ms());

        if freq.is_zero() {
            return;
        }

        {
            let mut state = lock(&self.state);
            let epoch = state.next_epoch;
            state.next_epoch += 1;

            state
                .loaders
                .insert(loader.loader_id(), (epoch, Arc::downgrade(loader)));
            state.queue.push(Reverse(QueueEntry {
                deadline: loader.next_flush_deadline(),
                loader_id: loader.loader_id(),
                epoch,
            }));
        }

        self.notify.notify_waiters();
    }

    /// Delists a loader. Its queued entries become stale and are dropped
    /// at their deadline.
    pub(crate) fn delist(&self, loader_id: u64) {
        lock(&self.state).loaders.remove(&loader_id);
    }

    /// Number of enlisted loaders. Test hook.
    #[must_use]
    pub fn enlisted(&self) -> usize {
        lock(&self.state).loaders.len()
    }

    async fn worker(state: Weak<Mutex<SchedulerState>>, notify: Arc<Notify>) {
        loop {
            let Some(state) = state.upgrade() else {
                return;
            };

            let next_deadline = lock(&state)
                .queue
                .peek()
                .map(|Reverse(entry)| entry.deadline);

            match next_deadline {
                None => {
                    drop(state);
                    // Bounded wait: a scheduler dropped between the upgrade
                    // and this await would otherwise strand the worker.
                    let _ = tokio::time::timeout(IDLE_POLL, notify.notified()).await;
                }
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {
                            Self::tick(&state).await;
                        }
                        () = notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Pops every due entry, flushes live loaders, re-enqueues them.
    async fn tick(state: &Arc<Mutex<SchedulerState>>) {
        loop {
            let due = {
                let mut state = lock(state);

                let is_due = state
                    .queue
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.deadline <= Instant::now());

                if !is_due {
                    return;
                }

                let Some(Reverse(entry)) = state.queue.pop() else {
                    return;
                };

                match state.loaders.get(&entry.loader_id) {
                    Some((epoch, loader)) if *epoch == entry.epoch => {
                        loader.upgrade().map(|loader| (entry.loader_id, loader))
                    }
                    _ => None,
                }
            };

            let Some((loader_id, loader)) = due else {
                continue;
            };

            let freq = Duration::from_millis(loader.auto_flush_freq_ms());

            if loader.is_closed() || freq.is_zero() {
                lock(state).loaders.remove(&loader_id);
                continue;
            }

            debug!(loader_id, "auto-flush tick");
            loader.try_flush().await;

            let deadline = loader.next_flush_deadline();
            let mut state = lock(state);

            if let Some((epoch, _)) = state.loaders.get(&loader_id) {
                let epoch = *epoch;
                state.queue.push(Reverse(QueueEntry {
                    deadline,
                    loader_id,
                    epoch,
                }));
            }
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        // Wake the worker so it notices the state is gone and exits.
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("enlisted", &self.enlisted())
            .finish_non_exhaustive()
    }
}
