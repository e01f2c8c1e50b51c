//! The data loader engine.
//!
//! `DataLoader` is the public ingest entry point: it partitions batches by
//! destination via the affinity resolver, fans entries out to per-node
//! buffers, and tracks a completion per caller batch. Failed destinations
//! drive a bounded remap loop; topology departures evict the affected
//! buffer and fail its batches so the remap can pick a new owner.
//!
//! Lifecycle: OPEN → CLOSING → CLOSED. Public mutating operations enter a
//! busy read-lock; `close` takes the write barrier, after which new
//! submissions are rejected with `LoaderClosed`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use trellis_core::{CacheName, Completion, Entry, Limits, NodeId};

use trellis_affinity::{AffinityResolver, ResolveError};
use trellis_cluster::{
    DeploymentDescriptor, Discovery, Message, Topic, TopologyEvent, Transport,
};

use crate::buffer::{Buffer, BufferContext};
use crate::error::{BatchCompletion, LoadError, LoadResult};
use crate::scheduler::FlushScheduler;
use crate::store::CacheStore;
use crate::updater::Updater;

/// Sequence for process-unique loader ids.
static LOADER_SEQ: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bulk data loader for one target cache.
///
/// Cheap to clone; clones share the same loader instance.
#[derive(Clone)]
pub struct DataLoader {
    inner: Arc<LoaderInner>,
}

pub(crate) struct LoaderInner {
    id: u64,
    cache_name: CacheName,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    resolver: Arc<AffinityResolver>,
    scheduler: Arc<FlushScheduler>,
    /// Submission context shared with every buffer.
    ctx: Arc<BufferContext>,
    /// Applied to buffers created after the change.
    parallel_ops: AtomicUsize,
    max_remaps: AtomicU32,
    auto_flush_freq_ms: AtomicU64,
    last_flush: Mutex<Instant>,
    /// Buffers by destination node. Install is find-or-create; removal
    /// always compares identity first.
    buffers: Mutex<HashMap<NodeId, Arc<Buffer>>>,
    /// Caller-visible completions still unresolved.
    active: Arc<Mutex<HashMap<u64, BatchCompletion>>>,
    active_seq: AtomicU64,
    closed: AtomicBool,
    /// Busy lock: read side on every public mutating op, write barrier at
    /// close. Never upgraded.
    busy: RwLock<()>,
    done: BatchCompletion,
    /// Response router and topology listener tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataLoader {
    /// Creates a loader for `cache_name` and registers its response topic
    /// and topology listener.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        cache_name: CacheName,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        resolver: Arc<AffinityResolver>,
        local_store: Arc<CacheStore>,
        scheduler: Arc<FlushScheduler>,
    ) -> Self {
        let limits = Limits::default();
        let response_topic = Topic::LoadReply(discovery.local_node());

        let ctx = Arc::new(BufferContext {
            cache_name: cache_name.clone(),
            discovery: Arc::clone(&discovery),
            transport: Arc::clone(&transport),
            local_store,
            response_topic,
            buf_size: AtomicUsize::new(limits.per_node_buffer_size),
            skip_store: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            updater: Mutex::new(Updater::default()),
            deployment: Mutex::new(None),
        });

        let inner = Arc::new(LoaderInner {
            id: LOADER_SEQ.fetch_add(1, Ordering::Relaxed),
            cache_name,
            discovery: Arc::clone(&discovery),
            transport: Arc::clone(&transport),
            resolver,
            scheduler,
            ctx,
            parallel_ops: AtomicUsize::new(limits.per_node_parallel_ops),
            max_remaps: AtomicU32::new(limits.max_remaps),
            auto_flush_freq_ms: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
            buffers: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            active_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            busy: RwLock::new(()),
            done: Completion::new(),
            tasks: Mutex::new(Vec::new()),
        });

        // Route responses arriving on this loader's unique topic.
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        transport.add_listener(response_topic, response_tx);

        let router = tokio::spawn(LoaderInner::response_loop(
            Arc::downgrade(&inner),
            response_rx,
        ));
        let topology = tokio::spawn(LoaderInner::topology_loop(
            Arc::downgrade(&inner),
            discovery.subscribe(),
        ));

        lock(&inner.tasks).extend([router, topology]);

        Self { inner }
    }

    /// Adds a single entry. A `None` value removes the key.
    ///
    /// # Errors
    /// Fails validation or rejects when the loader is closed.
    pub async fn add(
        &self,
        key: impl Into<Bytes>,
        value: Option<Bytes>,
    ) -> LoadResult<BatchCompletion> {
        self.add_data(vec![Entry {
            key: key.into(),
            value,
        }])
        .await
    }

    /// Adds one entry.
    ///
    /// # Errors
    /// Fails validation or rejects when the loader is closed.
    pub async fn add_entry(&self, entry: Entry) -> LoadResult<BatchCompletion> {
        self.add_data(vec![entry]).await
    }

    /// Removes a key. Equivalent to adding the key with no value.
    ///
    /// # Errors
    /// Fails validation or rejects when the loader is closed.
    pub async fn remove(&self, key: impl Into<Bytes>) -> LoadResult<BatchCompletion> {
        self.add(key, None).await
    }

    /// Ingests a batch of entries.
    ///
    /// The returned completion resolves once every key has been applied on
    /// the node owning it, surviving remaps along the way, or fails
    /// terminally.
    ///
    /// # Errors
    /// Rejects empty batches and submissions after close.
    pub async fn add_data(&self, entries: Vec<Entry>) -> LoadResult<BatchCompletion> {
        if entries.is_empty() {
            return Err(trellis_core::Error::InvalidArgument {
                name: "entries",
                reason: "must not be empty",
            }
            .into());
        }

        let inner = &self.inner;
        let _busy = inner.enter_busy()?;

        let result: BatchCompletion = Completion::new();

        let token = inner.active_seq.fetch_add(1, Ordering::Relaxed);
        lock(&inner.active).insert(token, result.clone());

        let active = Arc::clone(&inner.active);
        result.on_done(move |_| {
            lock(&active).remove(&token);
        });

        let live_keys: Arc<Mutex<HashSet<Bytes>>> = Arc::new(Mutex::new(
            entries.iter().map(|entry| entry.key.clone()).collect(),
        ));

        Arc::clone(inner)
            .load0(entries, result.clone(), live_keys, 0)
            .await;

        Ok(result)
    }

    /// Blocks until every currently-submitted batch is resolved.
    ///
    /// # Errors
    /// Returns the first terminal batch failure, or `LoaderClosed`.
    pub async fn flush(&self) -> LoadResult<()> {
        let _busy = self.inner.enter_busy()?;
        self.inner.do_flush().await
    }

    /// Best-effort flush of every buffer's pending entries. Does not wait
    /// for in-flight work and swallows errors; periodic callers only.
    pub async fn try_flush(&self) {
        self.inner.try_flush().await;
    }

    /// Closes the loader.
    ///
    /// `cancel = false` drains outstanding work first; `cancel = true`
    /// fails all outstanding handles with `Cancelled`. Idempotent: later
    /// calls return immediately.
    ///
    /// # Errors
    /// Propagates the terminal result of the final drain.
    pub async fn close(&self, cancel: bool) -> LoadResult<()> {
        let inner = &self.inner;

        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Mark before the barrier so submitters suspended on permits drain
        // out through the cancellation path instead of wedging the close.
        if cancel {
            inner.ctx.cancelled.store(true, Ordering::SeqCst);
        }

        let barrier = inner.busy.write().await;
        debug!(cache = %inner.cache_name, cancel, "closing data loader");

        let outcome = if cancel {
            let buffers: Vec<Arc<Buffer>> = lock(&inner.buffers).values().cloned().collect();
            for buffer in buffers {
                buffer.cancel_all();
            }

            // Anything still unresolved (entries never bound to a buffer)
            // fails now; resolved handles are unaffected.
            let active: Vec<BatchCompletion> = lock(&inner.active).values().cloned().collect();
            for completion in active {
                completion.fail(LoadError::Cancelled);
            }

            Ok(())
        } else {
            inner.do_flush().await
        };

        drop(barrier);

        inner.scheduler.delist(inner.id);
        inner.transport.remove_listener(inner.ctx.response_topic);

        for task in lock(&inner.tasks).drain(..) {
            task.abort();
        }
        lock(&inner.buffers).clear();

        inner.done.complete(outcome.clone());
        outcome
    }

    /// Completion for the loader lifecycle, resolved when the loader
    /// reaches CLOSED.
    #[must_use]
    pub fn future(&self) -> BatchCompletion {
        self.inner.done.clone()
    }

    /// The cache this loader feeds.
    #[must_use]
    pub fn cache_name(&self) -> &CacheName {
        &self.inner.cache_name
    }

    /// Entries accumulated per destination before a batch is cut.
    #[must_use]
    pub fn per_node_buffer_size(&self) -> usize {
        self.inner.ctx.buf_size.load(Ordering::Relaxed)
    }

    /// Sets the per-destination buffer size.
    ///
    /// # Errors
    /// Rejects zero.
    pub fn set_per_node_buffer_size(&self, buf_size: usize) -> LoadResult<()> {
        if buf_size == 0 {
            return Err(trellis_core::Error::InvalidArgument {
                name: "buf_size",
                reason: "must be > 0",
            }
            .into());
        }

        self.inner.ctx.buf_size.store(buf_size, Ordering::Relaxed);
        Ok(())
    }

    /// Concurrently outstanding batches allowed per destination.
    #[must_use]
    pub fn per_node_parallel_ops(&self) -> usize {
        self.inner.parallel_ops.load(Ordering::Relaxed)
    }

    /// Sets the per-destination parallelism cap. Applies to buffers
    /// created after the change.
    ///
    /// # Errors
    /// Rejects zero.
    pub fn set_per_node_parallel_ops(&self, parallel_ops: usize) -> LoadResult<()> {
        if parallel_ops == 0 {
            return Err(trellis_core::Error::InvalidArgument {
                name: "parallel_ops",
                reason: "must be > 0",
            }
            .into());
        }

        self.inner
            .parallel_ops
            .store(parallel_ops, Ordering::Relaxed);
        Ok(())
    }

    /// Current auto-flush frequency in milliseconds; 0 means disabled.
    #[must_use]
    pub fn auto_flush_frequency(&self) -> u64 {
        self.inner.auto_flush_freq_ms.load(Ordering::SeqCst)
    }

    /// Sets the auto-flush frequency. Enlists with the shared scheduler on
    /// a 0 → n transition, delists on n → 0; re-setting the same value is
    /// a no-op with respect to scheduler membership.
    pub fn set_auto_flush_frequency(&self, freq_ms: u64) {
        let old = self.inner.auto_flush_freq_ms.swap(freq_ms, Ordering::SeqCst);

        if freq_ms != old {
            if freq_ms != 0 && old == 0 {
                self.inner.scheduler.enlist(&self.inner);
            } else if freq_ms == 0 && old != 0 {
                self.inner.scheduler.delist(self.inner.id);
            }
        }
    }

    /// The remap budget per caller batch.
    #[must_use]
    pub fn max_remaps(&self) -> u32 {
        self.inner.max_remaps.load(Ordering::Relaxed)
    }

    /// Sets the remap budget per caller batch.
    pub fn set_max_remaps(&self, max_remaps: u32) {
        self.inner.max_remaps.store(max_remaps, Ordering::Relaxed);
    }

    /// Sets the server-side update strategy.
    pub fn set_updater(&self, updater: Updater) {
        *lock(&self.inner.ctx.updater) = updater;
    }

    /// Attaches peer-deployment metadata to every subsequent request.
    pub fn set_deployment(&self, deployment: Option<DeploymentDescriptor>) {
        *lock(&self.inner.ctx.deployment) = deployment;
    }

    /// Controls the skip-store flag sent with every request.
    pub fn set_skip_store(&self, skip_store: bool) {
        self.inner
            .ctx
            .skip_store
            .store(skip_store, Ordering::Relaxed);
    }

    /// Nodes with a live buffer. Introspection hook.
    #[must_use]
    pub fn buffered_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = lock(&self.inner.buffers).keys().copied().collect();
        nodes.sort_unstable();
        nodes
    }

    /// Available submission permits for a destination, if it has a buffer.
    /// At rest this equals the parallelism cap. Introspection hook.
    #[must_use]
    pub fn available_permits(&self, node: NodeId) -> Option<usize> {
        lock(&self.inner.buffers)
            .get(&node)
            .map(|buffer| buffer.available_permits())
    }

    /// Caller batches not yet resolved. Introspection hook.
    #[must_use]
    pub fn active_batches(&self) -> usize {
        lock(&self.inner.active).len()
    }
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("cache", &self.inner.cache_name)
            .field("buffers", &lock(&self.inner.buffers).len())
            .field("active", &self.active_batches())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl LoaderInner {
    pub(crate) fn loader_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn auto_flush_freq_ms(&self) -> u64 {
        self.auto_flush_freq_ms.load(Ordering::SeqCst)
    }

    /// When the next auto-flush is due: last flush plus the current
    /// frequency. Explicit flushes push the deadline out.
    pub(crate) fn next_flush_deadline(&self) -> Instant {
        *lock(&self.last_flush) + std::time::Duration::from_millis(self.auto_flush_freq_ms())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn enter_busy(&self) -> LoadResult<tokio::sync::RwLockReadGuard<'_, ()>> {
        if self.is_closed() {
            return Err(LoadError::LoaderClosed);
        }

        self.busy.try_read().map_err(|_| LoadError::LoaderClosed)
    }

    /// Partitions `entries` by owner and hands each group to its buffer.
    ///
    /// Re-entered (through a spawned task) with `remaps + 1` for any group
    /// whose batch fails with a retryable error. Boxed because the remap
    /// continuation re-creates this future.
    fn load0(
        self: Arc<Self>,
        entries: Vec<Entry>,
        result: BatchCompletion,
        live_keys: Arc<Mutex<HashSet<Bytes>>>,
        remaps: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let max_remaps = self.max_remaps.load(Ordering::Relaxed);

            if remaps >= max_remaps {
                result.fail(LoadError::TooManyRemaps { remaps });
                return;
            }

            let groups = match self.resolver.map_keys(&self.cache_name, entries).await {
                Ok(groups) => groups,
                Err(ResolveError::NoCacheNode { cache }) => {
                    result.fail(LoadError::NoTopology { cache });
                    return;
                }
                Err(err) => {
                    result.fail(LoadError::Resolver(err));
                    return;
                }
            };

            for (node, group) in groups {
                let buffer = Arc::clone(lock(&self.buffers).entry(node).or_insert_with(|| {
                    Arc::new(Buffer::new(
                        node,
                        Arc::clone(&self.ctx),
                        self.parallel_ops.load(Ordering::Relaxed),
                    ))
                }));

                let keys: Vec<Bytes> = group.iter().map(|entry| entry.key.clone()).collect();
                let retry_entries = group.clone();

                let this = Arc::clone(&self);
                let result = result.clone();
                let live_keys = Arc::clone(&live_keys);

                let continuation = move |outcome: &Result<(), LoadError>| match outcome {
                    Ok(()) => {
                        let drained = {
                            let mut live = lock(&live_keys);
                            for key in &keys {
                                live.remove(key);
                            }
                            live.is_empty()
                        };

                        if drained {
                            result.complete_ok();
                        }
                    }
                    Err(err) => {
                        debug!(%node, %err, remaps, "batch finished with error");

                        if this.ctx.cancelled.load(Ordering::SeqCst) {
                            result.fail(LoadError::Cancelled);
                        } else if err.is_retryable() {
                            tokio::spawn(Arc::clone(&this).load0(
                                retry_entries,
                                result,
                                live_keys,
                                remaps + 1,
                            ));
                        } else {
                            result.fail(err.clone());
                        }
                    }
                };

                let completion = buffer.update(group, continuation).await;

                // The destination may have left between mapping and binding.
                if self.discovery.node(node).is_none() {
                    let evicted = {
                        let mut buffers = lock(&self.buffers);

                        match buffers.get(&node) {
                            Some(bound) if Arc::ptr_eq(bound, &buffer) => {
                                buffers.remove(&node);
                                true
                            }
                            _ => false,
                        }
                    };

                    if evicted {
                        buffer.on_node_left();
                    }

                    completion.fail(LoadError::NodeLeft { node });
                }
            }
        })
    }

    /// Flushes every buffer until all completions active at entry resolve.
    async fn do_flush(&self) -> LoadResult<()> {
        *lock(&self.last_flush) = Instant::now();

        let snapshot: Vec<BatchCompletion> = lock(&self.active).values().cloned().collect();
        let mut waiting = Vec::new();

        for completion in snapshot {
            match completion.try_result() {
                Some(Err(err)) => return Err(err),
                Some(Ok(())) => {}
                None => waiting.push(completion),
            }
        }

        if waiting.is_empty() {
            return Ok(());
        }

        loop {
            let buffers: Vec<Arc<Buffer>> = lock(&self.buffers).values().cloned().collect();

            let mut flushes = Vec::new();
            for buffer in &buffers {
                if let Some(flush) = buffer.flush().await {
                    flushes.push(flush);
                }
            }

            let mut flush_err = false;
            for flush in flushes {
                if flush.wait().await.is_err() {
                    // A failed buffer flush means a remap is in flight;
                    // re-flush so the remapped entries get submitted.
                    debug!(cache = %self.cache_name, "buffer flush failed, re-flushing after remap");
                    flush_err = true;
                }
            }

            if !flush_err {
                let mut all_done = true;

                for completion in &waiting {
                    match completion.try_result() {
                        Some(Err(err)) => return Err(err),
                        Some(Ok(())) => {}
                        None => all_done = false,
                    }
                }

                if all_done {
                    return Ok(());
                }
            }

            // Let remap tasks run before the next pass.
            tokio::task::yield_now().await;
        }
    }

    /// Best-effort periodic flush. No-op when auto-flush is disabled or
    /// the loader is closing; errors surface only through batch handles.
    pub(crate) async fn try_flush(&self) {
        if self.auto_flush_freq_ms() == 0 {
            return;
        }

        let Ok(_busy) = self.busy.try_read() else {
            return;
        };

        if self.is_closed() {
            return;
        }

        let buffers: Vec<Arc<Buffer>> = lock(&self.buffers).values().cloned().collect();

        for buffer in buffers {
            let _ = buffer.flush().await;
        }

        *lock(&self.last_flush) = Instant::now();
    }

    async fn response_loop(
        inner: std::sync::Weak<Self>,
        mut responses: mpsc::UnboundedReceiver<(NodeId, Message)>,
    ) {
        while let Some((from, message)) = responses.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            match message {
                Message::LoadResponse(response) => {
                    let buffer = lock(&inner.buffers).get(&from).cloned();

                    match buffer {
                        Some(buffer) => buffer.on_response(response),
                        None => {
                            debug!(node = %from, "ignoring response, node has no buffer");
                        }
                    }
                }
                Message::LoadRequest(_) => {
                    debug!(node = %from, "unexpected request on response topic, dropping");
                }
            }
        }
    }

    async fn topology_loop(
        inner: std::sync::Weak<Self>,
        mut events: broadcast::Receiver<TopologyEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) if event.kind.is_departure() => {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };

                    let removed = lock(&inner.buffers).remove(&event.node);

                    if let Some(buffer) = removed {
                        // Fail the buffer off the event-delivery task:
                        // completions fire remap continuations, which must
                        // not block topology dispatch.
                        tokio::spawn(async move {
                            buffer.on_node_left();
                        });
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "loader lagged behind topology events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

impl Drop for LoaderInner {
    fn drop(&mut self) {
        self.transport.remove_listener(self.ctx.response_topic);

        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
