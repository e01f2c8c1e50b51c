//! Per-destination-node buffer.
//!
//! A buffer accumulates entries bound for one node, submits them as batches
//! when the size threshold is reached (or on flush), and correlates
//! responses back to batch completions by request id. A counting semaphore
//! caps the number of concurrently outstanding batches per destination.
//!
//! Locking: the buffer's monitor guards ONLY the `(pending, completion)`
//! pair and is held just for the swap. Submission, marshalling, and network
//! I/O all happen outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use trellis_core::{CacheName, Completion, Entry, NodeId, RequestId};

use trellis_cluster::{
    DeploymentDescriptor, Discovery, LoadRequest, LoadResponse, Message, Topic, Transport,
};

use crate::error::{BatchCompletion, LoadError};
use crate::marshal;
use crate::store::CacheStore;
use crate::updater::Updater;

/// Loader-wide context shared by every buffer of one loader.
pub(crate) struct BufferContext {
    /// Target cache.
    pub cache_name: CacheName,
    /// Discovery view, consulted on send failures.
    pub discovery: Arc<dyn Discovery>,
    /// Transport used for remote submissions.
    pub transport: Arc<dyn Transport>,
    /// Store backing the local node (same-node fast path).
    pub local_store: Arc<CacheStore>,
    /// Topic the destination must reply on.
    pub response_topic: Topic,
    /// Entries accumulated per destination before a batch is cut.
    pub buf_size: AtomicUsize,
    /// Bypass write-through stores on the destination.
    pub skip_store: AtomicBool,
    /// Set when the loader is closed with cancellation.
    pub cancelled: AtomicBool,
    /// Server-side update strategy.
    pub updater: Mutex<Updater>,
    /// Optional peer-deployment metadata attached to each request.
    pub deployment: Mutex<Option<DeploymentDescriptor>>,
}

struct PendingState {
    entries: Vec<Entry>,
    completion: BatchCompletion,
}

/// Buffer for one destination node.
pub(crate) struct Buffer {
    node: NodeId,
    is_local: bool,
    ctx: Arc<BufferContext>,
    /// Monitor for the pending swap only.
    state: Mutex<PendingState>,
    /// Outstanding remote batches by request id.
    inflight: Arc<Mutex<HashMap<RequestId, BatchCompletion>>>,
    /// Outstanding same-node batches and their worker tasks.
    local_tasks: Arc<Mutex<HashMap<RequestId, (BatchCompletion, JoinHandle<()>)>>>,
    id_gen: AtomicU64,
    permits: Arc<Semaphore>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Buffer {
    /// Creates a buffer for `node` with `parallel_ops` outstanding-batch
    /// permits.
    pub(crate) fn new(node: NodeId, ctx: Arc<BufferContext>, parallel_ops: usize) -> Self {
        let is_local = node == ctx.discovery.local_node();

        Self {
            node,
            is_local,
            ctx,
            state: Mutex::new(PendingState {
                entries: Vec::new(),
                completion: Completion::new(),
            }),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            local_tasks: Arc::new(Mutex::new(HashMap::new())),
            id_gen: AtomicU64::new(0),
            permits: Arc::new(Semaphore::new(parallel_ops)),
        }
    }

    /// Permits currently available. At rest this equals `parallel_ops`.
    pub(crate) fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Appends entries, cutting and submitting a batch every time the
    /// pending sequence reaches the size threshold.
    ///
    /// May suspend while acquiring submission permits. Returns a handle
    /// covering every entry of this call: the batches cut here plus, for a
    /// trailing remainder, the still-accumulating batch. `continuation` is
    /// attached to that handle.
    pub(crate) async fn update(
        &self,
        new_entries: Vec<Entry>,
        continuation: impl FnOnce(&Result<(), LoadError>) + Send + 'static,
    ) -> BatchCompletion {
        debug_assert!(!new_entries.is_empty());

        let buf_size = self.ctx.buf_size.load(Ordering::Relaxed).max(1);

        let (cut, mut parts, fallback) = {
            let mut state = lock(&self.state);
            let mut cut: Vec<(Vec<Entry>, BatchCompletion)> = Vec::new();

            for entry in new_entries {
                state.entries.push(entry);

                if state.entries.len() >= buf_size {
                    let entries = std::mem::take(&mut state.entries);
                    let completion = std::mem::replace(&mut state.completion, Completion::new());
                    cut.push((entries, completion));
                }
            }

            let mut parts: Vec<BatchCompletion> =
                cut.iter().map(|(_, completion)| completion.clone()).collect();

            // A trailing remainder lives on in the pending batch.
            if !state.entries.is_empty() {
                parts.push(state.completion.clone());
            }

            let fallback = state.completion.clone();
            (cut, parts, fallback)
        };

        let result = match parts.len() {
            0 => fallback,
            1 => parts.remove(0),
            _ => Completion::all(parts),
        };

        result.on_done(continuation);

        for (entries, completion) in cut {
            self.submit(entries, completion.clone()).await;

            if self.ctx.cancelled.load(Ordering::SeqCst) {
                completion.fail(LoadError::Cancelled);
            }
        }

        result
    }

    /// Submits any pending entries and returns a compound completion over
    /// everything outstanding for this buffer, or `None` when idle.
    pub(crate) async fn flush(&self) -> Option<BatchCompletion> {
        let to_submit = {
            let mut state = lock(&self.state);

            if state.entries.is_empty() {
                None
            } else {
                let entries = std::mem::take(&mut state.entries);
                let completion = std::mem::replace(&mut state.completion, Completion::new());
                Some((entries, completion))
            }
        };

        if let Some((entries, completion)) = to_submit {
            self.submit(entries, completion).await;
        }

        let mut members: Vec<BatchCompletion> = lock(&self.inflight).values().cloned().collect();
        members.extend(
            lock(&self.local_tasks)
                .values()
                .map(|(completion, _)| completion.clone()),
        );

        if members.is_empty() {
            None
        } else {
            Some(Completion::all(members))
        }
    }

    /// Correlates a response to its batch and resolves it. Responses for
    /// unknown (already retired) request ids are dropped.
    pub(crate) fn on_response(&self, response: LoadResponse) {
        let Some(completion) = lock(&self.inflight).remove(&response.req_id) else {
            debug!(node = %self.node, req = %response.req_id, "response for unknown request, dropping");
            return;
        };

        let outcome = match response.error_blob {
            None => Ok(()),
            Some(blob) => match marshal::unmarshal_error(&blob) {
                Ok(message) => Err(LoadError::UpdaterError { message }),
                Err(err) => Err(err),
            },
        };

        debug!(node = %self.node, req = %response.req_id, ok = outcome.is_ok(), "retiring request");
        completion.complete(outcome);
    }

    /// Fails every outstanding batch and the pending batch with `NodeLeft`.
    ///
    /// The caller must already have unbound this buffer from its node so no
    /// further entries arrive.
    pub(crate) fn on_node_left(&self) {
        debug_assert!(!self.is_local, "the local node cannot leave its own loader");
        debug!(node = %self.node, "forcibly completing batches (node has left)");

        let err = LoadError::NodeLeft { node: self.node };

        let outstanding: Vec<BatchCompletion> =
            lock(&self.inflight).drain().map(|(_, c)| c).collect();
        for completion in outstanding {
            completion.fail(err.clone());
        }

        let pending = lock(&self.state).completion.clone();
        pending.fail(err);
    }

    /// Fails every outstanding handle with `Cancelled` and aborts local
    /// worker tasks.
    pub(crate) fn cancel_all(&self) {
        let local: Vec<(BatchCompletion, JoinHandle<()>)> =
            lock(&self.local_tasks).drain().map(|(_, v)| v).collect();
        for (completion, handle) in local {
            handle.abort();
            completion.fail(LoadError::Cancelled);
        }

        let outstanding: Vec<BatchCompletion> =
            lock(&self.inflight).drain().map(|(_, c)| c).collect();
        for completion in outstanding {
            completion.fail(LoadError::Cancelled);
        }

        let pending = lock(&self.state).completion.clone();
        pending.fail(LoadError::Cancelled);
    }

    /// Submits one batch: acquires a permit, then runs locally or sends.
    async fn submit(&self, entries: Vec<Entry>, completion: BatchCompletion) {
        debug_assert!(!entries.is_empty());

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            completion.fail(LoadError::Cancelled);
            return;
        };
        permit.forget();

        // Exactly one release per submitted batch, on whichever terminal
        // path resolves it first.
        let permits = Arc::clone(&self.permits);
        completion.on_done(move |_| permits.add_permits(1));

        if self.is_local {
            self.run_local(entries, completion);
        } else {
            self.send_remote(entries, completion).await;
        }
    }

    /// Runs the updater against the local store on a worker task.
    fn run_local(&self, entries: Vec<Entry>, completion: BatchCompletion) {
        let id = RequestId::new(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);
        let ctx = Arc::clone(&self.ctx);

        let task_completion = completion.clone();
        let handle = tokio::spawn(async move {
            let updater = *lock(&ctx.updater);
            let outcome = updater
                .apply(&ctx.local_store, &ctx.cache_name, &entries)
                .map_err(|message| LoadError::UpdaterError { message });

            task_completion.complete(outcome);
        });

        lock(&self.local_tasks).insert(id, (completion.clone(), handle));

        let local_tasks = Arc::clone(&self.local_tasks);
        completion.on_done(move |_| {
            lock(&local_tasks).remove(&id);
        });
    }

    /// Marshals and sends one batch to the destination.
    async fn send_remote(&self, entries: Vec<Entry>, completion: BatchCompletion) {
        let entries_blob = marshal::marshal_entries(&entries);
        let updater_blob = marshal::marshal_updater(*lock(&self.ctx.updater));

        let req_id = RequestId::new(self.id_gen.fetch_add(1, Ordering::Relaxed) + 1);

        lock(&self.inflight).insert(req_id, completion.clone());

        // Retire the id as soon as the batch resolves, whichever path
        // resolves it.
        let inflight = Arc::clone(&self.inflight);
        completion.on_done(move |_| {
            lock(&inflight).remove(&req_id);
        });

        let request = LoadRequest {
            req_id,
            response_topic: self.ctx.response_topic,
            cache_name: self.ctx.cache_name.clone(),
            updater_blob,
            entries_blob,
            skip_store: self.ctx.skip_store.load(Ordering::Relaxed),
            deployment: lock(&self.ctx.deployment).clone(),
        };

        match self
            .ctx
            .transport
            .send(self.node, Topic::Load, Message::LoadRequest(request))
            .await
        {
            Ok(()) => {
                debug!(node = %self.node, req = %req_id, "sent load request");
            }
            Err(err) => {
                let alive = self.ctx.discovery.alive(self.node)
                    && self.ctx.discovery.ping(self.node).await;

                if alive {
                    completion.fail(LoadError::SendFailed {
                        node: self.node,
                        reason: err.to_string(),
                    });
                } else {
                    completion.fail(LoadError::NodeLeft { node: self.node });
                }
            }
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("node", &self.node)
            .field("is_local", &self.is_local)
            .field("pending", &lock(&self.state).entries.len())
            .field("inflight", &lock(&self.inflight).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use trellis_cluster::{CacheMode, ClusterRegistry, MemoryNetwork, NodeInfo};

    fn context(
        registry: &ClusterRegistry,
        network: &MemoryNetwork,
        buf_size: usize,
    ) -> Arc<BufferContext> {
        let local = registry.local_node();

        Arc::new(BufferContext {
            cache_name: CacheName::new("c"),
            discovery: Arc::new(registry.clone()),
            transport: Arc::new(network.endpoint(local)),
            local_store: Arc::new(CacheStore::new()),
            response_topic: Topic::LoadReply(local),
            buf_size: AtomicUsize::new(buf_size),
            skip_store: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
            updater: Mutex::new(Updater::Individual),
            deployment: Mutex::new(None),
        })
    }

    fn cluster(local: u64, remote: u64) -> ClusterRegistry {
        let cache = CacheName::new("c");
        let registry = ClusterRegistry::new(NodeInfo::new(
            NodeId::new(local),
            vec![(cache.clone(), CacheMode::Partitioned)],
        ));
        registry.join(NodeInfo::new(
            NodeId::new(remote),
            vec![(cache, CacheMode::Partitioned)],
        ));
        registry
    }

    #[tokio::test]
    async fn test_entries_below_threshold_stay_pending() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();
        let ctx = context(&registry, &network, 4);
        let buffer = Buffer::new(NodeId::new(2), ctx, 4);

        let completion = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;

        assert!(!completion.is_done());
        assert_eq!(lock(&buffer.inflight).len(), 0);
        assert_eq!(buffer.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_local_batch_applies_to_store() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();
        let ctx = context(&registry, &network, 2);
        let buffer = Buffer::new(NodeId::new(1), ctx.clone(), 2);

        let completion = buffer
            .update(vec![Entry::put("a", "1"), Entry::put("b", "2")], |_| {})
            .await;

        completion.wait().await.expect("local apply");
        assert_eq!(ctx.local_store.len(&CacheName::new("c")), 2);
        assert_eq!(buffer.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_threshold_submit_sends_request() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        // Capture requests on node 2 without responding.
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);

        let ctx = context(&registry, &network, 2);
        let buffer = Buffer::new(NodeId::new(2), ctx, 2);

        let completion = buffer
            .update(vec![Entry::put("a", "1"), Entry::put("b", "2")], |_| {})
            .await;

        let (from, message) = rx.recv().await.expect("request");
        assert_eq!(from, NodeId::new(1));
        let Message::LoadRequest(request) = message else {
            panic!("expected a load request");
        };

        assert!(!completion.is_done());
        assert_eq!(buffer.available_permits(), 1);

        // Acknowledge and the batch resolves, returning the permit.
        buffer.on_response(LoadResponse {
            req_id: request.req_id,
            error_blob: None,
        });
        completion.wait().await.expect("acked");
        assert_eq!(buffer.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_error_blob_fails_batch_with_updater_error() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);

        let ctx = context(&registry, &network, 1);
        let buffer = Buffer::new(NodeId::new(2), ctx, 1);

        let completion = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;
        let (_, message) = rx.recv().await.expect("request");
        let Message::LoadRequest(request) = message else {
            panic!("expected a load request");
        };

        buffer.on_response(LoadResponse {
            req_id: request.req_id,
            error_blob: Some(marshal::marshal_error("store rejected batch")),
        });

        let err = completion.wait().await.expect_err("updater error");
        assert_eq!(
            err,
            LoadError::UpdaterError {
                message: "store rejected batch".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();
        let ctx = context(&registry, &network, 4);
        let buffer = Buffer::new(NodeId::new(2), ctx, 4);

        // Nothing outstanding: must not panic, must not create state.
        buffer.on_response(LoadResponse {
            req_id: RequestId::new(99),
            error_blob: None,
        });

        assert_eq!(lock(&buffer.inflight).len(), 0);
    }

    #[tokio::test]
    async fn test_node_left_fails_inflight_and_pending() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        let (tx, _rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);

        let ctx = context(&registry, &network, 2);
        let buffer = Buffer::new(NodeId::new(2), ctx, 2);

        // One submitted batch, one partial pending batch.
        let submitted = buffer
            .update(vec![Entry::put("a", "1"), Entry::put("b", "2")], |_| {})
            .await;
        let pending = buffer.update(vec![Entry::put("c", "3")], |_| {}).await;

        buffer.on_node_left();

        let err = submitted.wait().await.expect_err("inflight failed");
        assert!(err.is_retryable());
        let err = pending.wait().await.expect_err("pending failed");
        assert!(err.is_retryable());

        // The submitted batch returned its permit.
        assert_eq!(buffer.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_permit_cap_suspends_submissions() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);

        let ctx = context(&registry, &network, 1);
        let buffer = Arc::new(Buffer::new(NodeId::new(2), ctx, 1));

        let first = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;
        assert_eq!(buffer.available_permits(), 0);

        // The second submission must block on the permit.
        let buffer2 = Arc::clone(&buffer);
        let second = tokio::spawn(async move {
            buffer2.update(vec![Entry::put("b", "2")], |_| {}).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // Ack the first request; the permit frees the second submission.
        let (_, message) = rx.recv().await.expect("first request");
        let Message::LoadRequest(request) = message else {
            panic!("expected a load request");
        };
        buffer.on_response(LoadResponse {
            req_id: request.req_id,
            error_blob: None,
        });

        first.wait().await.expect("first acked");
        let _second_completion = second.await.expect("second submitted");
        assert!(rx.recv().await.is_some(), "second request sent");
    }

    #[tokio::test]
    async fn test_flush_submits_partial_batch() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();
        let ctx = context(&registry, &network, 1024);
        let buffer = Buffer::new(NodeId::new(1), ctx.clone(), 4);

        let completion = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;
        assert!(!completion.is_done());

        let flush = buffer.flush().await.expect("work outstanding");
        flush.wait().await.expect("flush");

        completion.wait().await.expect("batch applied");
        assert_eq!(ctx.local_store.len(&CacheName::new("c")), 1);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_everything() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        let (tx, _rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);

        let ctx = context(&registry, &network, 2);
        let buffer = Buffer::new(NodeId::new(2), ctx, 2);

        let submitted = buffer
            .update(vec![Entry::put("a", "1"), Entry::put("b", "2")], |_| {})
            .await;
        let pending = buffer.update(vec![Entry::put("c", "3")], |_| {}).await;

        buffer.cancel_all();

        assert_eq!(
            submitted.wait().await.expect_err("cancelled"),
            LoadError::Cancelled
        );
        assert_eq!(
            pending.wait().await.expect_err("cancelled"),
            LoadError::Cancelled
        );
        assert_eq!(buffer.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_send_failure_with_dead_node_reports_node_left() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();
        // No listener registered for node 2: sends fail.
        registry.leave(NodeId::new(2));

        let ctx = context(&registry, &network, 1);
        let buffer = Buffer::new(NodeId::new(2), ctx, 1);

        let completion = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;

        let err = completion.wait().await.expect_err("send failed");
        assert!(matches!(err, LoadError::NodeLeft { .. }));
        assert_eq!(buffer.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_with_alive_node_reports_send_failed() {
        let registry = cluster(1, 2);
        let network = MemoryNetwork::new();

        let (tx, _rx) = mpsc::unbounded_channel();
        network.endpoint(NodeId::new(2)).add_listener(Topic::Load, tx);
        network.sever(NodeId::new(2), true);

        let ctx = context(&registry, &network, 1);
        let buffer = Buffer::new(NodeId::new(2), ctx, 1);

        let completion = buffer.update(vec![Entry::put("a", "1")], |_| {}).await;

        let err = completion.wait().await.expect_err("send failed");
        assert!(matches!(err, LoadError::SendFailed { .. }));
    }
}
