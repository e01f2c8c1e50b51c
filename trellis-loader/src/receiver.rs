//! Server-side ingest handler.
//!
//! Every node runs one receiver on the shared load topic: it unmarshals
//! incoming batches, applies them to the node's local store through the
//! requested updater, and acknowledges on the request's response topic.
//! Failures travel back as a marshalled error blob; a request that cannot
//! even be unmarshalled still gets an error response rather than silence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use trellis_core::NodeId;

use trellis_cluster::{LoadRequest, LoadResponse, Message, Topic, Transport};

use crate::marshal;
use crate::store::CacheStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ingest endpoint of one node.
pub struct IngestReceiver {
    transport: Arc<dyn Transport>,
    handled: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestReceiver {
    /// Starts serving load requests addressed to this node, applying them
    /// to `store`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(transport: Arc<dyn Transport>, store: Arc<CacheStore>) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        transport.add_listener(Topic::Load, requests_tx);

        let handled = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(Self::serve(
            Arc::clone(&transport),
            store,
            Arc::clone(&handled),
            requests_rx,
        ));

        Self {
            transport,
            handled,
            task: Mutex::new(Some(task)),
        }
    }

    /// Number of load requests processed so far.
    #[must_use]
    pub fn requests_handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    /// Stops serving and deregisters from the load topic.
    pub fn stop(&self) {
        self.transport.remove_listener(Topic::Load);

        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }

    async fn serve(
        transport: Arc<dyn Transport>,
        store: Arc<CacheStore>,
        handled: Arc<AtomicU64>,
        mut requests: mpsc::UnboundedReceiver<(NodeId, Message)>,
    ) {
        while let Some((from, message)) = requests.recv().await {
            let Message::LoadRequest(request) = message else {
                debug!(node = %from, "unexpected message on load topic, dropping");
                continue;
            };

            handled.fetch_add(1, Ordering::SeqCst);

            let error = Self::apply(&store, &request).err();

            if let Some(message) = &error {
                debug!(node = %from, req = %request.req_id, message, "batch rejected");
            }

            let response = LoadResponse {
                req_id: request.req_id,
                error_blob: error.map(|message| marshal::marshal_error(&message)),
            };

            if let Err(err) = transport
                .send(from, request.response_topic, Message::LoadResponse(response))
                .await
            {
                debug!(node = %from, %err, "failed to send load response");
            }
        }
    }

    fn apply(store: &CacheStore, request: &LoadRequest) -> Result<(), String> {
        let updater =
            marshal::unmarshal_updater(&request.updater_blob).map_err(|err| err.to_string())?;
        let entries =
            marshal::unmarshal_entries(&request.entries_blob).map_err(|err| err.to_string())?;

        updater.apply(store, &request.cache_name, &entries)
    }
}

impl Drop for IngestReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for IngestReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestReceiver")
            .field("node", &self.transport.local_node())
            .field("handled", &self.requests_handled())
            .finish_non_exhaustive()
    }
}
