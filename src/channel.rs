//! Request/response multiplexer over a single worker context.
//!
//! A [`WorkerChannel`] owns one endpoint. Each call gets a fresh id and a
//! pending-table entry; a background reader task correlates response
//! envelopes back to their callers. Responses may arrive out of send order.
//! A context fault rejects every pending call at once; the channel is then
//! unusable and must be replaced by a fresh construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::endpoint::{ContextHandle, Endpoint, EndpointEvent};
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::WireMessage;

/// Default timeout for calls (30 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Map of pending call ids to response resolvers. An entry is removed
/// exactly once: by a matching response, by caller-side abandonment, or by
/// fault propagation.
type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerResult<serde_json::Value>>>>>;

/// One-to-one request/response multiplexer over a worker execution context.
///
/// Safe to share behind an [`Arc`]: concurrent calls each get a distinct id
/// and a distinct pending entry, so no external serialization is needed.
pub struct WorkerChannel {
    /// Outbound half of the endpoint.
    sender: mpsc::Sender<WireMessage>,
    /// Pending calls awaiting a response.
    pending: PendingTable,
    /// Next call id. Monotonically increasing, never reused.
    next_id: AtomicU64,
    /// Fault reason, set once when the context reports a fatal failure.
    fault: Arc<OnceLock<String>>,
    /// Background reader task, detached on dispose.
    reader: StdMutex<Option<JoinHandle<()>>>,
    /// Handle to the underlying context, consumed on dispose.
    context: StdMutex<Option<Box<dyn ContextHandle>>>,
    /// Per-call timeout.
    timeout: Duration,
}

impl WorkerChannel {
    /// Wrap an endpoint with the default call timeout.
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_timeout(endpoint, DEFAULT_CALL_TIMEOUT)
    }

    /// Wrap an endpoint with a custom call timeout.
    pub fn with_timeout(endpoint: Endpoint, timeout: Duration) -> Self {
        let Endpoint {
            sender,
            events,
            context,
        } = endpoint;

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let fault = Arc::new(OnceLock::new());
        let reader = spawn_reader_task(events, pending.clone(), fault.clone());

        Self {
            sender,
            pending,
            next_id: AtomicU64::new(1),
            fault,
            reader: StdMutex::new(Some(reader)),
            context: StdMutex::new(Some(context)),
            timeout,
        }
    }

    /// Send a call to the worker and wait for the matching response.
    ///
    /// The returned future settles as rejected when `cancel` is signalled;
    /// the envelope may already have been sent, in which case the late
    /// response is discarded as a stale id. The worker may still process an
    /// abandoned call.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is cancelled, times out, the endpoint
    /// is gone, the context faults, or the worker rejects the method.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> WorkerResult<serde_json::Value> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        if let Some(reason) = self.fault.get() {
            return Err(WorkerError::ContextFault(reason.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Register the resolver before sending so a fast response cannot
        // miss it.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let envelope = WireMessage::Call {
            id,
            method: method.to_string(),
            args,
        };
        if self.sender.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(WorkerError::SendFailed);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                // Abandon the call; a late response becomes a stale id.
                self.pending.lock().await.remove(&id);
                Err(WorkerError::Cancelled)
            }
            outcome = tokio::time::timeout(self.timeout, rx) => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(WorkerError::ChannelClosed),
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    Err(WorkerError::Timeout(self.timeout.as_secs()))
                }
            },
        }
    }

    /// Check whether the channel can still carry calls.
    pub fn is_alive(&self) -> bool {
        if self.fault.get().is_some() {
            return false;
        }
        match self.reader.lock().expect("lock poisoned").as_ref() {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }

    /// Detach the reader task and terminate the underlying context.
    ///
    /// Does not reject pending calls; the owning state machine is expected
    /// to have cancelled them or accepted their abandonment. Safe to call
    /// more than once.
    pub fn dispose(&self) {
        if let Some(reader) = self.reader.lock().expect("lock poisoned").take() {
            reader.abort();
        }
        if let Some(mut context) = self.context.lock().expect("lock poisoned").take() {
            context.terminate();
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Spawn the background task that correlates endpoint events to callers.
fn spawn_reader_task(
    mut events: mpsc::Receiver<EndpointEvent>,
    pending: PendingTable,
    fault: Arc<OnceLock<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::Message(WireMessage::Success { id, result }) => {
                    resolve(&pending, id, Ok(result)).await;
                }
                EndpointEvent::Message(WireMessage::Error { id, error }) => {
                    resolve(&pending, id, Err(WorkerError::Remote(error))).await;
                }
                EndpointEvent::Message(other) => {
                    warn!(id = other.id(), "ignoring unexpected envelope from worker");
                }
                EndpointEvent::Fault(reason) => {
                    reject_all(&pending, &fault, reason).await;
                    return;
                }
            }
        }
        // Event stream ended without an explicit fault: the context is gone.
        reject_all(&pending, &fault, "worker context closed".to_string()).await;
    })
}

/// Settle one pending call. Stale ids are dropped, not errors.
async fn resolve(pending: &PendingTable, id: u64, outcome: WorkerResult<serde_json::Value>) {
    match pending.lock().await.remove(&id) {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => debug!(id, "dropping response for unknown call id"),
    }
}

/// Reject every pending call with the fault and mark the channel faulted.
async fn reject_all(pending: &PendingTable, fault: &OnceLock<String>, reason: String) {
    let _ = fault.set(reason.clone());
    let mut pending = pending.lock().await;
    if !pending.is_empty() {
        warn!(
            calls = pending.len(),
            %reason,
            "worker context fault, rejecting pending calls"
        );
    }
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(WorkerError::ContextFault(reason.clone())));
    }
}
