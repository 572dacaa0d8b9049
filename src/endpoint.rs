//! Collaborator seam: endpoints, endpoint events and the worker factory.
//!
//! The state machine never spawns an execution context itself. It asks a
//! [`WorkerFactory`] for a fresh [`Endpoint`] on every connection attempt:
//! an outbound message sender, an inbound event receiver and a handle that
//! terminates the underlying context.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::WorkerResult;
use crate::protocol::WireMessage;

/// Buffer size for endpoint message queues.
pub(crate) const ENDPOINT_BUFFER: usize = 64;

/// Event delivered from the worker side of an endpoint.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A wire message produced by the worker context.
    Message(WireMessage),
    /// Fatal fault, e.g. an uncaught error in the worker context. Delivered
    /// at most once; the endpoint is unusable afterwards.
    Fault(String),
}

/// Handle to the underlying execution context, used for teardown.
pub trait ContextHandle: Send {
    /// Terminate the context. Called once at end of life.
    fn terminate(&mut self);
}

/// A bidirectional message endpoint owning one worker execution context.
pub struct Endpoint {
    /// Outbound messages toward the worker context.
    pub sender: mpsc::Sender<WireMessage>,
    /// Inbound events from the worker context.
    pub events: mpsc::Receiver<EndpointEvent>,
    /// Terminates the underlying context.
    pub context: Box<dyn ContextHandle>,
}

/// Factory producing a fresh endpoint on demand.
///
/// One endpoint is created per connection attempt; endpoints are never
/// reused across disconnect/reconnect cycles.
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    /// Create a new worker context and the endpoint talking to it.
    async fn create(&self) -> WorkerResult<Endpoint>;
}
