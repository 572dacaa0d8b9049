//! In-process scripted workers for tests.
//!
//! A [`ScriptedWorker`] stands in for a real worker binary: method handlers
//! run on a hosted task inside the test process, behind a regular
//! [`Endpoint`], so the whole connection stack is exercised without
//! spawning a child process.
//!
//! The host honors the remote-side contract: until a constructor call
//! succeeds, every other method is rejected with an error envelope. Calls
//! after construction are dispatched concurrently, so responses may
//! complete out of call order.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether::testing::ScriptedWorker;
//! use tether::WorkerHandle;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let factory = Arc::new(
//!     ScriptedWorker::new()
//!         .method("echo", |args| async move { Ok(json!(args)) })
//!         .into_factory(),
//! );
//!
//! let handle = WorkerHandle::new(factory, vec![]);
//! let proxy = handle.acquire();
//! let result = proxy.call("echo", vec![json!(1)]).await.unwrap();
//! assert_eq!(result, json!([1]));
//! handle.release();
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::{ContextHandle, Endpoint, EndpointEvent, WorkerFactory, ENDPOINT_BUFFER};
use crate::error::WorkerResult;
use crate::protocol::{WireMessage, CONSTRUCTOR_METHOD};

/// Outcome of a scripted method: a result payload or an error payload.
pub type HandlerResult = Result<serde_json::Value, serde_json::Value>;

/// Async handler for one scripted method.
type Handler =
    Arc<dyn Fn(Vec<serde_json::Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Builder for an in-process worker scripted with method handlers.
#[derive(Default, Clone)]
pub struct ScriptedWorker {
    constructor: Option<Handler>,
    methods: HashMap<String, Handler>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the constructor. By default construction succeeds with
    /// `null`; a scripted constructor can inspect the construction
    /// arguments or reject.
    pub fn on_construct<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.constructor = Some(wrap(handler));
        self
    }

    /// Script a named method.
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.methods.insert(name.to_string(), wrap(handler));
        self
    }

    /// Turn the script into a factory hosting one fresh worker per
    /// connection attempt.
    pub fn into_factory(self) -> ScriptedFactory {
        ScriptedFactory {
            script: self,
            spawned: AtomicUsize::new(0),
            current: Mutex::new(None),
        }
    }
}

fn wrap<F, Fut>(handler: F) -> Handler
where
    F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |args| handler(args).boxed())
}

/// Factory hosting scripted workers, with hooks for fault injection and
/// spawn counting.
pub struct ScriptedFactory {
    script: ScriptedWorker,
    spawned: AtomicUsize,
    /// Event sender of the most recently created endpoint.
    current: Mutex<Option<mpsc::Sender<EndpointEvent>>>,
}

impl ScriptedFactory {
    /// Number of worker contexts created so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Inject a fatal fault into the most recently created context.
    pub async fn inject_fault(&self, reason: &str) {
        let sender = self.current.lock().expect("lock poisoned").clone();
        if let Some(sender) = sender {
            let _ = sender
                .send(EndpointEvent::Fault(reason.to_string()))
                .await;
        }
    }

    /// Inject a raw wire message into the most recently created context,
    /// bypassing the scripted host. Useful for stale-id and malformed
    /// envelope scenarios.
    pub async fn inject_message(&self, message: WireMessage) {
        let sender = self.current.lock().expect("lock poisoned").clone();
        if let Some(sender) = sender {
            let _ = sender.send(EndpointEvent::Message(message)).await;
        }
    }
}

#[async_trait]
impl WorkerFactory for ScriptedFactory {
    async fn create(&self) -> WorkerResult<Endpoint> {
        let (sender, calls) = mpsc::channel(ENDPOINT_BUFFER);
        let (events_tx, events) = mpsc::channel(ENDPOINT_BUFFER);

        self.spawned.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().expect("lock poisoned") = Some(events_tx.clone());

        let host = tokio::spawn(run_host(self.script.clone(), calls, events_tx));

        Ok(Endpoint {
            sender,
            events,
            context: Box::new(HostContext { host }),
        })
    }
}

/// Terminates the hosted worker task.
struct HostContext {
    host: JoinHandle<()>,
}

impl ContextHandle for HostContext {
    fn terminate(&mut self) {
        self.host.abort();
    }
}

/// Hosted worker loop: constructor gate first, then concurrent dispatch.
async fn run_host(
    script: ScriptedWorker,
    mut calls: mpsc::Receiver<WireMessage>,
    events: mpsc::Sender<EndpointEvent>,
) {
    let mut constructed = false;

    while let Some(message) = calls.recv().await {
        let WireMessage::Call { id, method, args } = message else {
            continue;
        };

        if !constructed {
            if method == CONSTRUCTOR_METHOD {
                let outcome = match &script.constructor {
                    Some(handler) => handler(args).await,
                    None => Ok(serde_json::Value::Null),
                };
                constructed = outcome.is_ok();
                let _ = events.send(EndpointEvent::Message(respond(id, outcome))).await;
            } else {
                let error = json!(format!("method called before construction: {method}"));
                let _ = events
                    .send(EndpointEvent::Message(WireMessage::Error { id, error }))
                    .await;
            }
            continue;
        }

        match script.methods.get(&method) {
            Some(handler) => {
                let handler = handler.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let outcome = handler(args).await;
                    let _ = events.send(EndpointEvent::Message(respond(id, outcome))).await;
                });
            }
            None => {
                let error = json!(format!("no such method: {method}"));
                let _ = events
                    .send(EndpointEvent::Message(WireMessage::Error { id, error }))
                    .await;
            }
        }
    }
}

fn respond(id: u64, outcome: HandlerResult) -> WireMessage {
    match outcome {
        Ok(result) => WireMessage::Success { id, result },
        Err(error) => WireMessage::Error { id, error },
    }
}
