//! Lazy connection state machine.
//!
//! A [`WorkerConnection`] defers channel construction until two things have
//! happened: a method call was requested, and a consumer signalled that it
//! is actively using the worker. Calls issued early queue on a shared
//! pending future; once both conditions hold, one construction attempt runs
//! and every queued caller awaits the same eventual channel.
//!
//! ```text
//!                  call                ready()
//!   disconnected ───────► blocked ──────────────► connecting ──► connected
//!        │                                            ▲              │
//!        │ ready()              call                  │              │
//!        └──────────► ready ──────────────────────────┘              │
//!        ▲                                                           │
//!        └──────────────────── disconnect() ◄────────────────────────┘
//! ```
//!
//! `disconnect()` cancels the current attempt from any state and returns
//! the machine to `disconnected`; a later cycle builds a fresh channel.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::channel::{WorkerChannel, DEFAULT_CALL_TIMEOUT};
use crate::endpoint::WorkerFactory;
use crate::error::{WorkerError, WorkerResult};
use crate::protocol::CONSTRUCTOR_METHOD;

/// What a finished connection attempt yields: the live channel and the
/// cancellation token governing calls issued through it.
type ConnectOutcome = Result<(Arc<WorkerChannel>, CancellationToken), ConnectError>;

/// Shared pending future letting late-arriving callers await the same
/// eventual channel.
type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// Why a connection attempt produced no channel. Cloneable so every caller
/// sharing the pending future receives it.
#[derive(Debug, Clone)]
enum ConnectError {
    /// The attempt was abandoned by a disconnect signal.
    Cancelled,
    /// Construction itself failed.
    Failed(Arc<WorkerError>),
}

impl From<ConnectError> for WorkerError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Cancelled => WorkerError::Cancelled,
            ConnectError::Failed(inner) => WorkerError::ConstructionFailed(inner),
        }
    }
}

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Resting state; nothing requested, nothing running.
    Disconnected,
    /// Calls are queued but no consumer has acquired the worker yet.
    Blocked,
    /// A consumer acquired the worker before issuing any call.
    Ready,
    /// A construction attempt is running.
    Connecting,
    /// The channel is live and initialized.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Connection state. Each variant carries only what is valid in it, so a
/// channel can never be observed while connecting, nor a resolver while
/// connected.
enum ConnectionState {
    Disconnected,
    /// Calls queue on `pending` until a consumer signals readiness.
    Blocked {
        pending: SharedConnect,
        resolver: oneshot::Sender<ConnectOutcome>,
        cancel: CancellationToken,
    },
    /// Readiness arrived first; the next call starts construction.
    Ready { cancel: CancellationToken },
    /// A construction attempt owns the resolver and will settle `pending`.
    Connecting {
        pending: SharedConnect,
        cancel: CancellationToken,
    },
    Connected {
        channel: Arc<WorkerChannel>,
        cancel: CancellationToken,
    },
}

impl ConnectionState {
    fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Blocked { .. } => ConnectionStatus::Blocked,
            Self::Ready { .. } => ConnectionStatus::Ready,
            Self::Connecting { .. } => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
        }
    }
}

/// Lazily connecting, cancellation-aware connection to one worker.
///
/// Cheap to clone; clones share the same state machine. All transitions are
/// synchronous under an internal lock, so concurrent callers observe the
/// machine atomically.
#[derive(Clone)]
pub struct WorkerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    factory: Arc<dyn WorkerFactory>,
    ctor_args: Vec<serde_json::Value>,
    call_timeout: Duration,
    state: Mutex<ConnectionState>,
}

impl WorkerConnection {
    /// Create a connection with the default call timeout. No context is
    /// spawned until a call has been requested and readiness signalled.
    pub fn new(factory: Arc<dyn WorkerFactory>, ctor_args: Vec<serde_json::Value>) -> Self {
        Self::with_timeout(factory, ctor_args, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a connection with a custom per-call timeout.
    pub fn with_timeout(
        factory: Arc<dyn WorkerFactory>,
        ctor_args: Vec<serde_json::Value>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                factory,
                ctor_args,
                call_timeout,
                state: Mutex::new(ConnectionState::Disconnected),
            }),
        }
    }

    /// Current state of the machine.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().expect("lock poisoned").status()
    }

    /// Signal that a consumer is actively using the worker.
    ///
    /// Moves `disconnected` to `ready`; in `blocked`, queued calls exist,
    /// so construction starts immediately. A no-op in every other state.
    pub fn ready(&self) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        match std::mem::replace(&mut *state, ConnectionState::Disconnected) {
            ConnectionState::Disconnected => {
                *state = ConnectionState::Ready {
                    cancel: CancellationToken::new(),
                };
            }
            ConnectionState::Blocked {
                pending,
                resolver,
                cancel,
            } => {
                *state = ConnectionState::Connecting {
                    pending,
                    cancel: cancel.clone(),
                };
                self.spawn_construction(resolver, cancel);
            }
            other => *state = other,
        }
    }

    /// Signal that no consumer is using the worker any more.
    ///
    /// Cancels the current attempt, rejects queued callers, abandons an
    /// in-flight construction and tears down a live channel. A no-op when
    /// already disconnected.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        match previous {
            ConnectionState::Disconnected => {}
            ConnectionState::Blocked {
                resolver, cancel, ..
            } => {
                cancel.cancel();
                let _ = resolver.send(Err(ConnectError::Cancelled));
            }
            ConnectionState::Ready { cancel } | ConnectionState::Connecting { cancel, .. } => {
                cancel.cancel();
            }
            ConnectionState::Connected { channel, cancel } => {
                cancel.cancel();
                channel.dispose();
            }
        }
    }

    /// Issue a method call through the connection.
    ///
    /// Awaits the current connection attempt per the machine's state, then
    /// issues a channel-level call carrying the attempt's cancellation
    /// token.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> WorkerResult<serde_json::Value> {
        let (channel, cancel) = self.connect().await.map_err(WorkerError::from)?;
        channel.call(method, args, &cancel).await
    }

    /// Drive the machine for a requested call and return the future that
    /// yields the channel to use.
    fn connect(&self) -> SharedConnect {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        match std::mem::replace(&mut *state, ConnectionState::Disconnected) {
            ConnectionState::Disconnected => {
                // First call before any readiness signal: queue it.
                let cancel = CancellationToken::new();
                let (resolver, pending) = pending_pair();
                *state = ConnectionState::Blocked {
                    pending: pending.clone(),
                    resolver,
                    cancel,
                };
                pending
            }
            ConnectionState::Ready { cancel } => {
                let (resolver, pending) = pending_pair();
                *state = ConnectionState::Connecting {
                    pending: pending.clone(),
                    cancel: cancel.clone(),
                };
                self.spawn_construction(resolver, cancel);
                pending
            }
            ConnectionState::Blocked {
                pending,
                resolver,
                cancel,
            } => {
                let shared = pending.clone();
                *state = ConnectionState::Blocked {
                    pending,
                    resolver,
                    cancel,
                };
                shared
            }
            ConnectionState::Connecting { pending, cancel } => {
                let shared = pending.clone();
                *state = ConnectionState::Connecting { pending, cancel };
                shared
            }
            ConnectionState::Connected { channel, cancel } => {
                let resolved =
                    future::ready(Ok((channel.clone(), cancel.clone()))).boxed().shared();
                *state = ConnectionState::Connected { channel, cancel };
                resolved
            }
        }
    }

    /// Run one construction attempt on a background task.
    fn spawn_construction(
        &self,
        resolver: oneshot::Sender<ConnectOutcome>,
        cancel: CancellationToken,
    ) {
        let connection = self.clone();
        tokio::spawn(async move {
            let outcome = connection.construct(&cancel).await;
            connection.finish_construction(resolver, cancel, outcome);
        });
    }

    /// Build the endpoint, wrap it in a channel and run the constructor
    /// call.
    async fn construct(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<WorkerChannel>, ConnectError> {
        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            endpoint = self.inner.factory.create() => {
                endpoint.map_err(|err| ConnectError::Failed(Arc::new(err)))?
            }
        };

        let channel = Arc::new(WorkerChannel::with_timeout(
            endpoint,
            self.inner.call_timeout,
        ));

        // The constructor call is the first envelope on the fresh channel;
        // the worker accepts nothing else until it succeeds.
        match channel
            .call(CONSTRUCTOR_METHOD, self.inner.ctor_args.clone(), cancel)
            .await
        {
            Ok(_) => Ok(channel),
            Err(err) => {
                channel.dispose();
                if err.is_cancelled() {
                    Err(ConnectError::Cancelled)
                } else {
                    Err(ConnectError::Failed(Arc::new(err)))
                }
            }
        }
    }

    /// Commit the outcome of a construction attempt, unless a disconnect
    /// superseded it while it ran.
    fn finish_construction(
        &self,
        resolver: oneshot::Sender<ConnectOutcome>,
        cancel: CancellationToken,
        outcome: Result<Arc<WorkerChannel>, ConnectError>,
    ) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        // A disconnect always cancels the attempt's token before a new
        // attempt can occupy the state, so this identifies our own attempt.
        let current_attempt =
            !cancel.is_cancelled() && matches!(*state, ConnectionState::Connecting { .. });

        match outcome {
            Ok(channel) if current_attempt => {
                *state = ConnectionState::Connected {
                    channel: channel.clone(),
                    cancel: cancel.clone(),
                };
                drop(state);
                debug!("worker channel connected");
                let _ = resolver.send(Ok((channel, cancel)));
            }
            Ok(channel) => {
                // Disconnected while the constructor call was in flight.
                drop(state);
                channel.dispose();
                let _ = resolver.send(Err(ConnectError::Cancelled));
            }
            Err(err) => {
                if current_attempt {
                    *state = ConnectionState::Disconnected;
                }
                drop(state);
                let _ = resolver.send(Err(err));
            }
        }
    }
}

/// Build the resolver half and the shared future half of a pending promise.
/// A dropped resolver settles the future as cancelled.
fn pending_pair() -> (oneshot::Sender<ConnectOutcome>, SharedConnect) {
    let (tx, rx) = oneshot::channel();
    let shared = rx
        .map(|received| received.unwrap_or(Err(ConnectError::Cancelled)))
        .boxed()
        .shared();
    (tx, shared)
}
