//! # Tether
//!
//! Lazy, reference-counted lifecycle management for out-of-process
//! workers, exposing their methods as local async calls.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      WorkerHandle (ref-counted)                  │
//! │   acquire()/release() translate the consumer count into          │
//! │   readiness/disconnection signals                                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 WorkerConnection (state machine)                 │
//! │   disconnected | blocked | ready | connecting | connected        │
//! │   defers construction until a call was requested AND the         │
//! │   consumer acquired the worker; queues early callers on one      │
//! │   shared pending future                                          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  WorkerChannel (multiplexer)                     │
//! │   tagged call envelopes out, id-correlated responses back,       │
//! │   bulk rejection on context fault                                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!                      Endpoint (WorkerFactory)
//!                                │
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │       Worker execution context (child process, test host)       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether::{ProcessFactory, WorkerHandle};
//!
//! let factory = Arc::new(ProcessFactory::new("./tether-worker"));
//! let handle = WorkerHandle::new(factory, vec![json!({"precision": 2})]);
//!
//! // Calls may be issued before acquisition; they queue until a
//! // consumer commits to the worker's startup cost.
//! let proxy = handle.acquire();
//! let sum = proxy.call("add", vec![json!(1), json!(2)]).await?;
//!
//! handle.release(); // last release tears the worker down
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod process;
pub mod protocol;
pub mod proxy;
pub mod testing;

pub use channel::{WorkerChannel, DEFAULT_CALL_TIMEOUT};
pub use config::{Settings, SettingsError, WorkerSettings};
pub use connection::{ConnectionStatus, WorkerConnection};
pub use endpoint::{ContextHandle, Endpoint, EndpointEvent, WorkerFactory};
pub use error::{WorkerError, WorkerResult};
pub use handle::WorkerHandle;
pub use process::ProcessFactory;
pub use protocol::{WireMessage, CONSTRUCTOR_METHOD};
pub use proxy::{RemoteMethod, WorkerProxy};
