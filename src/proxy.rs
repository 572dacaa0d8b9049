//! Transparent callable surface over a lazy connection.
//!
//! Worker methods are not declared ahead of time. The proxy keeps a lookup
//! table mapping method names to forwarding handles, created lazily on
//! first use; each handle awaits the current connection attempt and then
//! issues a channel-level call. Only methods that are asynchronous on the
//! remote side can be exposed this way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use crate::connection::WorkerConnection;
use crate::error::{WorkerError, WorkerResult};

/// Callable surface exposing worker methods as local async calls.
pub struct WorkerProxy {
    connection: WorkerConnection,
    /// Lookup table of lazily created method forwarders.
    methods: Mutex<HashMap<String, RemoteMethod>>,
}

impl WorkerProxy {
    pub(crate) fn new(connection: WorkerConnection) -> Self {
        Self {
            connection,
            methods: Mutex::new(HashMap::new()),
        }
    }

    /// The connection backing this surface.
    pub fn connection(&self) -> &WorkerConnection {
        &self.connection
    }

    /// Get the reusable forwarder for a method name, creating it on first
    /// use.
    pub fn method(&self, name: &str) -> RemoteMethod {
        let mut methods = self.methods.lock().expect("lock poisoned");
        methods
            .entry(name.to_string())
            .or_insert_with(|| RemoteMethod {
                name: Arc::from(name),
                connection: self.connection.clone(),
            })
            .clone()
    }

    /// Invoke a worker method by name.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> WorkerResult<serde_json::Value> {
        self.method(method).call(args).await
    }

    /// Invoke a worker method and decode its result into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the result payload does not
    /// deserialize into `R`.
    pub async fn call_decoded<R>(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> WorkerResult<R>
    where
        R: DeserializeOwned,
    {
        let result = self.call(method, args).await?;
        serde_json::from_value(result).map_err(WorkerError::DeserializeFailed)
    }
}

/// Reusable forwarding handle for one named worker method.
///
/// Cloning is cheap. Every invocation awaits the connection's current
/// attempt, so a forwarder obtained while disconnected works unchanged
/// after a reconnect.
#[derive(Clone)]
pub struct RemoteMethod {
    name: Arc<str>,
    connection: WorkerConnection,
}

impl RemoteMethod {
    /// The method name this forwarder targets.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the remote method with the given arguments.
    pub async fn call(&self, args: Vec<serde_json::Value>) -> WorkerResult<serde_json::Value> {
        self.connection.invoke(&self.name, args).await
    }
}
