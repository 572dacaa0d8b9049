//! Reference-counted sharing of one worker across multiple consumers.
//!
//! A [`WorkerHandle`] owns the consumer count and nothing else: readiness
//! and disconnection are driven purely by the count crossing zero, while
//! the call surface stays usable through the underlying connection at any
//! count.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::DEFAULT_CALL_TIMEOUT;
use crate::connection::{ConnectionStatus, WorkerConnection};
use crate::endpoint::WorkerFactory;
use crate::proxy::WorkerProxy;

/// Reference-counted owner of one lazily connected worker.
///
/// Interleavings such as acquire, acquire, release, release keep the worker
/// alive until the last release; the count is the sole arbiter of
/// connect/disconnect.
pub struct WorkerHandle {
    factory: Arc<dyn WorkerFactory>,
    ctor_args: Vec<serde_json::Value>,
    call_timeout: Duration,
    slot: Mutex<HandleSlot>,
}

/// Lazily created connection and surface, plus the consumer count.
#[derive(Default)]
struct HandleSlot {
    connection: Option<WorkerConnection>,
    proxy: Option<Arc<WorkerProxy>>,
    refs: i64,
}

impl WorkerHandle {
    /// Create a handle for a worker constructed with the given arguments.
    ///
    /// Nothing is spawned until a consumer acquires the worker and a call
    /// is requested.
    pub fn new(factory: Arc<dyn WorkerFactory>, ctor_args: Vec<serde_json::Value>) -> Self {
        Self::with_timeout(factory, ctor_args, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a handle with a custom per-call timeout.
    pub fn with_timeout(
        factory: Arc<dyn WorkerFactory>,
        ctor_args: Vec<serde_json::Value>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            ctor_args,
            call_timeout,
            slot: Mutex::new(HandleSlot::default()),
        }
    }

    /// Current connection state; `Disconnected` before any connection has
    /// been created.
    pub fn state(&self) -> ConnectionStatus {
        let slot = self.slot.lock().expect("lock poisoned");
        slot.connection
            .as_ref()
            .map(WorkerConnection::status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    /// Current number of registered consumers.
    pub fn ref_count(&self) -> i64 {
        self.slot.lock().expect("lock poisoned").refs
    }

    /// Get the callable surface without affecting the reference count or
    /// triggering a connection. Calls issued through it queue until a
    /// consumer acquires the worker.
    pub fn proxy(&self) -> Arc<WorkerProxy> {
        let mut slot = self.slot.lock().expect("lock poisoned");
        self.ensure(&mut slot).1
    }

    /// Register a consumer and return the callable surface.
    ///
    /// Any resulting positive count signals readiness on the connection,
    /// which is idempotent once the machine has left `disconnected`.
    pub fn acquire(&self) -> Arc<WorkerProxy> {
        let mut slot = self.slot.lock().expect("lock poisoned");
        let (connection, proxy) = self.ensure(&mut slot);
        slot.refs += 1;
        if slot.refs > 0 {
            connection.ready();
        }
        proxy
    }

    /// Unregister a consumer.
    ///
    /// When the count reaches zero the connection is told to disconnect;
    /// decrementing below zero is permitted and has no further effect
    /// beyond that signal. A release before any connection exists does
    /// nothing.
    pub fn release(&self) {
        let mut slot = self.slot.lock().expect("lock poisoned");
        let Some(connection) = slot.connection.clone() else {
            return;
        };
        slot.refs -= 1;
        if slot.refs <= 0 {
            connection.disconnect();
        }
    }

    /// Lazily create the shared connection and surface.
    fn ensure(&self, slot: &mut HandleSlot) -> (WorkerConnection, Arc<WorkerProxy>) {
        let connection = slot
            .connection
            .get_or_insert_with(|| {
                WorkerConnection::with_timeout(
                    self.factory.clone(),
                    self.ctor_args.clone(),
                    self.call_timeout,
                )
            })
            .clone();
        let proxy = slot
            .proxy
            .get_or_insert_with(|| Arc::new(WorkerProxy::new(connection.clone())))
            .clone();
        (connection, proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkerHandle>();
    }
}
