//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Connector`/`Connection` traits. A [`MemoryHub`] plays both roles a Celery
//! deployment needs: the broker that receives task messages and the result
//! backend workers write to.
//!
//! ## Reference Semantics
//!
//! - `publish_to_exchange()` records the message and returns `true`, unless
//!   the hub was told to reject publishes, in which case it returns `false`
//!   (a negative acknowledgement).
//! - `fetch_result()` returns the stored result for a task id, or `None`.
//!   Lookups are non-destructive.
//! - Delivery is deterministic within a single process.
//!
//! ## Non-Goals
//!
//! This transport does not execute tasks or emulate the failure modes of any
//! specific broker. Tests act as the worker by calling
//! [`MemoryHub::complete`] or [`MemoryHub::store_result`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::{
    // ---
    log_debug,
    CeleryError,
    Connection,
    ConnectionDescriptor,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    PublishOptions,
    Result,
    ResultBody,
    ResultMessage,
    TransportKind,
};

/// A task message captured by a [`MemoryHub`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub options: PublishOptions,
}

impl PublishedMessage {
    /// Decode the body as JSON.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[derive(Default)]
struct HubState {
    published: Vec<PublishedMessage>,
    results: HashMap<String, ResultMessage>,
    reject_publishes: bool,
    refuse_connections: bool,
}

/// Shared in-process broker and result backend.
///
/// All memory connections created from the same hub see each other's
/// messages and results, exactly as clients of one real broker would.
///
/// # ⚠️  Testing Only - Subject to Change
///
/// The inspection and fault-injection methods exist for tests. Production
/// code should go through [`TaskPublisherBuilder`](crate::TaskPublisherBuilder).
///
/// ```
/// use mom_celery::{MemoryConnector, MemoryHub};
///
/// let hub = MemoryHub::new();
/// let connector = MemoryConnector::with_hub(hub.clone());
/// assert_eq!(hub.connection_count(), 0);
/// # let _ = connector;
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    connections: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // A panic while holding the lock cannot leave HubState half-updated,
    // so a poisoned lock is still usable.
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a raw result record for `task_id`, replacing any previous one.
    pub fn store_result(&self, task_id: &str, message: ResultMessage) {
        log_debug!("memory hub: result stored for {task_id}");
        self.state().results.insert(task_id.to_string(), message);
    }

    /// Store a result the way a worker would: JSON-encoded body.
    pub fn complete(&self, task_id: &str, body: &ResultBody) -> Result<()> {
        let json = serde_json::to_vec(body)?;
        self.store_result(task_id, ResultMessage::json(json));
        Ok(())
    }

    /// Every task message published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    /// Remove and return every task message published so far, oldest first.
    ///
    /// Consumers of a long-lived hub (such as the global one) drain it so
    /// the message log stays bounded.
    pub fn drain_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut self.state().published)
    }

    /// Make subsequent publishes return a negative acknowledgement.
    pub fn reject_publishes(&self, reject: bool) {
        self.state().reject_publishes = reject;
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Number of successful connections opened against this hub.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of `fetch_result` calls served by this hub.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn open(&self, descriptor: &ConnectionDescriptor) -> Result<usize> {
        // ---
        if self.state().refuse_connections {
            return Err(CeleryError::Connection(format!(
                "memory: connection to {} refused",
                descriptor.endpoint()
            )));
        }
        Ok(self.connections.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn publish(&self, exchange: &str, body: Bytes, opts: &PublishOptions) -> bool {
        // ---
        let mut state = self.state();
        if state.reject_publishes {
            return false;
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: opts.routing_key.clone(),
            body,
            options: opts.clone(),
        });
        true
    }

    fn fetch(&self, task_id: &str) -> Option<ResultMessage> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.state().results.get(task_id).cloned()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
            connections: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
        }
    }
}

/// Process-global hub used by [`MemoryConnector::global`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// Connector producing connections to a [`MemoryHub`].
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

impl MemoryConnector {
    /// Connector bound to the process-global hub.
    ///
    /// All connectors created this way share one hub, matching the semantics
    /// of clients connected to a single real broker.
    pub fn global() -> ConnectorPtr {
        Self::with_hub(global_hub())
    }

    /// Connector bound to the given hub, for isolated parallel tests.
    pub fn with_hub(hub: Arc<MemoryHub>) -> ConnectorPtr {
        Arc::new(Self { hub })
    }

    /// The hub behind the process-global connector.
    pub fn global_hub() -> Arc<MemoryHub> {
        global_hub()
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionPtr> {
        // ---
        let connection_id = self.hub.open(descriptor)?;
        log_debug!("memory: connection #{connection_id} to {}", descriptor.endpoint());

        Ok(Arc::new(MemoryConnection {
            connection_id,
            hub: Arc::clone(&self.hub),
        }))
    }
}

struct MemoryConnection {
    connection_id: usize,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn publish_to_exchange(
        &self,
        descriptor: &ConnectionDescriptor,
        body: Bytes,
        opts: &PublishOptions,
    ) -> Result<bool> {
        // ---
        let accepted = self.hub.publish(descriptor.exchange(), body, opts);
        log_debug!(
            "memory #{}: publish to {}/{} accepted={accepted}",
            self.connection_id,
            descriptor.exchange(),
            opts.routing_key
        );
        Ok(accepted)
    }

    async fn fetch_result(&self, task_id: &str, _expiry: Duration) -> Result<Option<ResultMessage>> {
        Ok(self.hub.fetch(task_id))
    }

    async fn close(&self) -> Result<()> {
        log_debug!("memory #{}: closed", self.connection_id);
        Ok(())
    }
}
