//! Asynchronous task results.
//!
//! An [`AsyncResult`] tracks one submitted task. It owns its own backend
//! connection and moves through a two-state machine:
//!
//! ```text
//!   Unresolved ──is_ready() finds a result──▶ Resolved(status)
//! ```
//!
//! [`AsyncResult::is_ready`] is the only method that touches the network or
//! changes state. Once resolved, the decoded result is cached for the life of
//! the handle and never fetched again; every accessor is then a pure read.
//!
//! Waiting is coarse polling: [`AsyncResult::get`] calls `is_ready()` every
//! `interval` until the result appears or `timeout` elapses. Added latency is
//! bounded by one interval, and no per-task subscription is held open.
//! Dropping the `get` future cancels the wait.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Instant};

use crate::{
    // ---
    create_connector,
    log_debug,
    CeleryError,
    ConnectionDescriptor,
    ConnectionPtr,
    ConnectorPtr,
    Result,
    ResultBody,
    ResultMessage,
    TaskArgs,
    TaskId,
    TaskStatus,
    TransportCatalog,
};

/// Default `get()` timeout.
pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between polls in `get()`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where a handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No result observed yet.
    Unresolved,
    /// A result was observed and cached; terminal.
    Resolved(TaskStatus),
}

struct Resolved {
    // None when revived from a snapshot
    raw: Option<ResultMessage>,
    body: ResultBody,
}

/// Serializable identity of a result handle.
///
/// Lets an application persist a handle (e.g. across a process restart) and
/// revive it with [`AsyncResult::from_snapshot`]. A handle that was already
/// resolved keeps its cached result and is not fetched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub task_id: TaskId,
    pub task_name: Option<String>,
    pub task_args: Option<TaskArgs>,
    pub descriptor: ConnectionDescriptor,
    pub result: Option<ResultBody>,
}

/// Handle to the outcome of one submitted task.
///
/// # Example
///
/// ```no_run
/// # use mom_celery::{TaskPublisher, TaskArgs};
/// # use std::time::Duration;
/// # async fn example(publisher: &TaskPublisher) -> mom_celery::Result<()> {
/// let mut handle = publisher
///     .post_task("tasks.add", TaskArgs::from_value(serde_json::json!([2, 3]))?)
///     .await?;
///
/// let sum = handle
///     .get(Duration::from_secs(5), Duration::from_millis(200))
///     .await?;
/// println!("{} -> {sum}", handle.status()?);
/// # Ok(())
/// # }
/// ```
pub struct AsyncResult {
    // ---
    task_id: TaskId,
    descriptor: Arc<ConnectionDescriptor>,
    connection: ConnectionPtr,
    resolved: Option<Resolved>,

    // Diagnostics only
    task_name: Option<String>,
    task_args: Option<TaskArgs>,
}

impl AsyncResult {
    /// Connect a new handle through `connector`.
    pub(crate) async fn connect(
        task_id: TaskId,
        descriptor: Arc<ConnectionDescriptor>,
        connector: &ConnectorPtr,
        task_name: Option<String>,
        task_args: Option<TaskArgs>,
    ) -> Result<Self> {
        // ---
        let connection = connector.connect(&descriptor).await?;

        Ok(Self {
            task_id,
            descriptor,
            connection,
            resolved: None,
            task_name,
            task_args,
        })
    }

    /// Rebuild a handle for a known task id, connecting eagerly.
    ///
    /// The transport is resolved from the descriptor's selector and the
    /// installed [`TransportCatalog`].
    pub async fn rehydrate(
        task_id: impl Into<TaskId>,
        descriptor: Arc<ConnectionDescriptor>,
    ) -> Result<Self> {
        // ---
        let kind = TransportCatalog::installed().resolve(&descriptor)?;
        let connector = create_connector(kind)?;
        Self::rehydrate_with(task_id, descriptor, &connector).await
    }

    /// Rebuild a handle for a known task id through an explicit connector.
    pub async fn rehydrate_with(
        task_id: impl Into<TaskId>,
        descriptor: Arc<ConnectionDescriptor>,
        connector: &ConnectorPtr,
    ) -> Result<Self> {
        Self::connect(task_id.into(), descriptor, connector, None, None).await
    }

    /// Capture everything needed to revive this handle later.
    pub fn snapshot(&self) -> HandleSnapshot {
        // ---
        HandleSnapshot {
            task_id: self.task_id.clone(),
            task_name: self.task_name.clone(),
            task_args: self.task_args.clone(),
            descriptor: (*self.descriptor).clone(),
            result: self.resolved.as_ref().map(|r| r.body.clone()),
        }
    }

    /// Revive a persisted handle, reconnecting to its backend eagerly.
    pub async fn from_snapshot(snapshot: HandleSnapshot) -> Result<Self> {
        // ---
        let kind = TransportCatalog::installed().resolve(&snapshot.descriptor)?;
        let connector = create_connector(kind)?;
        Self::from_snapshot_with(snapshot, &connector).await
    }

    /// Revive a persisted handle through an explicit connector.
    pub async fn from_snapshot_with(snapshot: HandleSnapshot, connector: &ConnectorPtr) -> Result<Self> {
        // ---
        let mut handle = Self::connect(
            snapshot.task_id,
            Arc::new(snapshot.descriptor),
            connector,
            snapshot.task_name,
            snapshot.task_args,
        )
        .await?;

        handle.resolved = snapshot.result.map(|body| Resolved { raw: None, body });
        Ok(handle)
    }

    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_name(&self) -> Option<&str> {
        self.task_name.as_deref()
    }

    pub fn task_args(&self) -> Option<&TaskArgs> {
        self.task_args.as_ref()
    }

    pub fn descriptor(&self) -> &Arc<ConnectionDescriptor> {
        &self.descriptor
    }

    pub fn resolution(&self) -> Resolution {
        match &self.resolved {
            Some(r) => Resolution::Resolved(r.body.status),
            None => Resolution::Unresolved,
        }
    }

    /// Check whether the task's result is available.
    ///
    /// A resolved handle answers from its cache without network access.
    /// Otherwise this performs exactly one backend lookup; a found result
    /// with a status other than `PENDING` is decoded, cached, and resolves
    /// the handle.
    ///
    /// # Errors
    ///
    /// A result that cannot be decoded fails every call until the backend
    /// holds a readable one; it is never consumed by a failed decode.
    pub async fn is_ready(&mut self) -> Result<bool> {
        // ---
        if self.resolved.is_some() {
            return Ok(true);
        }

        let fetched = self
            .connection
            .fetch_result(self.task_id.as_str(), self.descriptor.result_expire())
            .await?;

        let Some(raw) = fetched else {
            log_debug!("task {} not ready", self.task_id);
            return Ok(false);
        };

        let body = ResultBody::decode(&raw)?;
        if body.status == TaskStatus::Pending {
            log_debug!("task {} reported PENDING", self.task_id);
            return Ok(false);
        }

        log_debug!("task {} resolved: {}", self.task_id, body.status);
        self.resolved = Some(Resolved {
            raw: Some(raw),
            body,
        });
        Ok(true)
    }

    /// Alias of [`is_ready`](Self::is_ready).
    pub async fn ready(&mut self) -> Result<bool> {
        self.is_ready().await
    }

    fn resolved(&self, accessor: &'static str) -> Result<&ResultBody> {
        // ---
        self.resolved
            .as_ref()
            .map(|r| &r.body)
            .ok_or_else(|| CeleryError::PrematureAccess {
                task_id: self.task_id.to_string(),
                accessor,
            })
    }

    /// Reported task status.
    ///
    /// # Errors
    ///
    /// [`CeleryError::PrematureAccess`] before `is_ready()` returned `true`.
    pub fn status(&self) -> Result<TaskStatus> {
        Ok(self.resolved("status")?.status)
    }

    /// Result payload, whatever the status.
    ///
    /// For a `FAILURE` this is the worker's serialized exception, returned as
    /// data rather than raised; inspect [`status`](Self::status) to tell them
    /// apart.
    ///
    /// # Errors
    ///
    /// [`CeleryError::PrematureAccess`] before `is_ready()` returned `true`.
    pub fn result(&self) -> Result<&Value> {
        Ok(&self.resolved("result")?.result)
    }

    /// Worker traceback; only meaningful when the status is not `SUCCESS`.
    ///
    /// # Errors
    ///
    /// [`CeleryError::PrematureAccess`] before `is_ready()` returned `true`.
    pub fn traceback(&self) -> Result<Option<&str>> {
        Ok(self.resolved("traceback")?.traceback.as_deref())
    }

    /// The cached raw backend record, once resolved.
    ///
    /// `None` for unresolved handles and for handles revived from a snapshot.
    pub fn raw_result(&self) -> Option<&ResultMessage> {
        self.resolved.as_ref().and_then(|r| r.raw.as_ref())
    }

    /// Whether the task succeeded.
    ///
    /// # Errors
    ///
    /// [`CeleryError::PrematureAccess`] before `is_ready()` returned `true`.
    pub fn is_success(&self) -> Result<bool> {
        Ok(self.status()? == TaskStatus::Success)
    }

    /// Alias of [`is_success`](Self::is_success).
    pub fn successful(&self) -> Result<bool> {
        self.is_success()
    }

    /// `true` when the task is ready and did not succeed.
    pub async fn failed(&mut self) -> Result<bool> {
        Ok(self.is_ready().await? && !self.is_success()?)
    }

    /// Current state without I/O; `PENDING` until resolved.
    pub fn state(&self) -> TaskStatus {
        match self.resolution() {
            Resolution::Resolved(status) => status,
            Resolution::Unresolved => TaskStatus::Pending,
        }
    }

    /// Result payload without I/O; `None` until resolved.
    pub fn result_if_ready(&self) -> Option<&Value> {
        self.resolved.as_ref().map(|r| &r.body.result)
    }

    /// Wait for the result and return its payload.
    ///
    /// Polls with [`is_ready`](Self::is_ready), sleeping `interval` between
    /// attempts, until the result arrives or `timeout` (measured from entry)
    /// has elapsed.
    ///
    /// # Errors
    ///
    /// [`CeleryError::ResultTimeout`] when no result arrived in time; any
    /// transport or decode error from the lookups.
    pub async fn get(&mut self, timeout: Duration, interval: Duration) -> Result<Value> {
        // ---
        let started = Instant::now();

        while started.elapsed() < timeout {
            if self.is_ready().await? {
                return self.result().cloned();
            }
            sleep(interval).await;
        }

        // One last look once the deadline has passed.
        if self.is_ready().await? {
            return self.result().cloned();
        }

        log_debug!("task {} timed out after {timeout:?}", self.task_id);

        Err(CeleryError::ResultTimeout {
            task_id: self.task_id.to_string(),
            task_name: self.task_name.clone().unwrap_or_else(|| "<unknown>".into()),
            task_args: self
                .task_args
                .as_ref()
                .map(|args| args.to_string())
                .unwrap_or_default(),
            timeout,
        })
    }

    /// [`get`](Self::get) with a 10 s timeout and 0.5 s poll interval.
    pub async fn get_default(&mut self) -> Result<Value> {
        self.get(DEFAULT_GET_TIMEOUT, DEFAULT_POLL_INTERVAL).await
    }

    /// Deprecated alias of [`get`](Self::get).
    #[deprecated(note = "use `get`")]
    pub async fn wait(&mut self, timeout: Duration, interval: Duration) -> Result<Value> {
        self.get(timeout, interval).await
    }

    /// No-op: this client cannot delete results stored in the backend.
    pub fn forget(&self) {}

    /// No-op: this client cannot signal workers to abort a task.
    pub fn revoke(&self) {}
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("task_id", &self.task_id)
            .field("task_name", &self.task_name)
            .field("transport", &self.connection.kind())
            .field("resolution", &self.resolution())
            .finish()
    }
}
