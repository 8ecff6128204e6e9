//! Task submission.
//!
//! A [`TaskPublisher`] owns one broker connection and publishes Celery task
//! messages to the configured exchange. Each submission may return an
//! [`AsyncResult`] bound to the result backend.

use std::sync::Arc;

use crate::{
    // ---
    create_connector,
    log_debug,
    log_info,
    log_warn,
    AsyncResult,
    CeleryError,
    ConnectionDescriptor,
    ConnectionPtr,
    ConnectorPtr,
    DeliveryMode,
    PublishOptions,
    Result,
    TaskArgs,
    TaskId,
    TaskMessage,
    TransportCatalog,
    DEFAULT_BINDING,
    TASK_CONTENT_ENCODING,
    TASK_CONTENT_TYPE,
};

/// Per-submission options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Return a result handle. Default: `true`.
    pub create_handle: bool,
    /// Routing key. Default: `celery`.
    pub routing_key: Option<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            create_handle: true,
            routing_key: None,
        }
    }
}

impl SubmitOptions {
    /// Fire-and-forget: publish without creating a result handle.
    pub fn no_handle() -> Self {
        Self {
            create_handle: false,
            routing_key: None,
        }
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

/// Outcome of a successful [`TaskPublisher::submit`].
#[derive(Debug)]
pub enum Submission {
    /// The broker accepted the task; here is its result handle.
    Handle(AsyncResult),
    /// The broker accepted the task; no handle was requested.
    Accepted(TaskId),
}

impl Submission {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Submission::Handle(handle) => handle.id(),
            Submission::Accepted(id) => id,
        }
    }

    /// The result handle, if one was requested.
    pub fn into_handle(self) -> Option<AsyncResult> {
        match self {
            Submission::Handle(handle) => Some(handle),
            Submission::Accepted(_) => None,
        }
    }
}

/// Builder for [`TaskPublisher`].
///
/// # Examples
///
/// ```no_run
/// use mom_celery::{ConnectionOptions, TaskArgs, TaskPublisherBuilder};
/// use serde_json::json;
///
/// # async fn example() -> mom_celery::Result<()> {
/// let broker = ConnectionOptions::new()
///     .host("rabbit.internal")
///     .persistent_messages(true)
///     .result_expire_secs(3600)
///     .normalize()?;
///
/// let publisher = TaskPublisherBuilder::new(broker).build().await?;
///
/// let handle = publisher
///     .post_task("tasks.add", TaskArgs::from_value(json!([2, 3]))?)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct TaskPublisherBuilder {
    // ---
    broker: ConnectionDescriptor,
    backend: Option<ConnectionDescriptor>,
    catalog: TransportCatalog,

    // Explicit connectors bypass catalog resolution
    broker_connector: Option<ConnectorPtr>,
    backend_connector: Option<ConnectorPtr>,
}

impl TaskPublisherBuilder {
    /// Create a builder for the given broker descriptor.
    ///
    /// Unless [`.backend()`](Self::backend) is set, results are read from
    /// the same server as the broker.
    pub fn new(broker: ConnectionDescriptor) -> Self {
        // ---
        Self {
            broker,
            backend: None,
            catalog: TransportCatalog::installed(),
            broker_connector: None,
            backend_connector: None,
        }
    }

    /// Read results from a separate backend.
    pub fn backend(mut self, backend: ConnectionDescriptor) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the catalog used to resolve `auto` selectors.
    ///
    /// Default: [`TransportCatalog::installed`].
    pub fn catalog(mut self, catalog: TransportCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Use `connector` for both broker and backend.
    pub fn connector(mut self, connector: ConnectorPtr) -> Self {
        self.broker_connector = Some(connector.clone());
        self.backend_connector = Some(connector);
        self
    }

    /// Use `connector` for the result backend only.
    pub fn backend_connector(mut self, connector: ConnectorPtr) -> Self {
        self.backend_connector = Some(connector);
        self
    }

    fn connector_for(&self, explicit: &Option<ConnectorPtr>, descriptor: &ConnectionDescriptor) -> Result<ConnectorPtr> {
        // ---
        match explicit {
            Some(connector) => Ok(connector.clone()),
            None => create_connector(self.catalog.resolve(descriptor)?),
        }
    }

    /// Build the publisher, connecting to the broker eagerly.
    ///
    /// # Errors
    ///
    /// - [`CeleryError::NoTransportAvailable`] when no transport fits.
    /// - [`CeleryError::Connection`] when the broker is unreachable.
    pub async fn build(self) -> Result<TaskPublisher> {
        // ---
        let broker_connector = self.connector_for(&self.broker_connector, &self.broker)?;
        let backend_connector = match &self.backend {
            Some(backend) => self.connector_for(&self.backend_connector, backend)?,
            None => self.connector_for(&self.backend_connector, &self.broker)?,
        };

        let connection = broker_connector.connect(&self.broker).await?;

        log_info!(
            "task publisher ready: broker {} via {}, results via {}",
            self.broker.endpoint(),
            broker_connector.kind(),
            backend_connector.kind()
        );

        let broker = Arc::new(self.broker);
        let backend = match self.backend {
            Some(backend) => Arc::new(backend),
            None => Arc::clone(&broker),
        };

        Ok(TaskPublisher {
            broker,
            backend,
            connection,
            backend_connector,
        })
    }
}

/// Publishes Celery tasks through one broker connection.
pub struct TaskPublisher {
    // ---
    broker: Arc<ConnectionDescriptor>,
    backend: Arc<ConnectionDescriptor>,
    connection: ConnectionPtr,
    backend_connector: ConnectorPtr,
}

impl TaskPublisher {
    /// Shorthand for [`TaskPublisherBuilder::new`] followed by `build()`.
    pub async fn connect(broker: ConnectionDescriptor) -> Result<Self> {
        TaskPublisherBuilder::new(broker).build().await
    }

    pub fn broker(&self) -> &Arc<ConnectionDescriptor> {
        &self.broker
    }

    pub fn backend(&self) -> &Arc<ConnectionDescriptor> {
        &self.backend
    }

    /// Submit a task.
    ///
    /// Publishes `{id, task, args, kwargs}` under a freshly generated id. The
    /// message is persistent when the broker descriptor asks for it. Publish
    /// is at-most-once: a rejected message is reported, never retried.
    ///
    /// With `create_handle` set, a result handle connected to the backend is
    /// returned; otherwise no backend connection is made.
    ///
    /// # Errors
    ///
    /// - [`CeleryError::Publish`] when the broker does not confirm the message.
    /// - [`CeleryError::Connection`] / [`CeleryError::Transport`] on I/O failure.
    pub async fn submit(&self, task_name: &str, args: TaskArgs, opts: SubmitOptions) -> Result<Submission> {
        // ---
        let task_id = TaskId::generate();
        let body = TaskMessage::new(&task_id, task_name, &args).to_body()?;

        // Transient messages leave the property unset.
        let delivery_mode = self
            .broker
            .persistent_messages()
            .then_some(DeliveryMode::Persistent);

        let publish_opts = PublishOptions {
            routing_key: opts.routing_key.unwrap_or_else(|| DEFAULT_BINDING.to_string()),
            content_type: TASK_CONTENT_TYPE.into(),
            content_encoding: TASK_CONTENT_ENCODING.into(),
            delivery_mode,
            immediate: false,
        };

        let accepted = self
            .connection
            .publish_to_exchange(&self.broker, body, &publish_opts)
            .await?;

        if !accepted {
            log_warn!("broker rejected task {task_name} ({task_id})");
            return Err(CeleryError::Publish {
                task_id: task_id.to_string(),
                task_name: task_name.to_string(),
            });
        }

        log_debug!(
            "published {task_name} ({task_id}) to {}/{}",
            self.broker.exchange(),
            publish_opts.routing_key
        );

        if !opts.create_handle {
            return Ok(Submission::Accepted(task_id));
        }

        let handle = AsyncResult::connect(
            task_id,
            self.backend.clone(),
            &self.backend_connector,
            Some(task_name.to_string()),
            Some(args),
        )
        .await?;

        Ok(Submission::Handle(handle))
    }

    /// Submit a task with default options and return its result handle.
    pub async fn post_task(&self, task_name: &str, args: TaskArgs) -> Result<AsyncResult> {
        // ---
        match self.submit(task_name, args, SubmitOptions::default()).await? {
            Submission::Handle(handle) => Ok(handle),
            Submission::Accepted(task_id) => Err(CeleryError::Configuration(format!(
                "task {task_id} was accepted without a result handle"
            ))),
        }
    }

    /// Release the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}

impl std::fmt::Debug for TaskPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPublisher")
            .field("broker", &self.broker)
            .field("transport", &self.connection.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{ConnectionOptions, MemoryConnector, MemoryHub, TransportKind};
    use serde_json::json;

    async fn publisher(hub: &Arc<MemoryHub>, options: ConnectionOptions) -> TaskPublisher {
        TaskPublisherBuilder::new(options.normalize().unwrap())
            .connector(MemoryConnector::with_hub(hub.clone()))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_routing_key_defaults_to_celery() {
        // ---
        let hub = MemoryHub::new();
        let p = publisher(&hub, ConnectionOptions::new().binding("jobs")).await;

        p.submit("tasks.noop", TaskArgs::none(), SubmitOptions::no_handle())
            .await
            .unwrap();
        p.submit(
            "tasks.noop",
            TaskArgs::none(),
            SubmitOptions::no_handle().routing_key("priority"),
        )
        .await
        .unwrap();

        let sent = hub.published();
        assert_eq!(sent[0].routing_key, "celery");
        assert_eq!(sent[1].routing_key, "priority");
        assert_eq!(sent[0].exchange, "celery");
    }

    #[tokio::test]
    async fn test_message_headers() {
        // ---
        let hub = MemoryHub::new();
        let p = publisher(&hub, ConnectionOptions::new()).await;

        p.submit("tasks.add", TaskArgs::positional(vec![json!(1)]), SubmitOptions::no_handle())
            .await
            .unwrap();

        let opts = &hub.published()[0].options;
        assert_eq!(opts.content_type, "application/json");
        assert_eq!(opts.content_encoding, "UTF-8");
        assert_eq!(opts.delivery_mode, None);
        assert!(!opts.immediate);
    }

    #[tokio::test]
    async fn test_submission_ids_are_unique() {
        // ---
        let hub = MemoryHub::new();
        let p = publisher(&hub, ConnectionOptions::new()).await;

        let mut ids = std::collections::HashSet::new();
        for _ in 0..50 {
            let s = p
                .submit("tasks.noop", TaskArgs::none(), SubmitOptions::no_handle())
                .await
                .unwrap();
            assert!(ids.insert(s.task_id().clone()));
        }
    }

    #[tokio::test]
    async fn test_empty_catalog_fails_build() {
        // ---
        let err = TaskPublisherBuilder::new(ConnectionOptions::new().normalize().unwrap())
            .catalog(TransportCatalog::empty())
            .build()
            .await
            .unwrap_err();

        assert!(matches!(err, CeleryError::NoTransportAvailable(_)));
    }

    #[tokio::test]
    async fn test_handle_keeps_task_metadata() {
        // ---
        let hub = MemoryHub::new();
        let p = publisher(&hub, ConnectionOptions::new()).await;

        let h = p
            .post_task("tasks.add", TaskArgs::positional(vec![json!(2), json!(3)]))
            .await
            .unwrap();

        assert_eq!(h.task_name(), Some("tasks.add"));
        assert_eq!(h.task_args().unwrap().args(), &[json!(2), json!(3)]);
        assert!(format!("{h:?}").contains(&format!("{:?}", TransportKind::Memory)));
    }

    #[tokio::test]
    async fn test_backend_shares_broker_descriptor() {
        // ---
        let hub = MemoryHub::new();
        let p = publisher(&hub, ConnectionOptions::new()).await;
        assert!(Arc::ptr_eq(p.broker(), p.backend()));

        let separate = TaskPublisherBuilder::new(ConnectionOptions::new().normalize().unwrap())
            .backend(ConnectionOptions::new().host("results").normalize().unwrap())
            .connector(MemoryConnector::with_hub(hub.clone()))
            .build()
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(separate.broker(), separate.backend()));
        assert_eq!(separate.backend().host(), "results");
    }
}
