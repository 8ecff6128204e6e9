//! Celery task client over AMQP and Redis
//!
//! This library publishes tasks to a Celery broker and polls the result
//! backend for their outcome. It handles task id generation, argument
//! encoding, transport selection, and timeout-bounded result waiting.
//!
//! ```no_run
//! use mom_celery::{ConnectionOptions, TaskArgs, TaskPublisher};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> mom_celery::Result<()> {
//! let publisher = TaskPublisher::connect(ConnectionOptions::new().normalize()?).await?;
//!
//! let mut handle = publisher
//!     .post_task("tasks.add", TaskArgs::from_value(json!([2, 3]))?)
//!     .await?;
//!
//! let sum = handle.get(Duration::from_secs(5), Duration::from_millis(100)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Transports are feature-gated: `transport_lapin` (default) for AMQP,
//! `transport_redis` and `transport_redis_tls` for Redis. An in-process
//! memory transport is always available for tests.

// Import all sub modules once...
mod connection;
mod domain;
mod macros;
mod transport;

mod publisher;
mod result;

mod error;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use publisher::{SubmitOptions, Submission, TaskPublisher, TaskPublisherBuilder};
pub use result::{AsyncResult, HandleSnapshot, Resolution, DEFAULT_GET_TIMEOUT, DEFAULT_POLL_INTERVAL};

pub use connection::{
    //
    ConnectionDescriptor,
    ConnectionOptions,
    TlsOptions,
    TransportSelector,
    DEFAULT_AMQP_PORT,
    DEFAULT_BINDING,
    DEFAULT_EXCHANGE,
    DEFAULT_HOST,
    DEFAULT_LOGIN,
    DEFAULT_PASSWORD,
    DEFAULT_REDIS_PORT,
    DEFAULT_VHOST,
};

pub use error::{CeleryError, Result};

pub use transport::{
    //
    create_connector,
    create_lapin_connector,
    create_redis_connector,
    CatalogEntry,
    MemoryConnector,
    MemoryHub,
    PublishedMessage,
    TransportCatalog,
};

// --- public re-exports
pub use domain::{
    //
    Connection,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    DeliveryMode,
    PublishOptions,
    ResultBody,
    ResultMessage,
    TaskArgs,
    TaskId,
    TaskMessage,
    TaskStatus,
    TransportKind,
    TASK_CONTENT_ENCODING,
    TASK_CONTENT_TYPE,
};
