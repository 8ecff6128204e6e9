//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations: the connector interface and the Celery wire
//! entities.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod task;
mod transport;

// --- Task domain re-exports ---

pub use task::{
    //
    ResultBody,
    TaskArgs,
    TaskId,
    TaskMessage,
    TaskStatus,
    TASK_CONTENT_ENCODING,
    TASK_CONTENT_TYPE,
};

// --- Transport domain re-exports ---

pub use transport::{
    //
    Connection,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    DeliveryMode,
    PublishOptions,
    ResultMessage,
    TransportKind,
};
