// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the connector interface the publisher and result
//! handles use to reach a broker or result backend. It intentionally avoids
//! any reference to concrete protocols or client libraries.
//!
//! A [`Connector`] knows how to open a [`Connection`] for a descriptor. A
//! connection offers exactly two protocol operations:
//!
//! - [`Connection::publish_to_exchange`] hands a serialized task message to
//!   the broker and reports whether the broker accepted it.
//! - [`Connection::fetch_result`] looks up the stored result for a task id.
//!
//! Outcomes that can legitimately be "not yet true" are values, not errors:
//! a negative acknowledgement is `Ok(false)` and a missing result is
//! `Ok(None)`. Only genuine faults are `Err`.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::{CeleryError, ConnectionDescriptor, Result};

/// The closed set of transport adapters this crate knows about.
///
/// Whether a kind is actually usable depends on the cargo features the crate
/// was built with; see [`TransportCatalog`](crate::TransportCatalog).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// AMQP 0-9-1 via `lapin` (RabbitMQ).
    Lapin,
    /// Redis lists for tasks, Redis keys for results.
    Redis,
    /// In-process broker and backend.
    Memory,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Lapin => "lapin",
            TransportKind::Redis => "redis",
            TransportKind::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = CeleryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lapin" | "amqp" => Ok(TransportKind::Lapin),
            "redis" => Ok(TransportKind::Redis),
            "memory" => Ok(TransportKind::Memory),
            other => Err(CeleryError::Configuration(format!(
                "unrecognized transport: {other}, valid values: auto, lapin, amqp, redis, memory"
            ))),
        }
    }
}

/// AMQP delivery mode of a published task message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Broker may drop the message on restart.
    Transient,
    /// Broker persists the message before consumption.
    Persistent,
}

impl DeliveryMode {
    /// Wire value of the `delivery_mode` property.
    pub fn as_u8(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Delivery properties attached to a published task message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Routing key the exchange uses to pick the target queue.
    pub routing_key: String,
    /// MIME type of the body, e.g. `application/json`.
    pub content_type: String,
    /// Character encoding of the body, e.g. `UTF-8`.
    pub content_encoding: String,
    /// `None` leaves the broker default (transient) in place.
    pub delivery_mode: Option<DeliveryMode>,
    /// AMQP `immediate` flag. Always `false` for task messages.
    pub immediate: bool,
}

/// A raw result record as returned by the backend.
///
/// The body is kept undecoded; see [`ResultBody::decode`](crate::ResultBody::decode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMessage {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl ResultMessage {
    /// A JSON result record.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
        }
    }
}

/// A live connection to a broker or result backend.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// The adapter behind this connection.
    fn kind(&self) -> TransportKind;

    /// Publish a serialized task message to the descriptor's exchange.
    ///
    /// Returns `Ok(false)` when the broker negatively acknowledged the
    /// message; the caller decides how to surface that.
    async fn publish_to_exchange(
        &self,
        descriptor: &ConnectionDescriptor,
        body: Bytes,
        opts: &PublishOptions,
    ) -> Result<bool>;

    /// Look up the stored result for `task_id`.
    ///
    /// Returns `Ok(None)` when no result is present yet. `expiry` is the
    /// backend-side lifetime the result store was configured with; adapters
    /// that declare result storage pass it through, others ignore it.
    async fn fetch_result(&self, task_id: &str, expiry: Duration) -> Result<Option<ResultMessage>>;

    /// Close the connection and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn Connection>;

/// Factory for connections of one transport kind.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    // ---
    fn kind(&self) -> TransportKind;

    /// Establish a connection using the descriptor's address, credentials and
    /// TLS options.
    ///
    /// No implicit retry: a failure is returned as
    /// [`CeleryError::Connection`] and the caller decides what to do.
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
