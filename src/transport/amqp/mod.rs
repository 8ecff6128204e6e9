//! AMQP protocol transports.
//!
//! This module contains transport implementations for AMQP-based brokers.
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ), broker and Celery `amqp` result backend

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use lapin::create_connector as create_lapin_connector;

#[cfg(not(feature = "transport_lapin"))]
pub fn create_lapin_connector() -> crate::Result<crate::ConnectorPtr> {
    Err(crate::CeleryError::NoTransportAvailable(
        "transport_lapin feature is not enabled".into(),
    ))
}
