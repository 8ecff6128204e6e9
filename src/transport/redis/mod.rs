//! Redis protocol transports.
//!
//! This module contains transport implementations for Redis.
//! Currently supports:
//! - redis - kombu-compatible list broker and Celery key/value result backend

#[cfg(feature = "transport_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "transport_redis")]
pub use redis::create_connector as create_redis_connector;

#[cfg(not(feature = "transport_redis"))]
pub fn create_redis_connector() -> crate::Result<crate::ConnectorPtr> {
    Err(crate::CeleryError::NoTransportAvailable(
        "transport_redis feature is not enabled".into(),
    ))
}
