//! Transport implementations and selection.
//!
//! This module provides the concrete implementations of the domain-level
//! [`Connector`](crate::Connector) trait, the factory that builds a connector
//! for a [`TransportKind`], and the [`TransportCatalog`] that decides which
//! kind to use when a descriptor asks for `auto`.
//!
//! Broker-backed adapters are hidden behind feature flags. A disabled adapter
//! still has a constructor, but it fails with
//! [`CeleryError::NoTransportAvailable`] (Null Object), so selection code
//! never needs its own `cfg` gates.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;
mod redis;

pub use amqp::create_lapin_connector;
pub use memory::{MemoryConnector, MemoryHub, PublishedMessage};
pub use redis::create_redis_connector;

use crate::{
    // ---
    log_debug,
    CeleryError,
    ConnectionDescriptor,
    ConnectorPtr,
    Result,
    TransportKind,
    TransportSelector,
};

/// One transport the catalog may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub kind: TransportKind,
    pub supports_tls: bool,
}

/// Ordered list of transports eligible for automatic selection.
///
/// The default catalog ([`TransportCatalog::installed`]) lists every
/// broker-backed adapter compiled into this build, in priority order. Tests
/// and embedders substitute their own catalog to pin the choice:
///
/// ```
/// use mom_celery::{TransportCatalog, TransportKind};
///
/// let catalog = TransportCatalog::empty().with(TransportKind::Memory, false);
/// assert_eq!(catalog.select_best_available(false).unwrap(), TransportKind::Memory);
/// assert!(catalog.select_best_available(true).is_err());
/// ```
///
/// The in-memory transport is never part of the installed catalog; it is
/// only used when named explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCatalog {
    entries: Vec<CatalogEntry>,
}

impl TransportCatalog {
    /// Catalog with no entries; every automatic selection fails.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adapters compiled into this build: lapin, then redis.
    pub fn installed() -> Self {
        // ---
        let mut catalog = Self::empty();

        if cfg!(feature = "transport_lapin") {
            catalog = catalog.with(TransportKind::Lapin, true);
        }
        if cfg!(feature = "transport_redis") {
            catalog = catalog.with(TransportKind::Redis, cfg!(feature = "transport_redis_tls"));
        }

        catalog
    }

    /// Append an entry with lowest priority.
    pub fn with(mut self, kind: TransportKind, supports_tls: bool) -> Self {
        self.entries.push(CatalogEntry { kind, supports_tls });
        self
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Pick the highest-priority entry that satisfies the TLS requirement.
    ///
    /// # Errors
    ///
    /// [`CeleryError::NoTransportAvailable`] when no entry qualifies.
    pub fn select_best_available(&self, require_tls: bool) -> Result<TransportKind> {
        // ---
        self.entries
            .iter()
            .find(|entry| entry.supports_tls || !require_tls)
            .map(|entry| entry.kind)
            .ok_or_else(|| {
                let wanted = if require_tls { "TLS-capable " } else { "" };
                CeleryError::NoTransportAvailable(format!(
                    "no {wanted}transport installed (candidates: {:?})",
                    self.entries.iter().map(|e| e.kind).collect::<Vec<_>>()
                ))
            })
    }

    /// Resolve the descriptor's selector to a concrete kind.
    ///
    /// An explicit selector wins over the catalog; `auto` asks the catalog,
    /// requiring TLS when the descriptor enables it.
    pub fn resolve(&self, descriptor: &ConnectionDescriptor) -> Result<TransportKind> {
        // ---
        let kind = match descriptor.transport() {
            TransportSelector::Kind(kind) => kind,
            TransportSelector::Auto => self.select_best_available(descriptor.tls().enabled)?,
        };

        log_debug!("resolved transport {kind} for {}", descriptor.endpoint());
        Ok(kind)
    }
}

impl Default for TransportCatalog {
    fn default() -> Self {
        Self::installed()
    }
}

/// Build the connector for `kind`.
///
/// The memory connector uses the process-global [`MemoryHub`].
///
/// # Errors
///
/// [`CeleryError::NoTransportAvailable`] when the adapter for `kind` was not
/// compiled in.
pub fn create_connector(kind: TransportKind) -> Result<ConnectorPtr> {
    // ---
    match kind {
        TransportKind::Lapin => create_lapin_connector(),
        TransportKind::Redis => create_redis_connector(),
        TransportKind::Memory => Ok(MemoryConnector::global()),
    }
}
