//! Connection parameters for brokers and result backends.
//!
//! [`ConnectionOptions`] is the partial, caller-facing record: every field is
//! optional and it can be deserialized from any serde format. Calling
//! [`ConnectionOptions::normalize`] fills every missing field with its
//! documented default and produces an immutable [`ConnectionDescriptor`].
//!
//! Descriptors are never mutated after construction. Publishers and result
//! handles share them read-only behind an `Arc`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CeleryError, Result, TransportKind};

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default login (RabbitMQ's stock account).
pub const DEFAULT_LOGIN: &str = "guest";
/// Default password (RabbitMQ's stock account).
pub const DEFAULT_PASSWORD: &str = "guest";
/// Default virtual host.
pub const DEFAULT_VHOST: &str = "/";
/// Default exchange tasks are published to.
pub const DEFAULT_EXCHANGE: &str = "celery";
/// Default binding key, also the default routing key for submitted tasks.
pub const DEFAULT_BINDING: &str = "celery";
/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;
/// Default Redis port, used when the selector is `redis` and no port is given.
///
/// An explicit `redis` selector also defaults login and password to empty.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Which transport a descriptor asks for.
///
/// `Auto` defers to the [`TransportCatalog`](crate::TransportCatalog) at
/// connector-build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportSelector {
    #[default]
    Auto,
    Kind(TransportKind),
}

impl FromStr for TransportSelector {
    type Err = CeleryError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(TransportSelector::Auto),
            other => other.parse::<TransportKind>().map(TransportSelector::Kind),
        }
    }
}

impl TryFrom<String> for TransportSelector {
    type Error = CeleryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TransportSelector> for String {
    fn from(value: TransportSelector) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TransportSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSelector::Auto => f.write_str("auto"),
            TransportSelector::Kind(kind) => kind.fmt(f),
        }
    }
}

/// TLS settings for the broker/backend connection.
///
/// An all-default value means plain TCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Connect over TLS (`amqps://`, `rediss://`).
    pub enabled: bool,

    /// PEM bundle of additional CA certificates to trust (AMQP only).
    pub ca_file: Option<PathBuf>,

    /// Skip server certificate verification (Redis only).
    pub accept_invalid_certs: bool,
}

impl TlsOptions {
    /// TLS with the platform's default trust roots.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Partial connection parameters.
///
/// # Example
///
/// ```
/// use mom_celery::ConnectionOptions;
///
/// let descriptor = ConnectionOptions::new()
///     .host("rabbit.internal")
///     .login("worker")
///     .password("secret")
///     .persistent_messages(true)
///     .normalize()
///     .unwrap();
///
/// assert_eq!(descriptor.exchange(), "celery");
/// assert_eq!(descriptor.port(), 5672);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub exchange: Option<String>,
    pub binding: Option<String>,
    pub port: Option<u16>,
    /// Transport selector name: `auto`, `lapin`/`amqp`, `redis` or `memory`.
    pub transport: Option<String>,
    pub persistent_messages: Option<bool>,
    pub result_expire_secs: Option<u64>,
    pub tls: Option<TlsOptions>,
}

impl ConnectionOptions {
    /// Empty option set; every field takes its default.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = Some(binding.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Force a transport by name instead of automatic selection.
    ///
    /// Valid values: `"auto"`, `"lapin"` (alias `"amqp"`), `"redis"`, `"memory"`.
    pub fn transport(mut self, name: impl Into<String>) -> Self {
        self.transport = Some(name.into());
        self
    }

    /// Publish task messages with persistent delivery mode.
    pub fn persistent_messages(mut self, persistent: bool) -> Self {
        self.persistent_messages = Some(persistent);
        self
    }

    /// Backend-side result expiry in seconds (0 = never expire).
    pub fn result_expire_secs(mut self, secs: u64) -> Self {
        self.result_expire_secs = Some(secs);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Fill in defaults and produce an immutable descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CeleryError::Configuration`] for an unknown transport name.
    pub fn normalize(self) -> Result<ConnectionDescriptor> {
        // ---
        let transport = match self.transport.as_deref() {
            Some(name) => name.parse()?,
            None => TransportSelector::Auto,
        };

        // Redis has no stock account; guest/guest would trigger a failing AUTH.
        let (default_port, default_login, default_password) = match transport {
            TransportSelector::Kind(TransportKind::Redis) => (DEFAULT_REDIS_PORT, "", ""),
            _ => (DEFAULT_AMQP_PORT, DEFAULT_LOGIN, DEFAULT_PASSWORD),
        };

        Ok(ConnectionDescriptor {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.into()),
            login: self.login.unwrap_or_else(|| default_login.into()),
            password: self.password.unwrap_or_else(|| default_password.into()),
            vhost: self.vhost.unwrap_or_else(|| DEFAULT_VHOST.into()),
            exchange: self.exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.into()),
            binding: self.binding.unwrap_or_else(|| DEFAULT_BINDING.into()),
            port: self.port.unwrap_or(default_port),
            transport,
            persistent_messages: self.persistent_messages.unwrap_or(false),
            result_expire: Duration::from_secs(self.result_expire_secs.unwrap_or(0)),
            tls: self.tls.unwrap_or_default(),
        })
    }
}

/// Complete, immutable broker/backend parameters.
///
/// Produced by [`ConnectionOptions::normalize`]. Serializable so that a
/// result handle can be persisted and revived later
/// (see [`HandleSnapshot`](crate::HandleSnapshot)).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    host: String,
    login: String,
    password: String,
    vhost: String,
    exchange: String,
    binding: String,
    port: u16,
    transport: TransportSelector,
    persistent_messages: bool,
    result_expire: Duration,
    tls: TlsOptions,
}

impl ConnectionDescriptor {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Queue binding key. Submissions route with `celery` unless told otherwise.
    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> TransportSelector {
        self.transport
    }

    pub fn persistent_messages(&self) -> bool {
        self.persistent_messages
    }

    /// Backend-side expiry. Never used to invalidate client-side caches.
    pub fn result_expire(&self) -> Duration {
        self.result_expire
    }

    pub fn tls(&self) -> &TlsOptions {
        &self.tls
    }

    /// `host:port/vhost`, for log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.vhost.trim_start_matches('/'))
    }
}

// Hand-written so credentials never end up in logs or error messages.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("login", &self.login)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("exchange", &self.exchange)
            .field("binding", &self.binding)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("persistent_messages", &self.persistent_messages)
            .field("result_expire", &self.result_expire)
            .field("tls", &self.tls)
            .finish()
    }
}
