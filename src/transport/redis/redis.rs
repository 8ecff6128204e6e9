//! Redis transport implementation using `redis`.
//!
//! Celery's Redis transport (kombu) keeps each queue as a Redis list and
//! stores each task result under its own key. This module speaks both:
//!
//! - **broker**: a task message is wrapped in the kombu envelope (base64
//!   body, delivery info, delivery tag) and `LPUSH`ed onto the list named by
//!   the routing key. Workers `BRPOP` from the other end.
//! - **result backend**: results are read with `GET celery-task-meta-<id>`.
//!   Expiry of those keys is set by the worker, so the `expiry` argument of
//!   `fetch_result` is not used here.
//!
//! ## Concurrency model
//!
//! Unlike the AMQP transport there is no actor: `MultiplexedConnection` is
//! cheap to clone and safe to use from any task, so each operation clones
//! the handle and issues its command directly.
//!
//! ## Descriptor mapping
//!
//! - `vhost` selects the Redis database (`""`, `"/"` → 0; `"/3"` or `"3"` → 3).
//! - `password` enables `AUTH`; an empty password means no authentication.
//! - TLS (`rediss://`) requires the `transport_redis_tls` feature.
//!   `accept_invalid_certs` disables certificate verification; `ca_file` is
//!   not supported by this adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use ::redis::aio::MultiplexedConnection;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    CeleryError,
    Connection,
    ConnectionDescriptor,
    ConnectionPtr,
    Connector,
    ConnectorPtr,
    DeliveryMode,
    PublishOptions,
    Result,
    ResultMessage,
    TransportKind,
};

/// Key prefix of Celery's Redis result backend.
const RESULT_KEY_PREFIX: &str = "celery-task-meta-";

/// kombu's on-the-wire envelope for messages stored in Redis lists.
#[derive(Debug, Serialize)]
struct KombuMessage<'a> {
    body: String,
    #[serde(rename = "content-encoding")]
    content_encoding: &'a str,
    #[serde(rename = "content-type")]
    content_type: &'a str,
    headers: HashMap<String, String>,
    properties: KombuProperties<'a>,
}

#[derive(Debug, Serialize)]
struct KombuProperties<'a> {
    body_encoding: &'static str,
    delivery_info: DeliveryInfo<'a>,
    delivery_mode: u8,
    delivery_tag: String,
    priority: u8,
}

#[derive(Debug, Serialize)]
struct DeliveryInfo<'a> {
    exchange: &'a str,
    routing_key: &'a str,
}

impl<'a> KombuMessage<'a> {
    fn new(exchange: &'a str, body: &[u8], opts: &'a PublishOptions) -> Self {
        // ---
        Self {
            body: BASE64.encode(body),
            content_encoding: &opts.content_encoding,
            content_type: &opts.content_type,
            headers: HashMap::new(),
            properties: KombuProperties {
                body_encoding: "base64",
                delivery_info: DeliveryInfo {
                    exchange,
                    routing_key: &opts.routing_key,
                },
                delivery_mode: opts.delivery_mode.unwrap_or(DeliveryMode::Transient).as_u8(),
                delivery_tag: Uuid::new_v4().to_string(),
                priority: 0,
            },
        }
    }
}

/// Connector for Redis via the `redis` crate.
struct RedisConnector;

#[async_trait::async_trait]
impl Connector for RedisConnector {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Redis
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionPtr> {
        // ---
        let endpoint = descriptor.endpoint();
        let url = redis_url(descriptor)?;

        log_info!("Connecting to Redis: {endpoint}");

        let client = ::redis::Client::open(url.as_str()).map_err(|e| {
            let msg = format!("redis: invalid connection info for {endpoint}: {e}");
            log_error!("{msg}");
            CeleryError::Connection(msg)
        })?;

        let conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            let msg = format!("redis: connection to {endpoint} failed: {e}");
            log_error!("{msg}");
            CeleryError::Connection(msg)
        })?;

        log_info!("Connected to Redis: {endpoint}");

        Ok(Arc::new(RedisConnection { endpoint, conn }))
    }
}

/// Redis connection handle.
struct RedisConnection {
    // ---
    endpoint: String,
    conn: MultiplexedConnection,
}

#[async_trait::async_trait]
impl Connection for RedisConnection {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Redis
    }

    async fn publish_to_exchange(
        &self,
        descriptor: &ConnectionDescriptor,
        body: Bytes,
        opts: &PublishOptions,
    ) -> Result<bool> {
        // ---
        let envelope = KombuMessage::new(descriptor.exchange(), &body, opts);
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let length = ::redis::cmd("LPUSH")
            .arg(&opts.routing_key)
            .arg(&payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| {
                let msg = format!("{}: LPUSH to {} failed: {e}", self.endpoint, opts.routing_key);
                log_error!("{msg}");
                CeleryError::Transport(msg)
            })?;

        if length <= 0 {
            log_warn!("{}: LPUSH to {} stored nothing", self.endpoint, opts.routing_key);
            return Ok(false);
        }

        log_debug!("{}: pushed task onto {}", self.endpoint, opts.routing_key);
        Ok(true)
    }

    async fn fetch_result(&self, task_id: &str, _expiry: Duration) -> Result<Option<ResultMessage>> {
        // ---
        let key = result_key(task_id);

        let mut conn = self.conn.clone();
        let body = ::redis::cmd("GET")
            .arg(&key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| CeleryError::Transport(format!("{}: GET {key} failed: {e}", self.endpoint)))?;

        Ok(body.map(|body| ResultMessage {
            body: Bytes::from(body),
            content_type: None,
            content_encoding: None,
        }))
    }

    async fn close(&self) -> Result<()> {
        // Multiplexed connections close when the last clone is dropped.
        log_debug!("{}: redis connection released", self.endpoint);
        Ok(())
    }
}

fn result_key(task_id: &str) -> String {
    format!("{RESULT_KEY_PREFIX}{task_id}")
}

fn redis_db(vhost: &str) -> Result<i64> {
    // ---
    match vhost.trim_start_matches('/') {
        "" => Ok(0),
        db => db.parse().map_err(|_| {
            CeleryError::Configuration(format!("redis: vhost must be a database number, got {vhost:?}"))
        }),
    }
}

fn redis_url(descriptor: &ConnectionDescriptor) -> Result<Url> {
    // ---
    let tls = descriptor.tls();
    if tls.enabled && !cfg!(feature = "transport_redis_tls") {
        return Err(CeleryError::NoTransportAvailable(
            "redis over TLS requires the transport_redis_tls feature".into(),
        ));
    }
    if tls.ca_file.is_some() {
        log_warn!("redis: ca_file is not supported and is ignored");
    }

    let scheme = if tls.enabled { "rediss" } else { "redis" };
    let db = redis_db(descriptor.vhost())?;

    let mut url = Url::parse(&format!("{scheme}://{}:{}/{db}", descriptor.host(), descriptor.port()))
        .map_err(|e| CeleryError::Configuration(format!("redis: invalid host {:?}: {e}", descriptor.host())))?;

    if !descriptor.password().is_empty() {
        let bad_credentials = |_| CeleryError::Configuration("redis: credentials rejected by URL builder".into());
        if !descriptor.login().is_empty() {
            url.set_username(descriptor.login()).map_err(bad_credentials)?;
        }
        url.set_password(Some(descriptor.password())).map_err(bad_credentials)?;
    }

    if tls.enabled && tls.accept_invalid_certs {
        url.set_fragment(Some("insecure"));
    }

    Ok(url)
}

/// Creates the redis connector.
pub fn create_connector() -> Result<ConnectorPtr> {
    Ok(Arc::new(RedisConnector))
}
