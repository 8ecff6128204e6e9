//! AMQP transport implementation using `lapin`.
//!
//! This module implements the `Connector`/`Connection` traits against an
//! AMQP 0-9-1 broker. One connection serves both Celery roles:
//!
//! - **broker**: task messages are published to the descriptor's exchange
//!   with publisher confirms enabled, so a broker `basic.nack` surfaces as
//!   `Ok(false)` instead of disappearing silently;
//! - **result backend**: results are read the way Celery's `amqp` result
//!   backend stores them (see below).
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor publishes, declares result queues, fetches results, and
//!   closes the connection on shutdown.
//! - All interaction with the AMQP client is serialized through this actor;
//!   no other task ever touches the connection directly.
//! - Dropping the last handle to the connection closes the command channel,
//!   which stops the actor and closes the broker connection.
//!
//! ## Connection behavior
//!
//! Connection to the broker is **eager**: `connect()` returns only after the
//! AMQP handshake and channel setup succeeded. There is no implicit retry.
//!
//! A channel closed by the broker (e.g. after a declare with mismatched
//! arguments) is discarded and transparently reopened on the next command.
//!
//! ## Result lookup
//!
//! Celery's `amqp` backend publishes each result to the `celeryresults`
//! direct exchange with a routing key equal to the task id without dashes,
//! into a queue of the same name. To look a result up the actor:
//!
//! 1. declares the `celeryresults` exchange and the per-task queue
//!    (durable iff the descriptor asks for persistent messages, auto-delete,
//!    `x-expires` set from the descriptor's result expiry when non-zero),
//! 2. binds the queue, once per connection,
//! 3. issues `basic.get`; a message whose body decodes is acked, anything
//!    else is nacked with requeue so the result stays on the broker and the
//!    decode error reaches the caller on every poll.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicGetOptions,
        BasicNackOptions,
        BasicPublishOptions,
        ConfirmSelectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable},
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties,
    Channel,
    Connection as AmqpConnection,
    ConnectionProperties,
    ExchangeKind,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

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
    PublishOptions,
    Result,
    ResultBody,
    ResultMessage,
    TransportKind,
};

/// Exchange Celery's `amqp` result backend publishes results to.
const RESULT_EXCHANGE: &str = "celeryresults";

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        exchange: String,
        body: Bytes,
        opts: PublishOptions,
        resp: oneshot::Sender<Result<bool>>,
    },
    Fetch {
        task_id: String,
        expiry: Duration,
        resp: oneshot::Sender<Result<Option<ResultMessage>>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Closed,
}

/// Connector for AMQP brokers via lapin.
struct LapinConnector;

#[async_trait::async_trait]
impl Connector for LapinConnector {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Lapin
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionPtr> {
        // ---
        let endpoint = descriptor.endpoint();
        let (connection, channel) = create_amqp_connection(descriptor).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let actor = Actor {
            endpoint: endpoint.clone(),
            persistent_results: descriptor.persistent_messages(),
            connection,
            channel: Some(channel),
            cmd_rx,
            bound_queues: HashSet::new(),
        };

        let handle = tokio::spawn(actor.run());

        Ok(Arc::new(LapinConnection {
            endpoint,
            cmd_tx,
            actor: Mutex::new(Some(handle)),
        }))
    }
}

/// AMQP connection handle.
///
/// Cheap front for the actor; every operation is a command round-trip.
struct LapinConnection {
    // ---
    endpoint: String,
    cmd_tx: mpsc::Sender<Cmd>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl LapinConnection {
    async fn call<T>(&self, cmd: Cmd, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|e| {
            CeleryError::Transport(format!("[{}] actor command channel closed: {e}", self.endpoint))
        })?;

        rx.await.map_err(|e| {
            CeleryError::Transport(format!("[{}] actor responder channel read failed: {e}", self.endpoint))
        })?
    }
}

#[async_trait::async_trait]
impl Connection for LapinConnection {
    // ---
    fn kind(&self) -> TransportKind {
        TransportKind::Lapin
    }

    async fn publish_to_exchange(
        &self,
        descriptor: &ConnectionDescriptor,
        body: Bytes,
        opts: &PublishOptions,
    ) -> Result<bool> {
        // ---
        let (resp, rx) = oneshot::channel();
        let cmd = Cmd::Publish {
            exchange: descriptor.exchange().to_string(),
            body,
            opts: opts.clone(),
            resp,
        };
        self.call(cmd, rx).await
    }

    async fn fetch_result(&self, task_id: &str, expiry: Duration) -> Result<Option<ResultMessage>> {
        // ---
        let (resp, rx) = oneshot::channel();
        let cmd = Cmd::Fetch {
            task_id: task_id.to_string(),
            expiry,
            resp,
        };
        self.call(cmd, rx).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (resp, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp }).await.is_ok() {
            let _ = rx.await;
        }

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }

        Ok(())
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    endpoint: String,
    persistent_results: bool,
    connection: AmqpConnection,
    channel: Option<Channel>,
    cmd_rx: mpsc::Receiver<Cmd>,
    bound_queues: HashSet<String>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.endpoint);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::Closed => {
                    log_debug!("[{}] AMQP actor shutting down", self.endpoint);
                    break;
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            let _ = channel.close(200, "Normal shutdown").await;
        }
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP connection closed", self.endpoint);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        match self.cmd_rx.recv().await {
            Some(cmd) => ActorStep::Cmd(cmd),
            None => ActorStep::Closed,
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Publish {
                exchange,
                body,
                opts,
                resp,
            } => {
                let result = self.do_publish(&exchange, &body, &opts).await;
                let _ = resp.send(self.settle(result));
            }
            Cmd::Fetch {
                task_id,
                expiry,
                resp,
            } => {
                let result = self.do_fetch(&task_id, expiry).await;
                let _ = resp.send(self.settle(result));
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    /// Drop the channel after a failed operation; the broker closes channels
    /// on most errors and a dead channel would fail every later command.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.channel = None;
            self.bound_queues.clear();
        }
        result
    }

    async fn channel(&mut self) -> Result<&Channel> {
        // ---
        if self.channel.is_none() {
            log_warn!("[{}] reopening AMQP channel", self.endpoint);
            let channel = open_channel(&self.connection).await?;
            self.channel = Some(channel);
        }

        self.channel
            .as_ref()
            .ok_or_else(|| CeleryError::Transport("amqp: channel unavailable".into()))
    }

    async fn do_publish(
        &mut self,
        exchange: &str,
        body: &[u8],
        opts: &PublishOptions,
    ) -> Result<bool> {
        // ---
        let endpoint = self.endpoint.clone();

        let mut properties = BasicProperties::default()
            .with_content_type(opts.content_type.as_str().into())
            .with_content_encoding(opts.content_encoding.as_str().into());
        if let Some(mode) = opts.delivery_mode {
            properties = properties.with_delivery_mode(mode.as_u8());
        }

        let publish_opts = BasicPublishOptions {
            mandatory: false,
            immediate: opts.immediate,
        };

        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(exchange, &opts.routing_key, publish_opts, body, properties)
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: publish failed: {e}")))?;

        let confirmation = confirm
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: publisher confirm failed: {e}")))?;

        if confirmation.is_nack() {
            log_warn!("[{endpoint}] broker nacked message on {exchange}/{}", opts.routing_key);
            return Ok(false);
        }

        log_debug!("[{endpoint}] published to {exchange}/{}", opts.routing_key);
        Ok(true)
    }

    async fn do_fetch(&mut self, task_id: &str, expiry: Duration) -> Result<Option<ResultMessage>> {
        // ---
        let queue = result_queue_name(task_id);

        if !self.bound_queues.contains(&queue) {
            self.declare_result_queue(&queue, expiry).await?;
            self.bound_queues.insert(queue.clone());
        }

        let channel = self.channel().await?;
        let message = channel
            .basic_get(&queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: basic.get on {queue} failed: {e}")))?;

        let Some(message) = message else {
            return Ok(None);
        };

        let properties = &message.delivery.properties;
        let result = ResultMessage {
            body: Bytes::from(message.delivery.data.clone()),
            content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
            content_encoding: properties
                .content_encoding()
                .as_ref()
                .map(|s| s.as_str().to_string()),
        };

        if is_decodable(&result) {
            message
                .delivery
                .acker
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| CeleryError::Transport(format!("amqp: ack on {queue} failed: {e}")))?;
        } else {
            log_warn!("[{}] undecodable result on {queue}, requeued", self.endpoint);
            message
                .delivery
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: true,
                })
                .await
                .map_err(|e| CeleryError::Transport(format!("amqp: nack on {queue} failed: {e}")))?;
        }

        Ok(Some(result))
    }

    async fn declare_result_queue(&mut self, queue: &str, expiry: Duration) -> Result<()> {
        // ---
        let durable = self.persistent_results;

        let mut arguments = FieldTable::default();
        if !expiry.is_zero() {
            let millis = u32::try_from(expiry.as_millis()).unwrap_or(u32::MAX);
            arguments.insert("x-expires".into(), AMQPValue::LongUInt(millis));
        }

        let channel = self.channel().await?;

        channel
            .exchange_declare(
                RESULT_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: exchange declare failed: {e}")))?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive: false,
                    auto_delete: true,
                    nowait: false,
                },
                arguments,
            )
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: queue declare failed: {e}")))?;

        channel
            .queue_bind(
                queue,
                RESULT_EXCHANGE,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| CeleryError::Transport(format!("amqp: queue bind failed: {e}")))?;

        log_debug!("[{}] declared result queue {queue}", self.endpoint);
        Ok(())
    }
}

/// The only copy of a result lives in its queue; only decodable ones may be acked.
fn is_decodable(message: &ResultMessage) -> bool {
    ResultBody::decode(message).is_ok()
}

/// Celery names result queues after the task id with dashes removed.
fn result_queue_name(task_id: &str) -> String {
    task_id.replace('-', "")
}

fn amqp_uri(descriptor: &ConnectionDescriptor) -> AMQPUri {
    // ---
    let scheme = if descriptor.tls().enabled {
        AMQPScheme::AMQPS
    } else {
        AMQPScheme::AMQP
    };

    let vhost = match descriptor.vhost() {
        "" => "/".to_string(),
        other => other.to_string(),
    };

    AMQPUri {
        scheme,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: descriptor.login().to_string(),
                password: descriptor.password().to_string(),
            },
            host: descriptor.host().to_string(),
            port: descriptor.port(),
        },
        vhost,
        ..AMQPUri::default()
    }
}

fn tls_config(descriptor: &ConnectionDescriptor) -> Result<OwnedTLSConfig> {
    // ---
    let tls = descriptor.tls();
    if tls.accept_invalid_certs {
        log_warn!("amqp: accept_invalid_certs is not supported by lapin and is ignored");
    }

    let cert_chain = match &tls.ca_file {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
            CeleryError::Configuration(format!("cannot read CA file {}: {e}", path.display()))
        })?),
        None => None,
    };

    Ok(OwnedTLSConfig {
        identity: None,
        cert_chain,
    })
}

async fn open_channel(connection: &AmqpConnection) -> Result<Channel> {
    // ---
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| CeleryError::Transport(format!("amqp: channel creation failed: {e}")))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| CeleryError::Transport(format!("amqp: confirm.select failed: {e}")))?;

    Ok(channel)
}

/// Connects to the broker and opens a confirm-mode channel.
async fn create_amqp_connection(descriptor: &ConnectionDescriptor) -> Result<(AmqpConnection, Channel)> {
    // ---
    let endpoint = descriptor.endpoint();
    log_info!("Connecting to AMQP broker: {endpoint}");

    let uri = amqp_uri(descriptor);
    let connected = if descriptor.tls().enabled {
        let config = tls_config(descriptor)?;
        AmqpConnection::connect_uri_with_config(uri, ConnectionProperties::default(), config).await
    } else {
        AmqpConnection::connect_uri(uri, ConnectionProperties::default()).await
    };

    let connection = connected.map_err(|e| {
        let msg = format!("amqp: connection to {endpoint} failed: {e}");
        log_error!("{msg}");
        CeleryError::Connection(msg)
    })?;

    let channel = open_channel(&connection).await.map_err(|e| {
        let msg = format!("amqp: {endpoint}: {e}");
        log_error!("{msg}");
        CeleryError::Connection(msg)
    })?;

    log_info!("Connected to AMQP broker: {endpoint}");
    Ok((connection, channel))
}

/// Creates the lapin connector.
pub fn create_connector() -> Result<ConnectorPtr> {
    Ok(Arc::new(LapinConnector))
}
