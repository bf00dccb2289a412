// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the physical connection lifecycle and composes the channel registry,
//! consumer registry, correlation bus and work tracker into the public
//! surface: `publish`, `request`, subscribe/rpc registration and graceful
//! `close`. A supervisor task reconnects indefinitely and replays channel
//! setup, topology and consumer registrations on every cycle, so the
//! connection heals itself without manual re-declaration anywhere else.
//!
//! Multiple managers coexist as independent instances; callers needing a
//! named lookup hold their own map of them.

use crate::{
    channels::ChannelRegistry,
    codec::{JsonCodec, PayloadCodec},
    config::AmqpConfig,
    consumer::{setup_consumer, spawn_dispatch, ConsumerContext},
    correlation::{CorrelationBus, CorrelationMessage},
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerOptions},
    policy::ErrorBehavior,
    publisher::{outbound_properties, publish_raw, HeaderValue},
    registry::{ConsumerMode, ConsumerRecord, ConsumerRegistry},
    topology::TopologyInstaller,
    tracker::WorkTracker,
};
use futures_util::{future::join_all, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions},
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Notify, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Pseudo-queue implementing the broker's reply-to-sender mechanism
pub const DIRECT_REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";
/// Header disambiguating replies when requests share a correlation id scheme
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// AMQP reply code for a clean close
const REPLY_SUCCESS: u16 = 200;

/// Lifecycle of the physical connection.
///
/// `Disconnected` is reachable from `Ready` at any time (broker-initiated)
/// and transitions back to `Connecting` under the hood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    ChannelsInitializing,
    Ready,
    Disconnected,
}

/// Per-call options for `request`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Correlation id to use; generated when absent
    pub correlation_id: Option<String>,
    /// Value for the `X-Request-ID` header, also required on the reply
    pub request_id: Option<String>,
    /// Override for the connection-level rpc timeout
    pub timeout: Option<Duration>,
    /// Additional outbound headers
    pub headers: Option<HashMap<String, HeaderValue>>,
}

impl RequestOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn request_id(mut self, id: &str) -> Self {
        self.request_id = Some(id.to_owned());
        self
    }
}

/// State shared between the manager facade and its supervisor task.
struct ManagerShared {
    config: AmqpConfig,
    codec: Arc<dyn PayloadCodec>,
    channels: ChannelRegistry,
    consumers: ConsumerRegistry,
    correlation: Arc<CorrelationBus>,
    tracker: Arc<WorkTracker>,
    connection: RwLock<Option<Connection>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl ManagerShared {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn error_behavior_for(&self, mode: ConsumerMode, options: &HandlerOptions) -> ErrorBehavior {
        let default = match mode {
            ConsumerMode::Subscribe => self.config.default_subscribe_error_behavior,
            ConsumerMode::Rpc => self.config.default_rpc_error_behavior,
        };
        ErrorBehavior::resolve(options.error_behavior, default)
    }

    fn build_context(
        &self,
        channel: Channel,
        queue: String,
        record: &ConsumerRecord,
    ) -> Arc<ConsumerContext> {
        Arc::new(ConsumerContext {
            channel,
            queue,
            mode: record.mode,
            handler: Arc::clone(&record.handler),
            options: record.options.clone(),
            codec: Arc::clone(&self.codec),
            tracker: Arc::clone(&self.tracker),
            error_behavior: self.error_behavior_for(record.mode, &record.options),
        })
    }
}

/// Manages one logical connection to the broker.
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    state_rx: watch::Receiver<ConnectionState>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates a manager with the default JSON codec.
    pub fn new(config: AmqpConfig) -> Result<ConnectionManager, AmqpError> {
        ConnectionManager::with_codec(config, Arc::new(JsonCodec))
    }

    /// Creates a manager with a custom payload codec.
    pub fn with_codec(
        config: AmqpConfig,
        codec: Arc<dyn PayloadCodec>,
    ) -> Result<ConnectionManager, AmqpError> {
        config.validate()?;
        let channels = ChannelRegistry::from_config(&config)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        Ok(ConnectionManager {
            shared: Arc::new(ManagerShared {
                config,
                codec,
                channels,
                consumers: ConsumerRegistry::default(),
                correlation: Arc::new(CorrelationBus::new()),
                tracker: WorkTracker::new(),
                connection: RwLock::new(None),
                state_tx,
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
            }),
            state_rx,
            supervisor: Mutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Starts the connection supervisor.
    ///
    /// With `connection_init_options.wait` unset this returns immediately
    /// after issuing the connect. Otherwise it blocks until the first
    /// `Ready`, bounded by the configured timeout; on expiry it fails with
    /// `ConnectionTimeout` unless `reject` is false, in which case it
    /// resolves and leaves the connection retrying in the background.
    pub async fn init(&self) -> Result<(), AmqpError> {
        {
            let mut supervisor = self.supervisor.lock().expect("supervisor lock poisoned");
            if supervisor.is_some() {
                warn!("init called twice, supervisor already running");
                return Ok(());
            }

            let shared = Arc::clone(&self.shared);
            *supervisor = Some(tokio::spawn(async move { supervise(shared).await }));
        }

        let options = &self.shared.config.connection_init_options;
        if !options.wait {
            return Ok(());
        }

        let mut state_rx = self.state_rx.clone();
        // Mapping away the watch::Ref ends its borrow of state_rx before the
        // match settles the result.
        let ready = tokio::time::timeout(
            options.timeout,
            state_rx.wait_for(|state| *state == ConnectionState::Ready),
        )
        .await
        .map(|first_ready| first_ready.map(|_| ()));

        match ready {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AmqpError::ConnectionError),
            Err(_) if !options.reject => {
                warn!(
                    timeout = ?options.timeout,
                    "connection not ready in time, continuing to retry in the background"
                );
                Ok(())
            }
            Err(_) => Err(AmqpError::ConnectionTimeout(options.timeout)),
        }
    }

    /// Returns the raw channel registered under `name` (default channel when
    /// `None`), failing before `Ready`.
    pub async fn channel(&self, name: Option<&str>) -> Result<Channel, AmqpError> {
        self.shared.channels.resolve(name).current().await
    }

    /// Publishes a message on the default channel.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        headers: Option<&HashMap<String, HeaderValue>>,
    ) -> Result<(), AmqpError> {
        self.ensure_ready()?;
        let channel = self.shared.channels.default_channel().current().await?;
        let body = self.shared.codec.serialize(payload)?;
        let (properties, _) =
            outbound_properties(&Context::current(), self.shared.codec.as_ref(), headers);

        publish_raw(&channel, exchange, routing_key, &body, properties).await
    }

    /// Issues an rpc request and awaits its correlated reply.
    ///
    /// The correlation subscription is opened before publishing so the reply
    /// cannot race it. The filtered stream is raced against the timeout;
    /// whichever settles first wins and the loser's continuation is
    /// discarded. Replies arriving after the timeout are dropped.
    pub async fn request(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &Value,
        options: RequestOptions,
    ) -> Result<Value, AmqpError> {
        self.ensure_ready()?;

        if !self.shared.config.enable_direct_reply_to {
            return Err(AmqpError::ConsumerError(
                "direct reply-to is disabled for this connection".to_owned(),
            ));
        }

        let timeout = options
            .timeout
            .unwrap_or(self.shared.config.default_rpc_timeout);
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let subscription = self.shared.correlation.subscribe();

        let mut headers = options.headers.clone().unwrap_or_default();
        if let Some(request_id) = &options.request_id {
            headers.insert(
                REQUEST_ID_HEADER.to_owned(),
                HeaderValue::String(request_id.clone()),
            );
        }

        let channel = self.shared.channels.default_channel().current().await?;
        let body = self.shared.codec.serialize(payload)?;
        let (properties, _) = outbound_properties(
            &Context::current(),
            self.shared.codec.as_ref(),
            Some(&headers),
        );
        let properties = properties
            .with_reply_to(ShortString::from(DIRECT_REPLY_TO_QUEUE))
            .with_correlation_id(ShortString::from(correlation_id.clone()))
            .with_expiration(ShortString::from(timeout.as_millis().to_string()));

        publish_raw(&channel, exchange, routing_key, &body, properties).await?;

        let reply = tokio::time::timeout(
            timeout,
            CorrelationBus::await_reply(
                subscription,
                &correlation_id,
                options.request_id.as_deref(),
            ),
        )
        .await
        .map_err(|_| AmqpError::RpcTimeout {
            timeout,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        })?;

        self.shared.codec.deserialize(&reply.payload)
    }

    /// Registers a fire-and-forget subscribe consumer. Returns its tag.
    pub async fn register_subscriber(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: HandlerOptions,
    ) -> Result<String, AmqpError> {
        self.register(ConsumerMode::Subscribe, handler, options)
            .await
    }

    /// Registers a request/reply consumer. Returns its tag.
    pub async fn register_rpc(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        options: HandlerOptions,
    ) -> Result<String, AmqpError> {
        self.register(ConsumerMode::Rpc, handler, options).await
    }

    async fn register(
        &self,
        mode: ConsumerMode,
        handler: Arc<dyn ConsumerHandler>,
        options: HandlerOptions,
    ) -> Result<String, AmqpError> {
        let handle = self
            .shared
            .channels
            .resolve(options.queue_options.channel.as_deref());
        let channel = handle.current().await?;

        let (tag, queue, consumer) = setup_consumer(&channel, &options).await?;

        let record = ConsumerRecord {
            tag: tag.clone(),
            mode,
            handler,
            options,
            channel_name: handle.name().to_owned(),
        };
        let ctx = self.shared.build_context(channel, queue, &record);
        self.shared.consumers.insert(record);
        spawn_dispatch(consumer, ctx);

        Ok(tag)
    }

    /// Cancels a consumer at the broker, stopping message intake.
    ///
    /// The registration is retained so the consumer can be resumed;
    /// deliveries already dispatched keep running.
    pub async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError> {
        let record = self
            .shared
            .consumers
            .get(tag)
            .ok_or_else(|| AmqpError::UnknownConsumerTag(tag.to_owned()))?;

        let handle = self.shared.channels.resolve(Some(&record.channel_name));
        let channel = handle.current().await?;

        channel
            .basic_cancel(tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag = tag, "error cancelling consumer");
                AmqpError::CancelConsumerError(tag.to_owned())
            })
    }

    /// Re-creates a cancelled consumer from its retained registration.
    ///
    /// Returns the **new** consumer tag; the old tag is invalidated. Callers
    /// must not assume tag stability across a pause/resume cycle.
    pub async fn resume_consumer(&self, tag: &str) -> Result<String, AmqpError> {
        let record = self
            .shared
            .consumers
            .get(tag)
            .ok_or_else(|| AmqpError::UnknownConsumerTag(tag.to_owned()))?;

        let handle = self.shared.channels.resolve(Some(&record.channel_name));
        let channel = handle.current().await?;

        let (new_tag, queue, consumer) = setup_consumer(&channel, &record.options).await?;

        let new_record = ConsumerRecord {
            tag: new_tag.clone(),
            ..record
        };
        let ctx = self.shared.build_context(channel, queue, &new_record);
        self.shared.consumers.swap(tag, new_record);
        spawn_dispatch(consumer, ctx);

        Ok(new_tag)
    }

    /// Gracefully shuts the connection down.
    ///
    /// Four phases, each awaited in order: cancel every consumer tag, drain
    /// the outstanding-work set, close every channel (all attempted, errors
    /// logged), close the physical connection. The work set may still grow
    /// briefly for deliveries dispatched before cancellation; the drain
    /// waits for it to converge to empty before any channel is touched.
    pub async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connection");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_notify.notify_waiters();

        for record in self.shared.consumers.drain() {
            let handle = self.shared.channels.resolve(Some(&record.channel_name));
            match handle.current().await {
                Ok(channel) => {
                    if let Err(err) = channel
                        .basic_cancel(&record.tag, BasicCancelOptions::default())
                        .await
                    {
                        error!(
                            error = err.to_string(),
                            tag = record.tag.as_str(),
                            "error cancelling consumer during close"
                        );
                    }
                }
                Err(_) => debug!(
                    tag = record.tag.as_str(),
                    "channel already unavailable, skipping cancel"
                ),
            }
        }

        self.shared.tracker.wait_idle().await;

        let closes = self.shared.channels.all().map(|handle| async move {
            match handle.current().await {
                Ok(channel) => {
                    if let Err(err) = channel.close(REPLY_SUCCESS, "closing").await {
                        error!(
                            error = err.to_string(),
                            channel = handle.name(),
                            "error closing channel"
                        );
                    }
                }
                Err(_) => {}
            }
            handle.clear().await;
        });
        join_all(closes).await;

        if let Some(connection) = self.shared.connection.write().await.take() {
            connection
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error closing connection");
                    AmqpError::ConnectionError
                })?;
        }

        if let Some(handle) = self
            .supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .take()
        {
            handle.abort();
        }

        self.shared.set_state(ConnectionState::Idle);
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), AmqpError> {
        if self.state() != ConnectionState::Ready {
            return Err(AmqpError::ConnectionNotAvailable);
        }
        Ok(())
    }
}

/// Supervises the physical connection: connect, set up, watch for errors,
/// repeat. Runs until shutdown.
async fn supervise(shared: Arc<ManagerShared>) {
    loop {
        if shared.is_shutdown() {
            return;
        }

        shared.set_state(ConnectionState::Connecting);
        let Some(connection) = connect_any(&shared).await else {
            return;
        };

        let (error_tx, mut error_rx) = mpsc::channel::<()>(1);
        connection.on_error(move |err| {
            error!(error = err.to_string(), "connection errored");
            let _ = error_tx.try_send(());
        });

        shared.set_state(ConnectionState::ChannelsInitializing);
        if let Err(err) = open_channels(&shared, &connection).await {
            error!(error = err.to_string(), "channel setup failed, reconnecting");
            for handle in shared.channels.all() {
                handle.clear().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(shared.config.initial_reconnect_delay) => continue,
                _ = shared.shutdown_notify.notified() => return,
            }
        }

        *shared.connection.write().await = Some(connection);
        shared.set_state(ConnectionState::Ready);
        debug!("amqp connection ready");

        tokio::select! {
            _ = error_rx.recv() => {
                shared.set_state(ConnectionState::Disconnected);
                warn!("broker connection lost, reconnecting");

                for handle in shared.channels.all() {
                    handle.clear().await;
                }
                *shared.connection.write().await = None;
            }
            _ = shared.shutdown_notify.notified() => return,
        }
    }
}

/// Attempts every configured URI in order, indefinitely, with capped
/// exponential backoff between full rotations. Returns `None` on shutdown.
async fn connect_any(shared: &Arc<ManagerShared>) -> Option<Connection> {
    let mut delay = shared.config.initial_reconnect_delay;

    loop {
        for uri in &shared.config.uris {
            if shared.is_shutdown() {
                return None;
            }

            debug!(uri = uri.as_str(), "connecting to broker");
            match Connection::connect(uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    debug!(uri = uri.as_str(), "amqp connected");
                    return Some(connection);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        uri = uri.as_str(),
                        "failed to connect, will retry"
                    );
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown_notify.notified() => return None,
        }
        delay = std::cmp::min(delay * 2, shared.config.max_reconnect_delay);
    }
}

/// Opens every registered channel on a fresh connection and replays the
/// setup that belongs to it: topology on the default channel, the direct
/// reply-to consumer, then every registered consumer (with new tags).
async fn open_channels(shared: &Arc<ManagerShared>, connection: &Connection) -> Result<(), AmqpError> {
    for handle in shared.channels.all() {
        handle.reopen(connection).await?;
    }

    let default_channel = shared.channels.default_channel().current().await?;
    TopologyInstaller::new(&default_channel, &shared.config)
        .install()
        .await?;

    if shared.config.enable_direct_reply_to {
        start_reply_consumer(shared, &default_channel).await?;
    }

    restore_consumers(shared).await;
    Ok(())
}

/// Consumes the direct reply-to pseudo-queue in no-ack mode, decoding every
/// reply onto the correlation bus.
async fn start_reply_consumer(
    shared: &Arc<ManagerShared>,
    channel: &Channel,
) -> Result<(), AmqpError> {
    let mut consumer = channel
        .basic_consume(
            DIRECT_REPLY_TO_QUEUE,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: true,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error consuming direct reply-to");
            AmqpError::BindingConsumerError(DIRECT_REPLY_TO_QUEUE.to_owned())
        })?;

    let bus = Arc::clone(&shared.correlation);
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let Some(correlation_id) = delivery.properties.correlation_id() else {
                        debug!("reply without correlation id, dropping");
                        continue;
                    };

                    let request_id = request_id_from(&delivery.properties);

                    bus.publish(CorrelationMessage {
                        correlation_id: correlation_id.to_string(),
                        request_id,
                        payload: delivery.data,
                    });
                }
                Err(err) => {
                    error!(error = err.to_string(), "error receiving rpc reply");
                }
            }
        }

        debug!("direct reply-to consumer stream ended");
    });

    Ok(())
}

/// Extracts the `X-Request-ID` header carried by a reply, when present.
fn request_id_from(properties: &BasicProperties) -> Option<String> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(&ShortString::from(REQUEST_ID_HEADER)))
        .and_then(|value| match value {
            AMQPValue::LongString(v) => Some(v.to_string()),
            _ => None,
        })
}

/// Re-creates every registered consumer after a reconnect, swapping each
/// record to its fresh tag.
async fn restore_consumers(shared: &Arc<ManagerShared>) {
    for record in shared.consumers.snapshot() {
        let handle = shared.channels.resolve(Some(&record.channel_name));
        let channel = match handle.current().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    tag = record.tag.as_str(),
                    "channel unavailable, consumer not restored"
                );
                continue;
            }
        };

        match setup_consumer(&channel, &record.options).await {
            Ok((tag, queue, consumer)) => {
                debug!(
                    old_tag = record.tag.as_str(),
                    new_tag = tag.as_str(),
                    "consumer restored"
                );

                let old_tag = record.tag.clone();
                let new_record = ConsumerRecord { tag, ..record };
                let ctx = shared.build_context(channel, queue, &new_record);
                shared.consumers.swap(&old_tag, new_record);
                spawn_dispatch(consumer, ctx);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    tag = record.tag.as_str(),
                    "error restoring consumer"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionInitOptions;

    // Nothing listens on port 1; connect attempts fail immediately.
    const UNREACHABLE_URI: &str = "amqp://127.0.0.1:1";

    fn unreachable_config() -> AmqpConfig {
        let mut config = AmqpConfig::new(UNREACHABLE_URI);
        config.initial_reconnect_delay = Duration::from_millis(20);
        config
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            ConnectionManager::new(AmqpConfig::new("http://localhost:15672")),
            Err(AmqpError::UriScheme(_))
        ));
    }

    #[tokio::test]
    async fn starts_idle_and_refuses_operations_before_ready() {
        let manager = ConnectionManager::new(unreachable_config()).unwrap();
        assert_eq!(manager.state(), ConnectionState::Idle);

        let publish = manager
            .publish("orders", "orders.created", &serde_json::json!({}), None)
            .await;
        assert_eq!(publish, Err(AmqpError::ConnectionNotAvailable));

        let request = manager
            .request(
                "orders",
                "orders.lookup",
                &serde_json::json!({}),
                RequestOptions::default(),
            )
            .await;
        assert_eq!(request, Err(AmqpError::ConnectionNotAvailable));
    }

    #[tokio::test]
    async fn init_without_wait_resolves_while_connecting() {
        let mut config = unreachable_config();
        config.connection_init_options = ConnectionInitOptions {
            wait: false,
            ..ConnectionInitOptions::default()
        };

        let manager = ConnectionManager::new(config).unwrap();
        assert!(manager.init().await.is_ok());
        assert_ne!(manager.state(), ConnectionState::Ready);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_times_out_against_an_unreachable_broker() {
        let mut config = unreachable_config();
        config.connection_init_options = ConnectionInitOptions {
            wait: true,
            timeout: Duration::from_millis(100),
            reject: true,
        };

        let manager = ConnectionManager::new(config).unwrap();
        assert_eq!(
            manager.init().await,
            Err(AmqpError::ConnectionTimeout(Duration::from_millis(100)))
        );
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_timeout_with_reject_disabled_keeps_retrying() {
        let mut config = unreachable_config();
        config.connection_init_options = ConnectionInitOptions {
            wait: true,
            timeout: Duration::from_millis(100),
            reject: false,
        };

        let manager = ConnectionManager::new(config).unwrap();
        assert!(manager.init().await.is_ok());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_init_is_a_no_op() {
        let mut config = unreachable_config();
        config.connection_init_options = ConnectionInitOptions {
            wait: false,
            ..ConnectionInitOptions::default()
        };

        let manager = ConnectionManager::new(config).unwrap();
        manager.init().await.unwrap();
        assert!(manager.init().await.is_ok());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_fails_fast_when_direct_reply_to_is_disabled() {
        let config = unreachable_config().without_direct_reply_to();
        let manager = ConnectionManager::new(config).unwrap();

        // Force the ready gate open without a broker; the direct-reply guard
        // comes first and must win.
        manager.shared.set_state(ConnectionState::Ready);

        let result = manager
            .request(
                "orders",
                "orders.lookup",
                &serde_json::json!({}),
                RequestOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(AmqpError::ConsumerError(_))));
    }

    #[test]
    fn reply_request_id_header_is_extracted_when_present() {
        use std::collections::BTreeMap;

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(REQUEST_ID_HEADER),
            AMQPValue::LongString("req-42".into()),
        );
        let properties = BasicProperties::default().with_headers(FieldTable::from(headers));
        assert_eq!(request_id_from(&properties), Some("req-42".to_owned()));

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(REQUEST_ID_HEADER),
            AMQPValue::LongLongInt(7),
        );
        let numeric = BasicProperties::default().with_headers(FieldTable::from(headers));
        assert_eq!(request_id_from(&numeric), None);

        assert_eq!(request_id_from(&BasicProperties::default()), None);
    }

    #[tokio::test]
    async fn cancel_of_an_unknown_tag_is_an_error() {
        let manager = ConnectionManager::new(unreachable_config()).unwrap();
        assert_eq!(
            manager.cancel_consumer("no-such-tag").await,
            Err(AmqpError::UnknownConsumerTag("no-such-tag".to_owned()))
        );
        assert_eq!(
            manager.resume_consumer("no-such-tag").await,
            Err(AmqpError::UnknownConsumerTag("no-such-tag".to_owned()))
        );
    }
}
