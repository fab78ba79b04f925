//! Broker connection manager.
//!
//! Owns one connection and control channel to a broker server and keeps it
//! alive:
//!
//! ```text
//! INIT ──start()──► CONNECTING ──► CONNECTED ──► RUNNING
//!                       ▲              │            │
//!                       │         error│       error│
//!               reconnect_delay        ▼            ▼
//!                       └───────────── CLOSED ◄─────┘
//! ```
//!
//! A connect attempt opens the connection and control channel and declares
//! the work exchange, the retry exchange and the shared retry queue. The retry
//! queue dead-letters expired messages through the default exchange, which
//! routes them back to the queue named by their routing key. On success the
//! manager is `CONNECTED`; it then starts every registered consumer and moves
//! to `RUNNING`. Any failure, or the connection's error signal, closes the
//! connection and moves to `CLOSED`; after the fixed `reconnect_delay` the next
//! attempt starts. Reconnection never gives up.
//!
//! # Example
//!
//! ```no_run
//! use courier_runtime::config::ServerConfig;
//! use courier_runtime::manager::ConnectionManager;
//! # use courier_core::transport::BrokerConnector;
//! # use std::sync::Arc;
//!
//! # async fn example(connector: Arc<dyn BrokerConnector>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new("amqp", "amqp://localhost:5672/%2f", "orders");
//! let manager = ConnectionManager::new("default", &config, connector)?;
//!
//! manager.start()?;
//! manager.outbound().publish("OrderCreated", r#"{"payload":{},"headers":{}}"#);
//! # Ok(())
//! # }
//! ```

use crate::config::{BusSettings, ConfigError, ServerConfig};
use crate::consumer::{Consumer, Subscription};
use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::error::ManagerError;
use crate::health::HealthCheck;
use crate::metrics::ConnectionMetrics;
use crate::publisher::{self, Outbound, OutboundMessage, Publisher};
use courier_core::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BusError, ExchangeKind, QueueOptions,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not started.
    Init,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected and topology declared; consumers starting.
    Connected,
    /// Connected with consumers started.
    Running,
    /// Disconnected; waiting to reconnect (or shut down).
    Closed,
}

impl ConnectionState {
    /// Whether the publisher may publish in this state.
    #[must_use]
    pub const fn accepts_publishes(self) -> bool {
        matches!(self, Self::Connected | Self::Running)
    }

    /// Upper-case state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Running => "RUNNING",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange and queue names a manager declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Work exchange.
    pub exchange: String,
    /// Work exchange type.
    pub kind: ExchangeKind,
    /// Topic exchange receiving retry copies.
    pub retry_exchange: String,
    /// Queue holding retry copies until their TTL expires.
    pub retry_queue: String,
}

impl Topology {
    /// Derive the retry names from the work exchange name.
    #[must_use]
    pub fn new(exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        let exchange = exchange.into();
        Self {
            retry_exchange: format!("{exchange}_retry_exchange"),
            retry_queue: format!("{exchange}_retry_queue"),
            exchange,
            kind,
        }
    }

    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), BusError> {
        channel
            .declare_exchange(&self.exchange, self.kind, true)
            .await?;
        channel
            .declare_exchange(&self.retry_exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_queue(
                &self.retry_queue,
                QueueOptions::durable().with_dead_letter_exchange(""),
            )
            .await?;
        channel
            .bind_queue(&self.retry_queue, &self.retry_exchange, "#")
            .await
    }
}

#[derive(Clone)]
struct LiveConnection {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

struct Inner {
    name: String,
    url: String,
    topology: Topology,
    reconnect_delay: Duration,
    connector: Arc<dyn BrokerConnector>,
    state: watch::Sender<ConnectionState>,
    live: Mutex<Option<LiveConnection>>,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    publisher: Publisher,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
    connect_attempts: AtomicU64,
    shutdown: CancellationToken,
}

/// Resilient connection to one broker server.
///
/// Cheap to clone; clones share the same connection and queues.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for the server `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new(
        name: impl Into<String>,
        config: &ServerConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let (outbound, receiver) = Outbound::channel(&name);
        let (state, _) = watch::channel(ConnectionState::Init);

        Ok(Self {
            inner: Arc::new(Inner {
                url: config.url.clone(),
                topology: Topology::new(config.exchange.clone(), config.exchange_kind()?),
                reconnect_delay: config.reconnect_delay()?,
                connector,
                state,
                live: Mutex::new(None),
                consumers: Mutex::new(Vec::new()),
                publisher: Publisher {
                    outbound,
                    dead_letters: DeadLetterQueue::default(),
                    timeout: config.publish_timeout()?,
                    max_attempts: config.max_publish_attempts(),
                },
                receiver: Mutex::new(Some(receiver)),
                connect_attempts: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                name,
            }),
        })
    }

    /// Logical server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Broker url.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Declared exchange and queue names.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Connect attempts made so far, including the first.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Acquire)
    }

    /// Connect attempts made after a failure or connection loss.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u64 {
        self.connect_attempts().saturating_sub(1)
    }

    /// Handle for queueing outbound messages.
    #[must_use]
    pub fn outbound(&self) -> &Outbound {
        &self.inner.publisher.outbound
    }

    /// Queue `body` for publishing under `routing_key`. Never blocks.
    pub fn publish(&self, routing_key: impl Into<String>, body: impl Into<String>) {
        self.inner.publisher.outbound.publish(routing_key, body);
    }

    /// Outbound messages the publisher gave up on, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter<OutboundMessage>> {
        self.inner.publisher.dead_letters.entries()
    }

    /// Number of parked outbound messages.
    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.inner.publisher.dead_letters.len()
    }

    /// Re-queue every parked outbound message with a fresh attempt count.
    ///
    /// Returns how many messages were re-queued.
    pub fn requeue_dead_letters(&self) -> usize {
        self.inner.publisher.requeue_dead_letters()
    }

    /// Health of this connection.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        HealthCheck::for_connection(self.name(), self.state())
            .with_metadata("queued", self.outbound().len().to_string())
            .with_metadata("dead_letters", self.dead_letter_count().to_string())
    }

    /// Start connecting and publishing.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AlreadyStarted`] unless the manager is `INIT`.
    pub fn start(&self) -> Result<(), ManagerError> {
        let mut started = false;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Init {
                *state = ConnectionState::Connecting;
                started = true;
            }
            started
        });
        if !started {
            return Err(ManagerError::AlreadyStarted {
                url: self.inner.url.clone(),
                exchange: self.inner.topology.exchange.clone(),
            });
        }

        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(
            server = %self.name(),
            url = %self.url(),
            exchange = %self.topology().exchange,
            "Starting connection manager"
        );

        tokio::spawn(supervise(self.clone()));
        if let Some(receiver) = receiver {
            tokio::spawn(publisher::run(self.clone(), receiver));
        }
        Ok(())
    }

    /// Build a consumer for `subscription` and register it.
    pub fn subscribe(&self, subscription: Subscription, settings: &BusSettings) -> Arc<Consumer> {
        let consumer = Consumer::new(self.name(), self.topology(), subscription, settings);
        self.register(consumer)
    }

    /// Register a consumer.
    ///
    /// Started at once when `RUNNING`, otherwise on the next successful connect.
    pub fn register(&self, consumer: Consumer) -> Arc<Consumer> {
        let consumer = Arc::new(consumer);
        let running_connection = {
            let mut consumers = self
                .inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            consumers.push(Arc::clone(&consumer));
            if self.state() == ConnectionState::Running {
                self.live().map(|live| live.connection)
            } else {
                None
            }
        };

        debug!(
            server = %self.name(),
            queue = %consumer.queue_name(),
            routing_key = %consumer.routing_key(),
            "Registered consumer"
        );

        if let Some(connection) = running_connection {
            self.spawn_consumer(Arc::clone(&consumer), connection);
        }
        consumer
    }

    /// Registered consumers.
    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<Consumer>> {
        self.inner
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop the supervisor and publisher loops and close the connection.
    ///
    /// The manager ends `CLOSED` and does not reconnect.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.set_state(ConnectionState::Closed);
        let live = self.take_live();
        if let Some(live) = live {
            close_quietly(live).await;
        }
        info!(server = %self.name(), "Connection manager shut down");
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub(crate) fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    /// Control channel, when connected.
    pub(crate) fn publish_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        if !self.state().accepts_publishes() {
            return None;
        }
        self.live().map(|live| live.channel)
    }

    fn live(&self) -> Option<LiveConnection> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_live(&self) -> Option<LiveConnection> {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(
                server = %self.name(),
                from = %previous,
                to = %state,
                "Connection state changed"
            );
        }
    }

    /// One connect sequence. Leaves the manager `RUNNING` on success.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BusError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::AcqRel);
        let connection = self.inner.connector.connect(&self.inner.url).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_error) = connection.close().await {
                    debug!(error = %close_error, "Ignoring connection close error");
                }
                return Err(e);
            },
        };
        *self.inner.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveConnection {
            connection: Arc::clone(&connection),
            channel: Arc::clone(&channel),
        });

        self.inner.topology.declare(channel.as_ref()).await?;

        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::ConnectionClosed("shutting down".to_string()));
        }
        self.set_state(ConnectionState::Connected);

        let consumers = {
            let consumers = self
                .inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.set_state(ConnectionState::Running);
            consumers.clone()
        };
        for consumer in consumers {
            self.spawn_consumer(consumer, Arc::clone(&connection));
        }

        info!(
            server = %self.name(),
            url = %self.url(),
            exchange = %self.topology().exchange,
            "Connected to broker"
        );
        Ok(connection)
    }

    fn spawn_consumer(&self, consumer: Arc<Consumer>, connection: Arc<dyn BrokerConnection>) {
        let server = self.inner.name.clone();
        tokio::spawn(async move {
            let handler = consumer.handler_name().to_string();
            if let Err(e) = consumer.start(connection).await {
                error!(
                    server = %server,
                    handler = %handler,
                    error = %e,
                    "Failed to start consumer"
                );
            }
        });
    }

    /// Close the connection best-effort and move to `CLOSED`.
    fn dispose(&self) {
        self.set_state(ConnectionState::Closed);
        if let Some(live) = self.take_live() {
            tokio::spawn(close_quietly(live));
        }
    }
}

async fn close_quietly(live: LiveConnection) {
    if let Err(e) = live.channel.close().await {
        debug!(error = %e, "Ignoring channel close error");
    }
    if let Err(e) = live.connection.close().await {
        debug!(error = %e, "Ignoring connection close error");
    }
}

/// Connect, wait for the connection to fail, back off, repeat.
async fn supervise(manager: ConnectionManager) {
    reconnect_loop(&manager).await;

    // A connect attempt interrupted by shutdown may have stored a connection.
    manager.set_state(ConnectionState::Closed);
    if let Some(live) = manager.take_live() {
        close_quietly(live).await;
    }
}

async fn reconnect_loop(manager: &ConnectionManager) {
    let shutdown = manager.shutdown_token();
    let delay = manager.inner.reconnect_delay;

    loop {
        let attempt = tokio::select! {
            () = shutdown.cancelled() => return,
            attempt = manager.connect() => attempt,
        };

        match attempt {
            Ok(connection) => {
                let error = tokio::select! {
                    () = shutdown.cancelled() => return,
                    error = connection.closed() => error,
                };
                manager.dispose();
                error!(
                    server = %manager.name(),
                    error = %error,
                    "Connection exception, reconnecting in {:?}",
                    delay
                );
            },
            Err(e) => {
                manager.dispose();
                error!(
                    server = %manager.name(),
                    url = %manager.url(),
                    error = %e,
                    "Connecting failed, reconnecting in {:?}",
                    delay
                );
            },
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(delay) => {},
        }

        ConnectionMetrics::record_reconnect(manager.name());
        warn!(
            server = %manager.name(),
            attempt = manager.reconnect_attempts() + 1,
            "Reconnecting to broker"
        );
        manager.set_state(ConnectionState::Connecting);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.inner.name)
            .field("url", &self.inner.url)
            .field("topology", &self.inner.topology)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn retry_names_derive_from_exchange() {
        let topology = Topology::new("orders", ExchangeKind::Topic);
        assert_eq!(topology.retry_exchange, "orders_retry_exchange");
        assert_eq!(topology.retry_queue, "orders_retry_queue");
    }

    #[test]
    fn only_connected_states_accept_publishes() {
        assert!(ConnectionState::Connected.accepts_publishes());
        assert!(ConnectionState::Running.accepts_publishes());
        assert!(!ConnectionState::Init.accepts_publishes());
        assert!(!ConnectionState::Connecting.accepts_publishes());
        assert!(!ConnectionState::Closed.accepts_publishes());
    }

    #[test]
    fn state_names_are_upper_case() {
        assert_eq!(ConnectionState::Running.to_string(), "RUNNING");
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
    }
}
