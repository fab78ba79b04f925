//! Broker transport abstraction.
//!
//! The runtime talks to the broker exclusively through these traits, so the
//! connection manager, publisher and consumers are independent of the client
//! library. `courier-amqp` implements them over AMQP 0-9-1; `courier-testing`
//! provides an in-process broker for tests.
//!
//! # Object model
//!
//! ```text
//! BrokerConnector ──connect(url)──► BrokerConnection ──open_channel()──► BrokerChannel
//!                                        │                                   │
//!                                   closed(): error signal          declare / bind / publish
//!                                                                     consume ──► DeliveryStream
//!                                                                                    │
//!                                                                                Delivery::ack()
//! ```
//!
//! # Dyn compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! traits can be used as `Arc<dyn BrokerConnection>` and shared between the
//! publisher loop and the consumers.

use futures::Stream;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by broker transports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection was lost or closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Failed to open or use a channel.
    #[error("Channel error: {0}")]
    ChannelFailed(String),

    /// Failed to declare or bind an exchange or queue.
    #[error("Declare failed for '{name}': {reason}")]
    DeclareFailed {
        /// Exchange or queue name
        name: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker rejected or failed a publish.
    #[error("Publish failed to exchange '{exchange}' with routing key '{routing_key}': {reason}")]
    PublishFailed {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming a queue.
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// Queue name
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to acknowledge a delivery.
    #[error("Ack failed: {0}")]
    AckFailed(String),

    /// An operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Future returned by transport operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BusError>> + Send + 'a>>;

/// Stream of deliveries from a queue; ends when the channel or connection goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// Transport-level message headers.
pub type MessageHeaders = Map<String, Value>;

/// Exchange routing type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Broadcast to every bound queue.
    Fanout,
    /// Dotted-word pattern match (`*` one word, `#` zero or more).
    #[default]
    Topic,
    /// Header-based routing.
    Headers,
}

impl ExchangeKind {
    /// Wire name of the exchange type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised exchange type string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown exchange type: {0}")]
pub struct UnknownExchangeKind(pub String);

impl FromStr for ExchangeKind {
    type Err = UnknownExchangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            _ => Err(UnknownExchangeKind(s.to_string())),
        }
    }
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection.
    pub exclusive: bool,
    /// Deleted when the last consumer goes away.
    pub auto_delete: bool,
    /// Exchange that expired messages are re-published to (`""` = default exchange).
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    /// Durable, shared queue (work mode).
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }

    /// Exclusive, auto-deleted queue (broadcast mode).
    #[must_use]
    pub const fn exclusive() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: None,
        }
    }

    /// Dead-letter expired messages to `exchange`.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Per-message publish properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    /// Transport headers.
    pub headers: MessageHeaders,
}

impl PublishProperties {
    /// Set the per-message TTL.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set a transport header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Acknowledges a single delivery.
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge the delivery.
    fn ack(&self) -> BusFuture<'_, ()>;
}

/// A message delivered from a queue.
pub struct Delivery {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Transport headers.
    pub headers: MessageHeaders,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a delivery.
    #[must_use]
    pub fn new(body: Vec<u8>, headers: MessageHeaders, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            headers,
            acker,
        }
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::AckFailed`] if the broker could not be reached.
    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A channel on a broker connection.
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange.
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BusFuture<'a, ()>;

    /// Declare a queue.
    fn declare_queue<'a>(&'a self, name: &'a str, options: QueueOptions) -> BusFuture<'a, ()>;

    /// Bind a queue to an exchange with a routing pattern.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BusFuture<'a, ()>;

    /// Publish a message.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
        properties: PublishProperties,
    ) -> BusFuture<'a, ()>;

    /// Start consuming a queue with manual acknowledgement.
    fn consume<'a>(&'a self, queue: &'a str, consumer_tag: &'a str)
    -> BusFuture<'a, DeliveryStream>;

    /// Close the channel.
    fn close(&self) -> BusFuture<'_, ()>;
}

/// A live broker connection.
pub trait BrokerConnection: Send + Sync {
    /// Open a new channel.
    fn open_channel(&self) -> BusFuture<'_, Arc<dyn BrokerChannel>>;

    /// Resolves with the error that broke the connection.
    ///
    /// Never resolves for a healthy connection.
    fn closed(&self) -> Pin<Box<dyn Future<Output = BusError> + Send + '_>>;

    /// Close the connection.
    fn close(&self) -> BusFuture<'_, ()>;
}

/// Opens connections to a broker.
pub trait BrokerConnector: Send + Sync {
    /// Connect to the broker at `url`.
    fn connect<'a>(&'a self, url: &'a str) -> BusFuture<'a, Arc<dyn BrokerConnection>>;
}
