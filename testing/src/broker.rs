//! In-memory broker for fast, deterministic transport tests.
//!
//! [`InMemoryBroker`] implements the transport traits with just enough AMQP
//! behaviour to exercise the runtime end to end:
//!
//! - direct, fanout and topic exchanges (`*` one word, `#` zero or more)
//! - the default exchange `""`, routing to the queue named by the routing key
//! - per-message TTL on queues without consumers, dead-lettering expired
//!   messages to the queue's dead-letter exchange under their routing key
//! - exclusive queues deleted with their connection
//! - round-robin delivery between consumers of one queue
//!
//! Failures are injected with [`fail_next_connects`](InMemoryBroker::fail_next_connects),
//! [`fail_next_publishes`](InMemoryBroker::fail_next_publishes),
//! [`stall_next_publishes`](InMemoryBroker::stall_next_publishes) and
//! [`sever_connections`](InMemoryBroker::sever_connections). Every accepted
//! publish is recorded for inspection.

use courier_core::envelope::Envelope;
use courier_core::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BusError, BusFuture,
    Delivery, DeliveryStream, ExchangeKind, MessageHeaders, PublishProperties, QueueOptions,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Whether `routing_key` matches the topic `pattern`.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` zero or
/// more words.
///
/// ```
/// use courier_testing::broker::topic_matches;
///
/// assert!(topic_matches("order.*", "order.created"));
/// assert!(topic_matches("order.#", "order"));
/// assert!(!topic_matches("order.*", "order.created.v2"));
/// ```
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

/// A publish the broker accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// Target exchange (`""` = default exchange).
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Message body.
    pub body: Vec<u8>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    /// Transport headers.
    pub headers: MessageHeaders,
}

impl Publication {
    /// The body as UTF-8 text.
    #[must_use]
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The body decoded as an envelope.
    #[must_use]
    pub fn envelope(&self) -> Envelope {
        Envelope::from_body(&self.body)
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    body: Vec<u8>,
    headers: MessageHeaders,
    expiration: Option<Duration>,
}

struct ConsumerSlot {
    connection: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, BusError>>,
}

struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, watch::Sender<Option<BusError>>>,
    next_id: u64,
    publications: Vec<Publication>,
    acks: usize,
    connect_attempts: usize,
    fail_connects: usize,
    fail_publishes: usize,
    stall_publishes: usize,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, connection: u64) -> Result<(), BusError> {
        if self.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(BusError::ChannelFailed("connection is closed".to_string()))
        }
    }

    fn remove_connection(&mut self, connection: u64, error: Option<BusError>) {
        if let Some(signal) = self.connections.remove(&connection) {
            if let Some(error) = error {
                signal.send_replace(Some(error));
            }
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.queues.remove(name);
        }
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|(queue, _)| !exclusive.contains(queue));
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection != connection);
        }
    }
}

/// Deterministic in-process broker.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```
/// use courier_testing::InMemoryBroker;
/// use courier_core::transport::{BrokerConnector, ExchangeKind, PublishProperties};
///
/// # async fn example() -> Result<(), courier_core::BusError> {
/// let broker = InMemoryBroker::new();
/// let connection = broker.connect("memory://").await?;
/// let channel = connection.open_channel().await?;
///
/// channel.declare_exchange("orders", ExchangeKind::Topic, true).await?;
/// channel.publish("orders", "OrderCreated", b"{}", PublishProperties::default()).await?;
///
/// assert_eq!(broker.publications().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This broker as a shareable connector.
    #[must_use]
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().fail_publishes = n;
    }

    /// Make the next `n` publishes never complete.
    pub fn stall_next_publishes(&self, n: usize) {
        self.lock().stall_publishes = n;
    }

    /// Fire the error signal of every open connection and drop them.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.remove_connection(
                id,
                Some(BusError::ConnectionClosed("connection reset by broker".to_string())),
            );
        }
    }

    /// Every accepted publish, in order.
    #[must_use]
    pub fn publications(&self) -> Vec<Publication> {
        self.lock().publications.clone()
    }

    /// Accepted publishes to `exchange`, in order.
    #[must_use]
    pub fn publications_to(&self, exchange: &str) -> Vec<Publication> {
        self.lock()
            .publications
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Number of acknowledged deliveries.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.lock().acks
    }

    /// Number of connect attempts, including failed ones.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Number of open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Whether an exchange exists.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Declared kind of an exchange.
    #[must_use]
    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind)
    }

    /// `(queue, routing pattern)` bindings of an exchange.
    #[must_use]
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declaration options of a queue.
    #[must_use]
    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.lock().queues.get(name).map(|q| q.options.clone())
    }

    /// Messages buffered in a queue.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.messages.len())
    }

    /// Active consumers of a queue.
    #[must_use]
    pub fn consumer_count(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.consumers.len())
    }

    fn route(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: MessageHeaders,
        expiration: Option<Duration>,
    ) -> Result<(), BusError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let target = state.exchanges.get(exchange).ok_or_else(|| {
                BusError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "no such exchange".to_string(),
                }
            })?;
            let mut queues: Vec<String> = target
                .bindings
                .iter()
                .filter(|(_, pattern)| match target.kind {
                    ExchangeKind::Direct => pattern == routing_key,
                    ExchangeKind::Topic => topic_matches(pattern, routing_key),
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|(queue, _)| queue.clone())
                .collect();
            queues.sort();
            queues.dedup();
            queues
        };

        for queue in targets {
            let message = StoredMessage {
                id: state.next_id(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                headers: headers.clone(),
                expiration,
            };
            self.enqueue(state, &queue, message);
        }
        Ok(())
    }

    fn enqueue(&self, state: &mut BrokerState, queue_name: &str, message: StoredMessage) {
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };

        let message = match deliver(self, queue, message) {
            Ok(()) => return,
            Err(message) => message,
        };

        if let Some(ttl) = message.expiration {
            let broker = self.clone();
            let queue = queue_name.to_string();
            let id = message.id;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                broker.expire(&queue, id);
            });
        }
        queue.messages.push_back(message);
    }

    fn expire(&self, queue_name: &str, id: u64) {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some(position) = queue.messages.iter().position(|m| m.id == id) else {
            return;
        };
        let Some(message) = queue.messages.remove(position) else {
            return;
        };
        let Some(dead_letter_exchange) = queue.options.dead_letter_exchange.clone() else {
            return;
        };

        tracing::debug!(
            queue = %queue_name,
            routing_key = %message.routing_key,
            "Dead-lettering expired message"
        );
        if let Err(e) = self.route(
            &mut state,
            &dead_letter_exchange,
            &message.routing_key,
            message.body,
            message.headers,
            None,
        ) {
            tracing::warn!(error = %e, "Dropping expired message");
        }
    }
}

/// Hand `message` to the next live consumer, or give it back.
fn deliver(
    broker: &InMemoryBroker,
    queue: &mut Queue,
    message: StoredMessage,
) -> Result<(), StoredMessage> {
    while !queue.consumers.is_empty() {
        let index = queue.next_consumer % queue.consumers.len();
        let delivery = Delivery::new(
            message.body.clone(),
            message.headers.clone(),
            Box::new(MemoryAcker {
                broker: broker.clone(),
            }),
        );
        if queue.consumers[index].sender.send(Ok(delivery)).is_ok() {
            queue.next_consumer = index + 1;
            return Ok(());
        }
        queue.consumers.remove(index);
    }
    Err(message)
}

struct MemoryAcker {
    broker: InMemoryBroker,
}

impl Acknowledger for MemoryAcker {
    fn ack(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.broker.lock().acks += 1;
            Ok(())
        })
    }
}

impl BrokerConnector for InMemoryBroker {
    fn connect<'a>(&'a self, url: &'a str) -> BusFuture<'a, Arc<dyn BrokerConnection>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.connect_attempts += 1;
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(BusError::ConnectionFailed(format!(
                    "connection to {url} refused"
                )));
            }

            let id = state.next_id();
            let (signal, closed) = watch::channel(None);
            state.connections.insert(id, signal);
            let connection: Arc<dyn BrokerConnection> = Arc::new(MemoryConnection {
                id,
                broker: self.clone(),
                closed,
            });
            Ok(connection)
        })
    }
}

struct MemoryConnection {
    id: u64,
    broker: InMemoryBroker,
    closed: watch::Receiver<Option<BusError>>,
}

impl BrokerConnection for MemoryConnection {
    fn open_channel(&self) -> BusFuture<'_, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            self.broker.lock().ensure_open(self.id)?;
            let channel: Arc<dyn BrokerChannel> = Arc::new(MemoryChannel {
                connection: self.id,
                broker: self.broker.clone(),
            });
            Ok(channel)
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = BusError> + Send + '_>> {
        let mut closed = self.closed.clone();
        Box::pin(async move {
            loop {
                let current = closed.borrow_and_update().clone();
                if let Some(error) = current {
                    return error;
                }
                if closed.changed().await.is_err() {
                    return BusError::ConnectionClosed("connection closed".to_string());
                }
            }
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.broker.lock().remove_connection(self.id, None);
            Ok(())
        })
    }
}

struct MemoryChannel {
    connection: u64,
    broker: InMemoryBroker,
}

impl BrokerChannel for MemoryChannel {
    fn declare_exchange<'a>(
        &'a self,
        name: &'a str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            match state.exchanges.get(name).map(|e| e.kind) {
                Some(existing) if existing != kind => Err(BusError::DeclareFailed {
                    name: name.to_string(),
                    reason: format!("exchange already declared as {existing}"),
                }),
                Some(_) => Ok(()),
                None => {
                    state.exchanges.insert(
                        name.to_string(),
                        Exchange {
                            kind,
                            bindings: Vec::new(),
                        },
                    );
                    Ok(())
                },
            }
        })
    }

    fn declare_queue<'a>(&'a self, name: &'a str, options: QueueOptions) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            if let Some(existing) = state.queues.get(name) {
                if existing.owner.is_some_and(|owner| owner != self.connection) {
                    return Err(BusError::DeclareFailed {
                        name: name.to_string(),
                        reason: "queue is exclusive to another connection".to_string(),
                    });
                }
                return Ok(());
            }
            let owner = options.exclusive.then_some(self.connection);
            state.queues.insert(
                name.to_string(),
                Queue {
                    options,
                    owner,
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
            Ok(())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            if !state.queues.contains_key(queue) {
                return Err(BusError::DeclareFailed {
                    name: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            }
            let Some(target) = state.exchanges.get_mut(exchange) else {
                return Err(BusError::DeclareFailed {
                    name: exchange.to_string(),
                    reason: "no such exchange".to_string(),
                });
            };
            let binding = (queue.to_string(), routing_key.to_string());
            if !target.bindings.contains(&binding) {
                target.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
        properties: PublishProperties,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            let stalled = {
                let mut state = self.broker.lock();
                state.ensure_open(self.connection)?;
                if state.fail_publishes > 0 {
                    state.fail_publishes -= 1;
                    return Err(BusError::PublishFailed {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        reason: "rejected by broker".to_string(),
                    });
                }
                if state.stall_publishes > 0 {
                    state.stall_publishes -= 1;
                    true
                } else {
                    self.broker.route(
                        &mut state,
                        exchange,
                        routing_key,
                        body.to_vec(),
                        properties.headers.clone(),
                        properties.expiration,
                    )?;
                    state.publications.push(Publication {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                        expiration: properties.expiration,
                        headers: properties.headers,
                    });
                    false
                }
            };
            if stalled {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue: &'a str,
        _consumer_tag: &'a str,
    ) -> BusFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let mut state = self.broker.lock();
            state.ensure_open(self.connection)?;
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(BusError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            };

            let (sender, mut receiver) = mpsc::unbounded_channel();
            target.consumers.push(ConsumerSlot {
                connection: self.connection,
                sender,
            });

            let buffered: Vec<StoredMessage> = target.messages.drain(..).collect();
            for message in buffered {
                if let Err(message) = deliver(&self.broker, target, message) {
                    target.messages.push_back(message);
                }
            }

            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                while let Some(item) = receiver.recv().await {
                    yield item;
                }
            });
            Ok(stream)
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
