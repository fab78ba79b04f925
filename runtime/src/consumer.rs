//! Consumers: one handler bound to one routing key on one server.
//!
//! A consumer declares its queue, binds it to the work exchange and dispatches
//! every delivery on its own task. The handler runs under a timeout as a
//! child task that can be abandoned. After handling, the delivery is always
//! acknowledged:
//!
//! - **success**: the handler's outbox is committed
//! - **failure** (error, panic, payload conversion failure or timeout): if the
//!   retry limit allows, a copy of the raw body is published to the retry
//!   exchange with a TTL of [`delay_for`](crate::retry::delay_for)`(n + 1)` and
//!   `x-retry-count = n + 1`; otherwise the message is dropped
//!
//! Redelivery only ever happens through the retry exchange, never through a
//! broker-level requeue.
//!
//! # Queue naming
//!
//! | Mode        | Queue name                          | Declared as          |
//! |-------------|-------------------------------------|----------------------|
//! | `Work`      | handler name with `::` → `.`        | durable              |
//! | `Broadcast` | work name + `_` + random suffix     | exclusive, auto-delete |

use crate::config::{BusSettings, DEFAULT_HANDLE_TIMEOUT};
use crate::manager::Topology;
use crate::metrics::ConsumerMetrics;
use crate::retry::{RetryLimit, RetryPolicy, ScheduledRetry};
use courier_core::context::RequestContext;
use courier_core::envelope::{Envelope, RETRY_COUNT_HEADER, context_header, parse_retry_count};
use courier_core::handler::MessageHandler;
use courier_core::transport::{
    BrokerChannel, BrokerConnection, BusError, Delivery, PublishProperties, QueueOptions,
};
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How deliveries are shared between running instances of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMode {
    /// Competing consumers on one durable, deterministically named queue.
    #[default]
    Work,
    /// Every instance gets its own exclusive queue and sees every message.
    Broadcast,
}

/// Work-mode queue name for a handler identity.
#[must_use]
pub fn work_queue_name(handler_name: &str) -> String {
    handler_name.replace("::", ".")
}

/// A fresh broadcast-mode queue name for a handler identity.
#[must_use]
pub fn broadcast_queue_name(handler_name: &str) -> String {
    format!("{}_{}", work_queue_name(handler_name), Uuid::new_v4().simple())
}

/// Registration request for a handler.
///
/// Unset timeout and retry limit fall back to the bus settings, then to
/// 10 seconds and unlimited retries.
///
/// # Example
///
/// ```
/// use courier_core::{handler_name, typed, DomainEvent, RequestContext};
/// use courier_runtime::consumer::{DeliveryMode, Subscription};
/// use std::time::Duration;
///
/// async fn on_order_created(_ctx: RequestContext, _event: DomainEvent) -> anyhow::Result<()> {
///     Ok(())
/// }
///
/// let subscription = Subscription::new(
///     "OrderCreated",
///     handler_name!(on_order_created),
///     typed(on_order_created),
/// )
/// .timeout(Duration::from_secs(30))
/// .max_retry(5)
/// .mode(DeliveryMode::Work);
/// assert_eq!(subscription.routing_key(), "OrderCreated");
/// ```
#[derive(Clone)]
pub struct Subscription {
    routing_key: String,
    handler_name: String,
    handler: Arc<dyn MessageHandler>,
    timeout: Option<Duration>,
    max_retry: Option<RetryLimit>,
    mode: DeliveryMode,
}

impl Subscription {
    /// Subscribe `handler`, identified by `handler_name`, to `routing_key`.
    pub fn new(
        routing_key: impl Into<String>,
        handler_name: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            handler_name: handler_name.into(),
            handler: Arc::new(handler),
            timeout: None,
            max_retry: None,
            mode: DeliveryMode::Work,
        }
    }

    /// Handler timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry ceiling: negative = unlimited, `0` = never retry.
    #[must_use]
    pub fn max_retry(mut self, max_retry: i64) -> Self {
        self.max_retry = Some(RetryLimit::from_max_retry(max_retry));
        self
    }

    /// Retry ceiling.
    #[must_use]
    pub const fn retry_limit(mut self, limit: RetryLimit) -> Self {
        self.max_retry = Some(limit);
        self
    }

    /// Delivery mode.
    #[must_use]
    pub const fn mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Routing key (pattern) the queue is bound with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Handler identity.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("routing_key", &self.routing_key)
            .field("handler_name", &self.handler_name)
            .field("timeout", &self.timeout)
            .field("max_retry", &self.max_retry)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded and its outbox was committed.
    Handled {
        /// Outbox messages handed to publishers.
        committed: usize,
    },
    /// The handler failed and a retry copy was published.
    RetryScheduled(ScheduledRetry),
    /// The handler failed and the retry limit is exhausted.
    Dropped,
    /// The handler failed and publishing the retry copy failed too.
    RetryFailed,
}

/// A handler bound to a queue on one server.
pub struct Consumer {
    server: String,
    exchange: String,
    retry_exchange: String,
    routing_key: String,
    handler_name: String,
    handler: Arc<dyn MessageHandler>,
    timeout: Duration,
    retry: RetryPolicy,
    mode: DeliveryMode,
    queue: Mutex<String>,
    context_fields: Arc<[String]>,
}

impl Consumer {
    /// Build a consumer for `subscription` on the server described by `topology`.
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        topology: &Topology,
        subscription: Subscription,
        settings: &BusSettings,
    ) -> Self {
        let timeout = subscription
            .timeout
            .or(settings.handle_timeout)
            .unwrap_or(DEFAULT_HANDLE_TIMEOUT);
        let limit = subscription
            .max_retry
            .or(settings.max_retry)
            .unwrap_or_default();
        let queue = match subscription.mode {
            DeliveryMode::Work => work_queue_name(&subscription.handler_name),
            DeliveryMode::Broadcast => broadcast_queue_name(&subscription.handler_name),
        };

        Self {
            server: server.into(),
            exchange: topology.exchange.clone(),
            retry_exchange: topology.retry_exchange.clone(),
            routing_key: subscription.routing_key,
            handler_name: subscription.handler_name,
            handler: subscription.handler,
            timeout,
            retry: RetryPolicy::new(limit),
            mode: subscription.mode,
            queue: Mutex::new(queue),
            context_fields: settings.context_fields.clone().into(),
        }
    }

    /// Current queue name.
    #[must_use]
    pub fn queue_name(&self) -> String {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Routing key the queue is bound with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Handler identity.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Delivery mode.
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Effective handler timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Effective retry limit.
    #[must_use]
    pub const fn retry_limit(&self) -> RetryLimit {
        self.retry.limit()
    }

    fn next_queue_name(&self) -> String {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.mode == DeliveryMode::Broadcast {
            *queue = broadcast_queue_name(&self.handler_name);
        }
        queue.clone()
    }

    /// Declare and bind the queue on `connection`, then consume it on a
    /// background task until the delivery stream ends.
    ///
    /// Broadcast consumers draw a new queue name on every start.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the channel, queue, binding or
    /// consumer cannot be set up.
    pub async fn start(
        self: Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<(), BusError> {
        let channel = connection.open_channel().await?;
        let queue = self.next_queue_name();
        let consumer_tag = format!("{queue}.{}", Uuid::new_v4().simple());

        let mut deliveries = match self.open_queue(channel.as_ref(), &queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!(queue = %queue, error = %close_error, "Ignoring channel close error");
                }
                return Err(e);
            },
        };

        info!(
            server = %self.server,
            queue = %queue,
            routing_key = %self.routing_key,
            handler = %self.handler_name,
            mode = ?self.mode,
            "Consumer started"
        );

        tokio::spawn(async move {
            while let Some(next) = deliveries.next().await {
                match next {
                    Ok(delivery) => {
                        let consumer = Arc::clone(&self);
                        let connection = Arc::clone(&connection);
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            consumer.dispatch(delivery, connection.as_ref(), &queue).await;
                        });
                    },
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Delivery stream failed");
                        break;
                    },
                }
            }
            drop(channel);
            debug!(queue = %queue, "Consumer stopped");
        });

        Ok(())
    }

    async fn open_queue(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<courier_core::transport::DeliveryStream, BusError> {
        let options = match self.mode {
            DeliveryMode::Work => QueueOptions::durable(),
            DeliveryMode::Broadcast => QueueOptions::exclusive(),
        };
        channel.declare_queue(queue, options).await?;
        channel
            .bind_queue(queue, &self.exchange, &self.routing_key)
            .await?;
        channel.consume(queue, consumer_tag).await
    }

    /// Handle one delivery from `queue` and acknowledge it.
    pub async fn dispatch(
        &self,
        delivery: Delivery,
        connection: &dyn BrokerConnection,
        queue: &str,
    ) -> DispatchOutcome {
        let envelope = Envelope::from_body(&delivery.body);
        let retried_count = delivery
            .headers
            .get(RETRY_COUNT_HEADER)
            .map_or_else(|| envelope.retry_count(), parse_retry_count);

        let ctx = RequestContext::from_trace_id(envelope.trace_id());
        for field in self.context_fields.iter() {
            if let Some(value) = envelope.header(&context_header(field)) {
                ctx.set_field(field.as_str(), value.clone());
            }
        }
        debug!(queue = %queue, trace_id = %ctx.trace_id(), retried_count, "Received message");

        let started = Instant::now();
        let result = self.invoke(ctx.clone(), envelope).await;
        ConsumerMetrics::record_duration(&self.server, queue, started.elapsed());

        let outcome = match result {
            Ok(()) => {
                let committed = ctx.commit();
                ConsumerMetrics::record_consumed(&self.server, queue);
                info!(
                    routing_key = %self.routing_key,
                    handler = %self.handler_name,
                    retried_count,
                    committed,
                    "Handle message success"
                );
                DispatchOutcome::Handled { committed }
            },
            Err(e) => {
                ctx.reset();
                ConsumerMetrics::record_failure(&self.server, queue);
                let outcome = self
                    .schedule_retry(connection, &delivery.body, queue, retried_count)
                    .await;
                error!(
                    routing_key = %self.routing_key,
                    handler = %self.handler_name,
                    retried_count,
                    outcome = ?outcome,
                    error = %e,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Handle message failed"
                );
                outcome
            },
        };

        if let Err(e) = delivery.ack().await {
            warn!(queue = %queue, error = %e, "Failed to ack message");
        }
        outcome
    }

    async fn invoke(&self, ctx: RequestContext, envelope: Envelope) -> anyhow::Result<()> {
        let cancellation = ctx.cancellation().clone();
        let mut task = tokio::spawn(self.handler.handle(ctx, envelope));

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                Err(anyhow::anyhow!("handler panicked"))
            },
            Ok(Err(join_error)) => Err(anyhow::anyhow!("handler task failed: {join_error}")),
            Err(_) => {
                cancellation.cancel();
                task.abort();
                Err(anyhow::anyhow!("handler timed out after {:?}", self.timeout))
            },
        }
    }

    async fn schedule_retry(
        &self,
        connection: &dyn BrokerConnection,
        body: &[u8],
        queue: &str,
        retried_count: u32,
    ) -> DispatchOutcome {
        let Some(retry) = self.retry.next_retry(retried_count) else {
            ConsumerMetrics::record_dropped(&self.server, queue);
            return DispatchOutcome::Dropped;
        };

        match self.publish_retry(connection, body, queue, retry).await {
            Ok(()) => {
                ConsumerMetrics::record_retry(&self.server, queue);
                warn!(
                    queue = %queue,
                    retry_count = retry.retry_count,
                    delay_ms = u64::try_from(retry.delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduled message retry"
                );
                DispatchOutcome::RetryScheduled(retry)
            },
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to schedule message retry");
                DispatchOutcome::RetryFailed
            },
        }
    }

    async fn publish_retry(
        &self,
        connection: &dyn BrokerConnection,
        body: &[u8],
        queue: &str,
        retry: ScheduledRetry,
    ) -> Result<(), BusError> {
        let channel = connection.open_channel().await?;
        let properties = PublishProperties::default()
            .with_expiration(retry.delay)
            .with_header(RETRY_COUNT_HEADER, retry.retry_count);
        let result = channel
            .publish(&self.retry_exchange, queue, body, properties)
            .await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Ignoring channel close error");
        }
        result
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("server", &self.server)
            .field("queue", &self.queue_name())
            .field("routing_key", &self.routing_key)
            .field("handler_name", &self.handler_name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
