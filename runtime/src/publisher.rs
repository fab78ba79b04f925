//! Outbound publisher: one FIFO drain loop per connection manager.
//!
//! [`Outbound::publish`] appends to an unbounded queue and returns at once.
//! The loop idles while the manager is not `CONNECTED`/`RUNNING`, then pops the
//! head and publishes it to the work exchange under a timeout. A failed or
//! timed-out publish re-appends the message to the **tail** of the queue, so
//! one bad message does not block the ones behind it (and loses its place in
//! FIFO order). A message that has failed `publish_max_attempts` times is
//! moved to the manager's dead letter queue instead.

use crate::dead_letter::DeadLetterQueue;
use crate::manager::ConnectionManager;
use crate::metrics::PublisherMetrics;
use courier_core::context::OutboxSink;
use courier_core::transport::{BusError, PublishProperties};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// How long the loop sleeps between connection checks while disconnected.
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A message waiting to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Routing key on the work exchange.
    pub routing_key: String,
    /// Serialized envelope.
    pub body: String,
    /// Failed publish attempts so far.
    pub attempts: u32,
}

impl OutboundMessage {
    /// A message that has not been attempted yet.
    #[must_use]
    pub fn new(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            attempts: 0,
        }
    }
}

/// Sending half of a manager's outbound queue.
///
/// Cheap to clone. Implements [`OutboxSink`] so request outboxes commit into it.
#[derive(Clone)]
pub struct Outbound {
    server: Arc<str>,
    sender: mpsc::UnboundedSender<OutboundMessage>,
    queued: Arc<AtomicUsize>,
}

impl Outbound {
    pub(crate) fn channel(server: &str) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outbound = Self {
            server: Arc::from(server),
            sender,
            queued: Arc::new(AtomicUsize::new(0)),
        };
        (outbound, receiver)
    }

    /// Queue `body` for publishing under `routing_key`. Never blocks.
    pub fn publish(&self, routing_key: impl Into<String>, body: impl Into<String>) {
        self.push(OutboundMessage::new(routing_key, body));
    }

    /// Messages queued and not yet published or dead-lettered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Whether nothing is waiting to be published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn push(&self, message: OutboundMessage) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.send(message);
    }

    fn requeue(&self, message: OutboundMessage) {
        self.send(message);
    }

    fn send(&self, message: OutboundMessage) {
        if let Err(mpsc::error::SendError(message)) = self.sender.send(message) {
            self.finished();
            warn!(
                server = %self.server,
                routing_key = %message.routing_key,
                "Publisher loop has stopped, dropping message"
            );
        }
    }

    fn finished(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    fn discarded(&self, count: usize) {
        self.queued.fetch_sub(count, Ordering::AcqRel);
    }
}

impl OutboxSink for Outbound {
    fn enqueue(&self, routing_key: String, body: String) {
        self.publish(routing_key, body);
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("server", &self.server)
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

/// Publisher state owned by a connection manager.
#[derive(Debug, Clone)]
pub(crate) struct Publisher {
    pub(crate) outbound: Outbound,
    pub(crate) dead_letters: DeadLetterQueue<OutboundMessage>,
    pub(crate) timeout: Duration,
    pub(crate) max_attempts: Option<u32>,
}

impl Publisher {
    /// Park or re-queue a message after a failed attempt.
    fn failed(&self, server: &str, exchange: &str, mut message: OutboundMessage, error: &BusError) {
        message.attempts = message.attempts.saturating_add(1);
        PublisherMetrics::record_error(server);

        if self.max_attempts.is_some_and(|max| message.attempts >= max) {
            error!(
                server = %server,
                exchange = %exchange,
                routing_key = %message.routing_key,
                attempts = message.attempts,
                error = %error,
                "Giving up publishing message, moved to dead letter queue"
            );
            let attempts = message.attempts;
            self.dead_letters.push(message, error.to_string(), attempts);
            self.outbound.finished();
            PublisherMetrics::record_dead_lettered(server);
        } else {
            error!(
                server = %server,
                exchange = %exchange,
                routing_key = %message.routing_key,
                attempts = message.attempts,
                error = %error,
                body = %message.body,
                "Failed to publish message, re-queued at tail"
            );
            self.outbound.requeue(message);
            PublisherMetrics::record_requeued(server);
        }
    }

    /// Hand every dead-lettered message back to the queue.
    pub(crate) fn requeue_dead_letters(&self) -> usize {
        let entries = self.dead_letters.drain();
        let count = entries.len();
        for entry in entries {
            let mut message = entry.payload;
            message.attempts = 0;
            self.outbound.push(message);
        }
        count
    }
}

/// Drain loop; runs until the manager shuts down.
pub(crate) async fn run(
    manager: ConnectionManager,
    mut receiver: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    let shutdown = manager.shutdown_token();
    let publisher = manager.publisher().clone();
    let server = manager.name().to_string();
    let exchange = manager.topology().exchange.clone();
    let mut pending: Option<OutboundMessage> = None;

    loop {
        if !manager.state().accepts_publishes() {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(IDLE_POLL_INTERVAL) => continue,
            }
        }

        let message = match pending.take() {
            Some(message) => message,
            None => tokio::select! {
                () = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            },
        };

        // The connection may have dropped while waiting for a message.
        let Some(channel) = manager.publish_channel() else {
            pending = Some(message);
            continue;
        };

        let attempt = tokio::time::timeout(
            publisher.timeout,
            channel.publish(
                &exchange,
                &message.routing_key,
                message.body.as_bytes(),
                PublishProperties::default(),
            ),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {
                publisher.outbound.finished();
                PublisherMetrics::record_published(&server);
                debug!(
                    server = %server,
                    exchange = %exchange,
                    routing_key = %message.routing_key,
                    body = %message.body,
                    "Published message"
                );
            },
            Ok(Err(e)) => publisher.failed(&server, &exchange, message, &e),
            Err(_) => publisher.failed(
                &server,
                &exchange,
                message,
                &BusError::Timeout(publisher.timeout),
            ),
        }
    }

    let dropped = discard_unpublished(&publisher.outbound, pending, &mut receiver);
    if dropped > 0 {
        warn!(
            server = %server,
            exchange = %exchange,
            dropped,
            "Publisher loop stopped with unpublished messages, dropping them"
        );
        let dropped = u64::try_from(dropped).unwrap_or(u64::MAX);
        PublisherMetrics::record_dropped(&server, dropped);
    }
    debug!(server = %server, "Publisher loop stopped");
}

/// Close the queue and discard whatever is left in it.
///
/// Returns the number of messages dropped, `pending` included.
fn discard_unpublished(
    outbound: &Outbound,
    pending: Option<OutboundMessage>,
    receiver: &mut mpsc::UnboundedReceiver<OutboundMessage>,
) -> usize {
    receiver.close();
    let mut dropped = usize::from(pending.is_some());
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    outbound.discarded(dropped);
    dropped
}
