//! Request-scoped context and in-memory outbox.
//!
//! A [`RequestContext`] is created at the start of a unit of work (an HTTP
//! request, a consumed message) and passed explicitly to every handler and
//! publish call. It carries the trace id, the propagated context fields, and
//! the outbox: messages the unit of work intends to publish once it succeeds.
//!
//! # Outbox lifecycle
//!
//! ```text
//! publish(deferred) ──► enqueue ──► [messages] ──► commit() ──► sinks (publisher queues)
//!                                        │
//!                                        └──────── reset() / drop ──► discarded
//! ```
//!
//! The outbox is not durable. Messages are lost if the process dies between
//! the unit of work succeeding and [`RequestContext::commit`] handing them to
//! the publisher queues.
//!
//! # Example
//!
//! ```
//! use courier_core::context::RequestContext;
//!
//! let ctx = RequestContext::with_trace_id("abc-123").with_field("user_id", "u-1");
//! assert_eq!(ctx.trace_id(), "abc-123");
//! assert_eq!(ctx.pending(), 0);
//! ```

use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Destination for committed outbox messages.
///
/// Implemented by the runtime's outbound publisher handle. `enqueue` must not
/// block on network I/O.
pub trait OutboxSink: Send + Sync {
    /// Hand a serialized envelope to the publisher for `routing_key`.
    fn enqueue(&self, routing_key: String, body: String);
}

/// A message waiting in the outbox.
#[derive(Clone)]
pub struct OutboxMessage {
    /// Logical server the message targets.
    pub server: String,
    /// Routing key to publish with.
    pub routing_key: String,
    /// Serialized envelope.
    pub body: String,
    sink: Arc<dyn OutboxSink>,
}

impl OutboxMessage {
    /// Create an outbox entry bound to its target sink.
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<String>,
        sink: Arc<dyn OutboxSink>,
    ) -> Self {
        Self {
            server: server.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            sink,
        }
    }

    /// Hand the message to its sink.
    pub fn send(self) {
        self.sink.enqueue(self.routing_key, self.body);
    }
}

impl fmt::Debug for OutboxMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxMessage")
            .field("server", &self.server)
            .field("routing_key", &self.routing_key)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

struct Inner {
    trace_id: String,
    fields: RwLock<Map<String, Value>>,
    messages: Mutex<Vec<OutboxMessage>>,
    cancellation: CancellationToken,
}

/// Per-unit-of-work context: trace id, propagated fields and outbox.
///
/// Cloning is cheap and clones share the same outbox.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<Inner>,
}

impl RequestContext {
    /// Create a context with a freshly generated trace id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace_id(generate_trace_id())
    }

    /// Create a context with the given trace id.
    #[must_use]
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                trace_id: trace_id.into(),
                fields: RwLock::new(Map::new()),
                messages: Mutex::new(Vec::new()),
                cancellation: CancellationToken::new(),
            }),
        }
    }

    /// Use `trace_id` when present and non-empty, otherwise generate one.
    #[must_use]
    pub fn from_trace_id(trace_id: Option<&str>) -> Self {
        match trace_id {
            Some(id) if !id.is_empty() => Self::with_trace_id(id),
            _ => Self::new(),
        }
    }

    /// Add a context field (builder form of [`set_field`](Self::set_field)).
    #[must_use]
    pub fn with_field(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(key, value);
        self
    }

    /// The trace id of this unit of work.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Set a context field.
    pub fn set_field(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Read a context field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<Value> {
        self.inner
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Snapshot of all context fields.
    #[must_use]
    pub fn fields(&self) -> Map<String, Value> {
        self.inner
            .fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append a message to the outbox.
    pub fn enqueue(&self, message: OutboxMessage) {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    /// Number of messages waiting in the outbox.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Copy of the messages waiting in the outbox, in enqueue order.
    #[must_use]
    pub fn pending_messages(&self) -> Vec<OutboxMessage> {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flush the outbox: hand every queued message to its sink in original order.
    ///
    /// Call once, when the unit of work has succeeded. Returns the number of
    /// messages handed off.
    pub fn commit(&self) -> usize {
        let messages = std::mem::take(
            &mut *self
                .inner
                .messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let count = messages.len();
        for message in messages {
            message.send();
        }
        count
    }

    /// Discard the outbox without sending. Returns the number of discarded messages.
    pub fn reset(&self) -> usize {
        let mut messages = self
            .inner
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = messages.len();
        messages.clear();
        count
    }

    /// Token cancelled when the unit of work is abandoned (e.g. a handler timeout).
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Whether the unit of work has been abandoned.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("trace_id", &self.inner.trace_id)
            .field("fields", &self.fields())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Generate a new trace id (UUID v4, simple form).
#[must_use]
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl OutboxSink for RecordingSink {
        fn enqueue(&self, routing_key: String, body: String) {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((routing_key, body));
        }
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[test]
    fn enqueue_does_not_send_until_commit() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = RequestContext::new();

        ctx.enqueue(OutboxMessage::new("default", "A", "1", sink.clone()));
        ctx.enqueue(OutboxMessage::new("default", "B", "2", sink.clone()));

        assert_eq!(ctx.pending(), 2);
        assert!(sink.sent().is_empty());

        assert_eq!(ctx.commit(), 2);
        assert_eq!(
            sink.sent(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string())
            ]
        );
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn reset_discards_queued_messages() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = RequestContext::new();
        ctx.enqueue(OutboxMessage::new("default", "A", "1", sink.clone()));

        assert_eq!(ctx.reset(), 1);
        assert_eq!(ctx.commit(), 0);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn second_commit_sends_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = RequestContext::new();
        ctx.enqueue(OutboxMessage::new("default", "A", "1", sink.clone()));

        ctx.commit();
        ctx.commit();

        assert_eq!(sink.sent().len(), 1);
    }

    #[test]
    fn clones_share_the_outbox() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = RequestContext::new();
        let clone = ctx.clone();

        clone.enqueue(OutboxMessage::new("default", "A", "1", sink));

        assert_eq!(ctx.pending(), 1);
    }

    #[test]
    fn from_trace_id_generates_when_missing_or_empty() {
        assert_eq!(RequestContext::from_trace_id(Some("t-1")).trace_id(), "t-1");
        assert_eq!(RequestContext::from_trace_id(Some("")).trace_id().len(), 32);
        assert_eq!(RequestContext::from_trace_id(None).trace_id().len(), 32);
    }

    #[test]
    fn fields_round_trip() {
        let ctx = RequestContext::new().with_field("user_id", "u-1");
        ctx.set_field("tenant", 7);

        assert_eq!(ctx.field("user_id"), Some(Value::from("u-1")));
        assert_eq!(ctx.fields().len(), 2);
        assert!(ctx.field("missing").is_none());
    }
}
