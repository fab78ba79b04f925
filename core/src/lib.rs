//! # Courier Core
//!
//! Core types and traits for the Courier event bus.
//!
//! This crate is I/O free. It defines what travels on the bus and the seams the
//! runtime plugs into:
//!
//! - **[`DomainEvent`](event::DomainEvent)**: a named, timestamped fact with a free-form payload
//! - **[`Envelope`](envelope::Envelope)**: the wire format (payload + delivery headers)
//! - **[`RequestContext`](context::RequestContext)**: trace id, propagated fields and the outbox
//! - **[`MessageHandler`](handler::MessageHandler)**: what consumers dispatch to
//! - **[`transport`]**: broker connection/channel traits implemented by transports
//!
//! ## Example
//!
//! ```
//! use courier_core::context::RequestContext;
//! use courier_core::envelope::Envelope;
//! use courier_core::event::DomainEvent;
//!
//! let ctx = RequestContext::with_trace_id("abc-123");
//! let event = DomainEvent::new("OrderCreated").with("order_id", 1);
//!
//! let envelope = Envelope::for_event(&event, &ctx, &[]).unwrap();
//! assert_eq!(envelope.trace_id(), Some("abc-123"));
//! assert_eq!(envelope.event_name(), Some("OrderCreated"));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod context;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod transport;

pub use context::{OutboxMessage, OutboxSink, RequestContext};
pub use envelope::{Envelope, EnvelopeError};
pub use event::DomainEvent;
pub use handler::{HandlerFuture, MessageHandler, blocking, typed};
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BusError, Delivery, DeliveryStream,
    ExchangeKind, PublishProperties, QueueOptions,
};

/// Environment module - injectable dependencies
///
/// All time-dependent behaviour reads the clock through this trait so tests
/// can pin timestamps.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
