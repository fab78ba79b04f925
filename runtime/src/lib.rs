//! # Courier Runtime
//!
//! Runtime implementation for the Courier event bus.
//!
//! This crate keeps broker connections alive, drains outbound queues and
//! dispatches deliveries to handlers. Transports plug in through the traits in
//! [`courier_core::transport`].
//!
//! ## Core Components
//!
//! - **[`ConnectionManager`]**: connection state machine with fixed-delay reconnect
//! - **Outbound publisher**: FIFO drain loop that re-queues failed publishes at the tail
//! - **[`Consumer`]**: concurrent dispatch under a timeout, delayed retry via the retry exchange
//! - **[`EventBus`]**: server registry, deferred publishing and subscription
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{EventBus, PublishOptions, Subscription};
//! use courier_core::{handler_name, typed, DomainEvent, RequestContext};
//!
//! async fn on_order_created(ctx: RequestContext, event: DomainEvent) -> anyhow::Result<()> {
//!     // ...
//!     Ok(())
//! }
//!
//! let bus = EventBus::from_config(&config, &connectors)?;
//! bus.subscribe(
//!     "default",
//!     Subscription::new("OrderCreated", handler_name!(on_order_created), typed(on_order_created)),
//! )?;
//! bus.start()?;
//! ```

/// Event bus facade
pub mod bus;

/// Configuration loading and validation
pub mod config;

/// Consumers and delivery dispatch
pub mod consumer;

/// Dead letter queue for unpublishable messages
pub mod dead_letter;

/// Health reporting
pub mod health;

/// Tracing subscriber setup
pub mod logging;

/// Connection state machine
pub mod manager;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbound publisher loop
pub mod publisher;

/// Delayed-retry policy
pub mod retry;

/// Error types for the runtime
pub mod error {
    use crate::config::ConfigError;
    use courier_core::envelope::EnvelopeError;
    use thiserror::Error;

    /// Errors from [`ConnectionManager`](crate::manager::ConnectionManager) lifecycle calls.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ManagerError {
        /// `start()` was called on a manager that is not `INIT`.
        ///
        /// No second connection is opened.
        #[error("mq server ({url}|{exchange}) already started")]
        AlreadyStarted {
            /// Broker url
            url: String,
            /// Work exchange
            exchange: String,
        },
    }

    /// Errors surfaced synchronously by publish calls.
    ///
    /// Delivery failures are never reported here; the publisher retries them
    /// in the background.
    #[derive(Error, Debug)]
    pub enum PublishError {
        /// The target server is not configured.
        #[error(transparent)]
        Config(#[from] ConfigError),

        /// The message could not be serialized.
        #[error(transparent)]
        Envelope(#[from] EnvelopeError),
    }
}

pub use bus::{EventBus, PublishOptions, ServerRegistry};
pub use config::{BusConfig, BusSettings, ConfigError, ServerConfig};
pub use consumer::{Consumer, DeliveryMode, DispatchOutcome, Subscription};
pub use error::{ManagerError, PublishError};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use manager::{ConnectionManager, ConnectionState, Topology};
pub use publisher::{Outbound, OutboundMessage};
pub use retry::{RetryLimit, RetryPolicy, delay_for};
