//! # Courier Testing
//!
//! Testing utilities for the Courier event bus.
//!
//! This crate provides:
//! - [`InMemoryBroker`], an in-process broker implementing the transport traits
//! - A fixed [`Clock`] for deterministic `occur_on` stamps
//! - proptest strategies for routing keys and payloads
//! - A tracing subscriber that writes through the test harness
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{InMemoryBroker, test_clock};
//! use courier_runtime::{EventBus, ServerConfig};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_order_flow() {
//!     let broker = InMemoryBroker::new();
//!     let bus = EventBus::builder()
//!         .connector("memory", broker.connector())
//!         .server("default", ServerConfig::new("memory", "memory://", "orders"))
//!         .clock(std::sync::Arc::new(test_clock()))
//!         .build()
//!         .unwrap();
//!
//!     bus.start().unwrap();
//!     // ...
//!     assert_eq!(broker.publications_to("orders").len(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

pub mod broker;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a tracing subscriber that writes through the test harness.
    ///
    /// Honours `RUST_LOG`; safe to call from every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// A single routing-key word.
    pub fn word() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,7}"
    }

    /// Dotted routing keys of one to four words.
    pub fn routing_key() -> impl Strategy<Value = String> {
        prop::collection::vec(word(), 1..=4).prop_map(|words| words.join("."))
    }

    /// Event names in `UpperCamelCase`.
    pub fn event_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{2,8}[A-Z][a-z]{2,8}"
    }

    /// Small flat JSON payloads with scalar values.
    pub fn payload() -> impl Strategy<Value = Map<String, Value>> {
        let scalar = prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
        ];
        prop::collection::btree_map("[a-z][a-z_]{0,11}", scalar, 0..6)
            .prop_map(|fields| fields.into_iter().collect())
    }
}

pub use broker::{InMemoryBroker, Publication};
pub use helpers::init_test_tracing;
pub use mocks::{FixedClock, test_clock};
