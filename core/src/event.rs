//! Domain events published on the bus.
//!
//! A [`DomainEvent`] is a named fact with an occurrence time and an arbitrary
//! key/value payload. It is immutable once built: the builder methods consume
//! the event and return a new value, and there are no setters.
//!
//! # Wire shape
//!
//! The payload fields are flattened next to `event_name` and `occur_on`, so an
//! `OrderCreated` event with `order_id = 1` serializes as:
//!
//! ```json
//! { "event_name": "OrderCreated", "occur_on": "2025-01-01T00:00:00Z", "order_id": 1 }
//! ```
//!
//! # Example
//!
//! ```
//! use courier_core::event::DomainEvent;
//!
//! let event = DomainEvent::new("OrderCreated")
//!     .with("order_id", 1)
//!     .with("customer", "alice");
//!
//! assert_eq!(event.event_name(), "OrderCreated");
//! assert_eq!(event.get("order_id"), Some(&serde_json::json!(1)));
//! ```

use crate::environment::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the event itself; they cannot be used as payload fields.
const RESERVED_KEYS: [&str; 2] = ["event_name", "occur_on"];

/// Payload key holding the optional event version.
pub const VERSION_KEY: &str = "version";

/// A named, timestamped fact with a free-form payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_name: String,
    occur_on: DateTime<Utc>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl DomainEvent {
    /// Create an event that occurred now.
    #[must_use]
    pub fn new(event_name: impl Into<String>) -> Self {
        Self::at(event_name, Utc::now())
    }

    /// Create an event stamped by the given clock.
    ///
    /// Lets tests pin `occur_on` with a fixed clock.
    #[must_use]
    pub fn with_clock(event_name: impl Into<String>, clock: &dyn Clock) -> Self {
        Self::at(event_name, clock.now())
    }

    /// Create an event with an explicit occurrence time.
    #[must_use]
    pub fn at(event_name: impl Into<String>, occur_on: DateTime<Utc>) -> Self {
        Self {
            event_name: event_name.into(),
            occur_on,
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    ///
    /// `event_name` and `occur_on` are reserved; attempts to set them are ignored.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.payload.insert(key, value.into());
        }
        self
    }

    /// Replace the whole payload.
    ///
    /// Reserved keys in `payload` are dropped.
    #[must_use]
    pub fn with_payload(mut self, mut payload: Map<String, Value>) -> Self {
        for key in RESERVED_KEYS {
            payload.remove(key);
        }
        self.payload = payload;
        self
    }

    /// Mark this event as the successor of version `previous`.
    ///
    /// Stores `previous + 1` under the `version` payload field, so an event
    /// derived from an aggregate at version 3 is published as version 4.
    #[must_use]
    pub fn with_version(mut self, previous: u64) -> Self {
        let version = Value::from(previous.saturating_add(1));
        self.payload.insert(VERSION_KEY.to_string(), version);
        self
    }

    /// The event version, if one was set.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.payload.get(VERSION_KEY).and_then(Value::as_u64)
    }

    /// The event name, also used as the routing key when published.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// When the event occurred (UTC).
    #[must_use]
    pub const fn occur_on(&self) -> DateTime<Utc> {
        self.occur_on
    }

    /// The payload fields.
    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Look up a single payload field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}
