//! Wire envelope: payload plus delivery headers.
//!
//! Every message on the bus is a JSON document of the form:
//!
//! ```json
//! {
//!   "payload": { "event_name": "OrderCreated", "occur_on": "...", "order_id": 1 },
//!   "headers": {
//!     "X-TRACE-ID": "abc-123",
//!     "X-EVENT-NAME": "OrderCreated",
//!     "X-OCCUR-ON": "2025-01-01T00:00:00.000Z",
//!     "X-USER-ID": "u-1"
//!   }
//! }
//! ```
//!
//! Context fields are opt-in: only the names in the configured allow-list are
//! copied into headers, rendered as `X-` + upper-case name with `_` → `-`.
//!
//! The retry counter (`x-retry-count`) travels in the transport headers of the
//! retry copy; [`Envelope::retry_count`] reads the envelope-level fallback.

use crate::context::RequestContext;
use crate::event::DomainEvent;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Header carrying the trace id of the originating unit of work.
pub const TRACE_ID_HEADER: &str = "X-TRACE-ID";

/// Header carrying the event name (routing key at publish time).
pub const EVENT_NAME_HEADER: &str = "X-EVENT-NAME";

/// Header carrying the ISO-8601 occurrence time.
pub const OCCUR_ON_HEADER: &str = "X-OCCUR-ON";

/// Header carrying how many times the message has been redelivered by the retry path.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Errors encoding or decoding envelopes.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    /// Failed to serialize a payload or envelope.
    #[error("Failed to serialize envelope: {0}")]
    Serialization(String),

    /// The payload could not be converted into the requested type.
    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

/// Render a context field name as its delivery header name.
///
/// ```
/// use courier_core::envelope::context_header;
///
/// assert_eq!(context_header("user_id"), "X-USER-ID");
/// ```
#[must_use]
pub fn context_header(field: &str) -> String {
    format!("X-{}", field.to_uppercase().replace('_', "-"))
}

/// Interpret a retry counter header value, flooring anything invalid or negative at zero.
#[must_use]
pub fn parse_retry_count(value: &Value) -> u32 {
    let raw = match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    u32::try_from(raw.max(0)).unwrap_or(u32::MAX)
}

/// The wire-level message: payload plus headers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The message body (a serialized [`DomainEvent`] or an arbitrary value).
    pub payload: Value,

    /// Delivery metadata.
    #[serde(default)]
    pub headers: Map<String, Value>,
}

impl Envelope {
    /// Wrap a payload with no headers.
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            headers: Map::new(),
        }
    }

    /// Build the envelope for a domain event published within `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the event cannot be converted to JSON.
    pub fn for_event(
        event: &DomainEvent,
        ctx: &RequestContext,
        context_fields: &[String],
    ) -> Result<Self, EnvelopeError> {
        let payload =
            serde_json::to_value(event).map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Self::stamped(
            payload,
            event.event_name(),
            event.occur_on(),
            ctx,
            context_fields,
        ))
    }

    /// Build the envelope for an arbitrary payload published under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if the message cannot be converted to JSON.
    pub fn for_message<M: Serialize + ?Sized>(
        routing_key: &str,
        message: &M,
        occur_on: DateTime<Utc>,
        ctx: &RequestContext,
        context_fields: &[String],
    ) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_value(message)
            .map_err(|e| EnvelopeError::Serialization(e.to_string()))?;
        Ok(Self::stamped(
            payload,
            routing_key,
            occur_on,
            ctx,
            context_fields,
        ))
    }

    fn stamped(
        payload: Value,
        event_name: &str,
        occur_on: DateTime<Utc>,
        ctx: &RequestContext,
        context_fields: &[String],
    ) -> Self {
        let mut envelope = Self::new(payload)
            .with_header(TRACE_ID_HEADER, ctx.trace_id())
            .with_header(EVENT_NAME_HEADER, event_name)
            .with_header(
                OCCUR_ON_HEADER,
                occur_on.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        for field in context_fields {
            if let Some(value) = ctx.field(field) {
                envelope.headers.insert(context_header(field), value);
            }
        }
        envelope
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// The trace id header, if present and non-empty.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.header(TRACE_ID_HEADER)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The event name header.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        self.header(EVENT_NAME_HEADER).and_then(Value::as_str)
    }

    /// The envelope-level retry counter (0 when absent).
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .map_or(0, parse_retry_count)
    }

    /// Convert the payload into a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Decode`] if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.payload).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Decode a message body received from the broker.
    ///
    /// Decoding never fails: a JSON object with a `payload` key is read as an
    /// envelope, any other JSON value becomes the payload with empty headers,
    /// and a non-JSON body becomes a string payload.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(mut map)) if map.contains_key("payload") => {
                let payload = map.remove("payload").unwrap_or(Value::Null);
                let headers = match map.remove("headers") {
                    Some(Value::Object(headers)) => headers,
                    _ => Map::new(),
                };
                Self { payload, headers }
            },
            Ok(other) => Self::new(other),
            Err(_) => Self::new(Value::String(String::from_utf8_lossy(body).into_owned())),
        }
    }
}
