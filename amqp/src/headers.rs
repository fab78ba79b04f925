//! Conversion between transport headers and AMQP field tables.
//!
//! Transport headers are JSON values; AMQP carries typed field values.
//! Integers go out as 64-bit signed values (unsigned values above
//! `i64::MAX` saturate), strings as long strings, objects as nested tables.
//! Inbound, every AMQP integer width maps back to a JSON number.

use courier_core::transport::MessageHeaders;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::{Number, Value};
use std::time::Duration;

/// Render transport headers as an AMQP field table.
#[must_use]
pub fn to_field_table(headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(ShortString::from(name.clone()), to_amqp_value(value));
    }
    table
}

/// Read an AMQP field table as transport headers.
#[must_use]
pub fn from_field_table(table: &FieldTable) -> MessageHeaders {
    table
        .inner()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else if let Some(u) = n.as_u64() {
                AMQPValue::LongLongInt(i64::try_from(u).unwrap_or(i64::MAX))
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => AMQPValue::FieldArray(FieldArray::from(
            items.iter().map(to_amqp_value).collect::<Vec<_>>(),
        )),
        Value::Object(map) => AMQPValue::FieldTable(to_field_table(map)),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(u) => Value::from(*u),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(u) => Value::from(*u),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(u) => Value::from(*u),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => float(f64::from(*f)),
        AMQPValue::Double(f) => float(*f),
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => {
            Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned())
        },
        AMQPValue::ByteArray(bytes) => {
            Value::from(String::from_utf8_lossy(bytes.as_slice()).into_owned())
        },
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(from_amqp_value).collect())
        },
        AMQPValue::FieldTable(table) => Value::Object(from_field_table(table)),
        _ => Value::Null,
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Per-message TTL in the AMQP `expiration` property format (milliseconds).
#[must_use]
pub fn expiration(ttl: Duration) -> ShortString {
    ShortString::from(ttl.as_millis().to_string())
}

/// Queue arguments for a queue declaration.
#[must_use]
pub fn queue_arguments(dead_letter_exchange: Option<&str>) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange)),
        );
    }
    arguments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_count_survives_the_wire() {
        let headers: MessageHeaders = json!({"x-retry-count": 3})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let table = to_field_table(&headers);

        assert_eq!(
            table.inner().get(&ShortString::from("x-retry-count")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(from_field_table(&table), headers);
    }

    #[test]
    fn narrow_integers_read_as_numbers() {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("a"), AMQPValue::ShortShortUInt(7));
        table.insert(ShortString::from("b"), AMQPValue::LongInt(-2));
        table.insert(ShortString::from("c"), AMQPValue::ShortString(ShortString::from("x")));

        let headers = from_field_table(&table);
        assert_eq!(headers.get("a"), Some(&json!(7)));
        assert_eq!(headers.get("b"), Some(&json!(-2)));
        assert_eq!(headers.get("c"), Some(&json!("x")));
    }

    #[test]
    fn nested_values_round_trip() {
        let headers: MessageHeaders = json!({
            "flag": true,
            "name": "orders",
            "list": [1, "two"],
            "nested": {"depth": 2},
            "nothing": null,
        })
        .as_object()
        .cloned()
        .unwrap_or_default();

        assert_eq!(from_field_table(&to_field_table(&headers)), headers);
    }

    #[test]
    fn expiration_is_milliseconds() {
        assert_eq!(expiration(Duration::from_secs(2)).as_str(), "2000");
        assert_eq!(expiration(Duration::from_secs(180)).as_str(), "180000");
    }

    #[test]
    fn dead_letter_argument_only_when_set() {
        assert!(queue_arguments(None).inner().is_empty());
        let arguments = queue_arguments(Some(""));
        assert_eq!(
            arguments.inner().get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
    }
}
