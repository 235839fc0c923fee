// Inbound envelope parsing
//
// Turns a raw lapin delivery into the transport-agnostic `InboundEnvelope`
// the consumer engine works with, and converts header tables between the
// AMQP field-table representation and JSON maps.

use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;
use serde_json::{Map, Value};

use rb_common::{InboundEnvelope, HEADER_REDELIVERY_COUNT, HEADER_RETRY_ENDPOINT, HEADER_TYPE};

/// Build an envelope from a live delivery.
pub fn envelope_from_delivery(delivery: &Delivery) -> InboundEnvelope {
    parse_envelope(&delivery.properties, &delivery.data, delivery.delivery_tag)
}

/// Pure parsing core, split out so it can be exercised without a broker.
///
/// The message type falls back to a `type` header when the AMQP property is
/// unset. A missing or malformed `redelivery_count` header reads as zero,
/// meaning first delivery.
pub fn parse_envelope(
    properties: &BasicProperties,
    data: &[u8],
    delivery_tag: u64,
) -> InboundEnvelope {
    let headers = properties
        .headers()
        .as_ref()
        .map(field_table_to_json_map)
        .unwrap_or_default();

    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());

    let message_type = properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str().to_string())
        .or_else(|| header_string(&headers, HEADER_TYPE));

    let redelivery_count = headers
        .get(HEADER_REDELIVERY_COUNT)
        .and_then(header_count)
        .unwrap_or(0);

    let retry_endpoint = header_string(&headers, HEADER_RETRY_ENDPOINT);

    InboundEnvelope {
        message_id,
        message_type,
        redelivery_count,
        retry_endpoint,
        headers,
        body: data.to_vec(),
        delivery_tag,
    }
}

fn header_string(headers: &Map<String, Value>, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(Value::as_str)
        .map(|value| value.to_string())
}

fn header_count(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|count| u32::try_from(count).ok())
}

// ============================================================================
// FieldTable <-> JSON
// ============================================================================

pub fn field_table_to_json_map(table: &FieldTable) -> Map<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), amqp_value_to_json(value)))
        .collect()
}

pub fn json_map_to_field_table(map: &Map<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.as_str()), json_to_amqp_value(value));
    }
    table
}

fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::DecimalValue(v) => {
            Value::from(f64::from(v.value) / 10f64.powi(i32::from(v.scale)))
        }
        AMQPValue::ShortString(v) => Value::from(v.as_str()),
        AMQPValue::LongString(v) => {
            Value::from(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(v) => {
            Value::Array(v.as_slice().iter().map(amqp_value_to_json).collect())
        }
        AMQPValue::FieldTable(v) => Value::Object(field_table_to_json_map(v)),
        AMQPValue::ByteArray(v) => Value::from(v.as_slice().to_vec()),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Void => Value::Null,
    }
}

fn json_to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(number) => {
            if let Some(v) = number.as_i64() {
                if let Ok(small) = i32::try_from(v) {
                    AMQPValue::LongInt(small)
                } else {
                    AMQPValue::LongLongInt(v)
                }
            } else if let Some(v) = number.as_u64() {
                // Out of i64 range; the broker has no unsigned 64-bit field type.
                AMQPValue::Double(v as f64)
            } else {
                AMQPValue::Double(number.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        Value::Array(items) => {
            let mut array = FieldArray::default();
            for item in items {
                array.push(json_to_amqp_value(item));
            }
            AMQPValue::FieldArray(array)
        }
        Value::Object(map) => AMQPValue::FieldTable(json_map_to_field_table(map)),
    }
}
