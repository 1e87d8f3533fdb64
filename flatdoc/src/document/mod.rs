// Records - reserved fields, timestamps, equality matching, file I/O

pub mod id;
pub mod io;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// One stored document: field name to JSON value, in insertion order.
pub type Record = Map<String, Value>;

pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Fields managed by the store rather than the schema, in on-disk trailing order.
pub const RESERVED_FIELDS: [&str; 3] = [CREATED_AT_FIELD, UPDATED_AT_FIELD, ID_FIELD];

pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

pub fn record_id(record: &Record) -> Option<&str> {
    record.get(ID_FIELD).and_then(Value::as_str)
}

/// Current time as an ISO-8601 UTC string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lay out a record: `_id`, then the schema fields, then timestamps.
pub fn assemble(id: &str, fields: Record, created_at: Option<Value>, updated_at: Option<Value>) -> Record {
    let mut record = Record::new();
    record.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    for (key, value) in fields {
        if !is_reserved(&key) {
            record.insert(key, value);
        }
    }
    if let Some(created) = created_at {
        record.insert(CREATED_AT_FIELD.to_string(), created);
    }
    if let Some(updated) = updated_at {
        record.insert(UPDATED_AT_FIELD.to_string(), updated);
    }
    record
}

/// Rebuild a record with `createdAt`, `updatedAt` and `_id` as its last fields.
pub fn move_reserved_to_end(record: Record) -> Record {
    let mut reserved: Vec<(String, Value)> = Vec::new();
    let mut out = Record::new();
    for (key, value) in record {
        if is_reserved(&key) {
            reserved.push((key, value));
        } else {
            out.insert(key, value);
        }
    }
    for name in RESERVED_FIELDS {
        if let Some(pos) = reserved.iter().position(|(key, _)| key == name) {
            let (key, value) = reserved.swap_remove(pos);
            out.insert(key, value);
        }
    }
    out
}

/// The caller-visible fields of a record, without reserved fields.
pub fn user_fields(record: &Record) -> Record {
    record
        .iter()
        .filter(|(key, _)| !is_reserved(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// JSON equality where numbers compare by value (`1` equals `1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            if x.is_f64() || y.is_f64() {
                return x.as_f64() == y.as_f64();
            }
            // negative i64 against a u64 above i64::MAX
            false
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// True when every key of `query` is present in `record` with an equal value.
pub fn matches(record: &Record, query: &Record) -> bool {
    query.iter().all(|(key, expected)| {
        record
            .get(key)
            .is_some_and(|actual| values_equal(actual, expected))
    })
}
