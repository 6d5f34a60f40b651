//! Value coercion: application values into values the driver can bind.

use crate::value::Value;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A value ready to be bound as a query argument.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    LocalTimestamp(NaiveDateTime),
    Date(NaiveDate),
}

/// Coerce one application value.
///
/// - structured values become compact JSON text
/// - UUIDs become their lowercase hyphenated string
/// - enums become their underlying value, never their label
/// - scalars pass through
pub fn coerce(value: &Value) -> DriverValue {
    match value {
        Value::Json(json) => DriverValue::Text(json.to_string()),
        Value::Uuid(u) => DriverValue::Text(u.hyphenated().to_string()),
        Value::Enum { value, .. } => coerce(value),
        Value::Null => DriverValue::Null,
        Value::Bool(b) => DriverValue::Bool(*b),
        Value::Int(i) => DriverValue::Int(*i),
        Value::Float(f) => DriverValue::Float(*f),
        Value::Text(s) => DriverValue::Text(s.clone()),
        Value::Bytes(b) => DriverValue::Bytes(b.clone()),
        Value::Timestamp(ts) => DriverValue::Timestamp(*ts),
        Value::LocalTimestamp(ts) => DriverValue::LocalTimestamp(*ts),
        Value::Date(d) => DriverValue::Date(*d),
    }
}

/// Coerce a whole record, keeping column order.
pub fn coerce_row(row: &[Value]) -> Vec<DriverValue> {
    row.iter().map(coerce).collect()
}
