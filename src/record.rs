//! Read-only row views.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

use crate::error::{FastpgError, FastpgResult};
use crate::value::Value;

/// A row exactly as the driver decoded it.
///
/// Column names are shared between all rows of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub columns: Arc<[String]>,
    pub values: Vec<Value>,
}

impl RawRow {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }
}

/// Immutable mapping view over one result row.
///
/// Keys keep the row's column order. UUID columns are surfaced as their
/// canonical string form.
///
/// ```
/// use std::sync::Arc;
/// use fastpg::{RawRow, Record, Value};
///
/// let columns: Arc<[String]> = vec!["id".to_string(), "name".to_string()].into();
/// let row = Record::new(RawRow::new(columns, vec![Value::Int(7), Value::from("a")]));
///
/// assert_eq!(row.get("id"), Some(&Value::Int(7)));
/// assert_eq!(row.field("name").and_then(Value::as_str), Some("a"));
/// assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id", "name"]);
/// assert_eq!(row.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Record {
    pub fn new(raw: RawRow) -> Self {
        let values = raw.values.into_iter().map(normalize).collect();
        Self {
            columns: raw.columns,
            values,
        }
    }

    /// Look up a column by name. Unknown names yield `None`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)
    }

    /// Attribute-style access; same as [`Record::get`].
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    /// Look up a column by position.
    pub fn get_index(&self, index: usize) -> FastpgResult<&Value> {
        self.values.get(index).ok_or(FastpgError::ColumnIndex {
            index,
            len: self.values.len(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.keys().zip(self.values.iter())
    }

    /// Iterate column names in row order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Uuid(u) => Value::Text(u.hyphenated().to_string()),
        other => other,
    }
}

impl std::ops::Index<usize> for Record {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

static NULL: Value = Value::Null;

/// `record["name"]`; unknown names index to [`Value::Null`].
impl std::ops::Index<&str> for Record {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        self.get(name).unwrap_or(&NULL)
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = &'a str;
    type IntoIter = std::iter::Map<std::slice::Iter<'a, String>, fn(&'a String) -> &'a str>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter().map(String::as_str as fn(&'a String) -> &'a str)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (k, v) in self.items() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
