/// Record values
///
/// Records are schemaless documents. Stores only look inside them through
/// key paths, to derive primary keys and index keys.

use crate::{Error, Key, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Document value stored in a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(#[serde(with = "number_repr")] f64),
    String(String),
    /// Milliseconds since the epoch
    Date(i64),
    Binary(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn number(n: impl Into<f64>) -> Self {
        Value::Number(n.into())
    }

    pub fn date(millis: i64) -> Self {
        Value::Date(millis)
    }

    pub fn binary(b: impl Into<Bytes>) -> Self {
        Value::Binary(b.into())
    }

    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a map value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(field))
    }

    /// Resolves a dotted path such as `author.name`.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |value, field| value.get(field))
    }

    /// Writes `value` at a dotted path, creating intermediate maps.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let mut fields = path.split('.').peekable();
        let mut current = self;
        while let Some(field) = fields.next() {
            let map = match current {
                Value::Map(m) => m,
                other => {
                    return Err(Error::InvalidValue(format!(
                        "cannot set '{}' inside a non-map value {:?}",
                        path, other
                    )))
                }
            };
            if fields.peek().is_none() {
                map.insert(field.to_string(), value);
                return Ok(());
            }
            current = map.entry(field.to_string()).or_insert_with(Value::map);
        }
        Err(Error::InvalidValue("empty key path".to_string()))
    }

    /// Interprets this value as a key. Lists become array keys when every
    /// element is a valid key. Null, booleans, maps and NaN are not keys.
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Value::Number(n) => Key::number(*n).ok(),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Date(d) => Some(Key::Date(*d)),
            Value::Binary(b) => Some(Key::Binary(b.clone())),
            Value::List(items) => items.iter().map(Value::to_key).collect::<Option<Vec<_>>>().map(Key::Array),
            Value::Null | Value::Bool(_) | Value::Map(_) => None,
        }
    }

    /// Converts plain JSON. Numbers become `Number`, objects `Map`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to plain JSON. Dates become millisecond numbers and
    /// binaries arrays of bytes.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::Value::from(*d),
            Value::Binary(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Encodes a record for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Storage form of numbers. JSON has no literal for infinities or NaN, so
/// those are written as the strings `"Infinity"`, `"-Infinity"` and `"NaN"`.
mod number_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_finite() {
            serializer.serialize_f64(*n)
        } else if n.is_nan() {
            serializer.serialize_str("NaN")
        } else if *n > 0.0 {
            serializer.serialize_str("Infinity")
        } else {
            serializer.serialize_str("-Infinity")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(n) => Ok(n),
            Repr::Special(s) => match s.as_str() {
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                "NaN" => Ok(f64::NAN),
                other => Err(D::Error::custom(format!("invalid number '{}'", other))),
            },
        }
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Number(n) => Value::Number(n),
            Key::Date(d) => Value::Date(d),
            Key::String(s) => Value::String(s),
            Key::Binary(b) => Value::Binary(b),
            Key::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
