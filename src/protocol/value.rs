//! Dynamic values carried by the object protocol.
//!
//! Every message exchanged with the worker, the replication subscribers and
//! the control clients is a [`Value`] (or a serde type whose fields are
//! values). On the wire a value is a single JSON document. Kinds that JSON
//! cannot express natively use a one-key object tag:
//!
//! ```text
//! big integer   {"__int__": "123456789012345678901234567890"}
//! NaN / ±inf    {"__float__": "nan" | "inf" | "-inf"}
//! bytes         {"__bytes__": "deadbeef"}
//! tuple         {"__tuple__": [1, "a"]}
//! mapping       {"__dict__": [[0, "x"], [1, "y"]]}   (non-string keys)
//! ```
//!
//! Mappings whose keys are all strings are written as plain JSON objects.

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::de::{self, DeserializeOwned};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{MasterError, MasterResult};

const INT_TAG: &str = "__int__";
const FLOAT_TAG: &str = "__float__";
const BYTES_TAG: &str = "__bytes__";
const TUPLE_TAG: &str = "__tuple__";
const DICT_TAG: &str = "__dict__";
const RESERVED_TAGS: [&str; 5] = [INT_TAG, FLOAT_TAG, BYTES_TAG, TUPLE_TAG, DICT_TAG];

/// A dynamically typed value.
///
/// Mappings keep their entries in insertion order but compare equal
/// regardless of order. Integers outside the `i64` range are stored as
/// [`Value::BigInt`]; a `BigInt` that fits in `i64` is always normalized to
/// [`Value::Int`].
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absence of a value (`null`)
    #[default]
    None,
    /// Boolean
    Bool(bool),
    /// Integer that fits in 64 bits
    Int(i64),
    /// Integer outside the `i64` range
    BigInt(BigInt),
    /// Double-precision float, including NaN and the infinities
    Float(f64),
    /// Text
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Mutable sequence
    List(Vec<Value>),
    /// Immutable sequence; may be used as a mapping key
    Tuple(Vec<Value>),
    /// Mapping with arbitrary keys, in insertion order
    Dict(Vec<(Value, Value)>),
}

impl Value {
    /// An empty mapping.
    pub fn dict() -> Self {
        Value::Dict(Vec::new())
    }

    /// An empty sequence.
    pub fn list() -> Self {
        Value::List(Vec::new())
    }

    /// Builds a string-keyed mapping.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v))
                .collect(),
        )
    }

    /// Wraps an arbitrary precision integer, normalizing small ones.
    pub fn big(n: BigInt) -> Self {
        match n.to_i64() {
            Some(i) => Value::Int(i),
            None => Value::BigInt(n),
        }
    }

    /// Short name of the value kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::BigInt(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
        }
    }

    /// True for [`Value::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Text, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view. A [`Value::BigInt`] never fits, so it yields `None`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers are widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::BigInt(b) => b.to_f64(),
            _ => None,
        }
    }

    /// Boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Elements of a list. Tuples are not lists.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Entries of a mapping, in insertion order.
    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a string key in a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Looks up an arbitrary key in a mapping.
    pub fn get_key(&self, key: &Value) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Converts any serializable type into a value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> MasterResult<Value> {
        let json = serde_json::to_value(value)?;
        Value::from_json(json).map_err(MasterError::Protocol)
    }

    /// Converts this value into a typed structure.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> MasterResult<T> {
        let json = serde_json::to_value(self)?;
        Ok(serde_json::from_value(json)?)
    }

    /// Parses the JSON representation described in the module docs.
    pub fn from_json(json: serde_json::Value) -> Result<Value, String> {
        use serde_json::Value as Json;

        Ok(match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::BigInt(BigInt::from(u))
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Str(s),
            Json::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some((tag, inner)) = map.iter().next() {
                        if RESERVED_TAGS.contains(&tag.as_str()) {
                            return decode_tagged(tag, inner.clone());
                        }
                    }
                }
                Value::Dict(
                    map.into_iter()
                        .map(|(k, v)| Ok((Value::Str(k), Value::from_json(v)?)))
                        .collect::<Result<_, String>>()?,
                )
            }
        })
    }
}

fn decode_tagged(tag: &str, inner: serde_json::Value) -> Result<Value, String> {
    use serde_json::Value as Json;

    match (tag, inner) {
        (INT_TAG, Json::String(digits)) => digits
            .parse::<BigInt>()
            .map(Value::big)
            .map_err(|e| format!("invalid big integer {digits:?}: {e}")),
        (FLOAT_TAG, Json::String(special)) => match special.as_str() {
            "nan" => Ok(Value::Float(f64::NAN)),
            "inf" => Ok(Value::Float(f64::INFINITY)),
            "-inf" => Ok(Value::Float(f64::NEG_INFINITY)),
            other => Err(format!("invalid special float {other:?}")),
        },
        (BYTES_TAG, Json::String(encoded)) => hex::decode(&encoded)
            .map(Value::Bytes)
            .map_err(|e| format!("invalid bytes encoding: {e}")),
        (TUPLE_TAG, Json::Array(items)) => Ok(Value::Tuple(
            items
                .into_iter()
                .map(Value::from_json)
                .collect::<Result<_, _>>()?,
        )),
        (DICT_TAG, Json::Array(entries)) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry {
                    Json::Array(mut kv) if kv.len() == 2 => {
                        let v = Value::from_json(kv.pop().unwrap_or_default())?;
                        let k = Value::from_json(kv.pop().unwrap_or_default())?;
                        pairs.push((k, v));
                    }
                    other => return Err(format!("invalid mapping entry {other}")),
                }
            }
            Ok(Value::Dict(pairs))
        }
        (tag, other) => Err(format!("invalid payload for {tag}: {other}")),
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(other_k, other_v)| k == other_k && v == other_v)
                    })
            }
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::BigInt(b) => tagged(serializer, INT_TAG, &b.to_string()),
            Value::Float(f) if f.is_finite() => serializer.serialize_f64(*f),
            Value::Float(f) => {
                let special = if f.is_nan() {
                    "nan"
                } else if *f > 0.0 {
                    "inf"
                } else {
                    "-inf"
                };
                tagged(serializer, FLOAT_TAG, special)
            }
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => tagged(serializer, BYTES_TAG, &hex::encode(bytes)),
            Value::List(items) => serializer.collect_seq(items),
            Value::Tuple(items) => tagged(serializer, TUPLE_TAG, items),
            Value::Dict(entries) if is_plain_object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    if let Value::Str(key) = k {
                        map.serialize_entry(key, v)?;
                    }
                }
                map.end()
            }
            Value::Dict(entries) => {
                let pairs: Vec<(&Value, &Value)> = entries.iter().map(|(k, v)| (k, v)).collect();
                tagged(serializer, DICT_TAG, &pairs)
            }
        }
    }
}

fn is_plain_object(entries: &[(Value, Value)]) -> bool {
    let all_strings = entries.iter().all(|(k, _)| matches!(k, Value::Str(_)));
    let looks_tagged = entries.len() == 1
        && entries[0]
            .0
            .as_str()
            .is_some_and(|k| RESERVED_TAGS.contains(&k));
    all_strings && !looks_tagged
}

fn tagged<S, T>(serializer: S, tag: &str, payload: &T) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + ?Sized,
{
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(tag, payload)?;
    map.end()
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(json).map_err(de::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "<{}>", self.kind()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::big(BigInt::from(u))
    }
}

impl From<usize> for Value {
    fn from(u: usize) -> Self {
        Value::big(BigInt::from(u))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::None, Into::into)
    }
}
