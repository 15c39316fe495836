//! Configuration value model.
//!
//! A document is a root mapping from string keys to [`Value`]s. Values are
//! scalars, nested mappings, ordered lists, or links. A link is stored on
//! disk as a mapping holding the reserved [`LINK_KEY`] whose value is the
//! target path:
//!
//! ```json
//! { "Current": { "__LINK__": "/Sets/8B1C3F0A" } }
//! ```
//!
//! Nested mappings are reference counted so a tree can be snapshotted
//! cheaply and mutated copy-on-write.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{Error as _, SerializeMap};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Reserved key marking a mapping as a link node.
pub const LINK_KEY: &str = "__LINK__";

/// A mapping from key to value.
pub type Mapping = BTreeMap<String, Value>;

/// A leaf value.
///
/// Non-finite reals have no JSON form and fail to serialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Real(f64),
    String(String),
}

/// A node in the configuration tree.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub enum Value {
    Scalar(Scalar),
    Mapping(Arc<Mapping>),
    List(Vec<Value>),
    /// Redirects resolution to another tree path
    Link(String),
}

impl Value {
    /// An empty nested mapping.
    pub fn empty_mapping() -> Self {
        Value::Mapping(Arc::new(Mapping::new()))
    }

    /// Build a mapping value from key/value pairs.
    pub fn mapping<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Mapping(Arc::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Build a link to `target`.
    pub fn link(target: impl Into<String>) -> Self {
        Value::Link(target.into())
    }

    /// Borrow the mapping if this is one.
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the link target if this is a link node.
    pub fn as_link(&self) -> Option<&str> {
        match self {
            Value::Link(target) => Some(target),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self, Value::Mapping(_))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Scalar(Scalar::Integer(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Scalar(Scalar::Integer(n.into()))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(Scalar::Real(x))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::String(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Mapping> for Value {
    fn from(map: Mapping) -> Self {
        Value::Mapping(Arc::new(map))
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Integer(n) => serializer.serialize_i64(*n),
            Scalar::Real(x) if x.is_finite() => serializer.serialize_f64(*x),
            Scalar::Real(x) => Err(S::Error::custom(format!(
                "{} is not a supported configuration value",
                x
            ))),
            Scalar::String(s) => serializer.serialize_str(s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Scalar(scalar) => scalar.serialize(serializer),
            Value::Mapping(map) => map.as_ref().serialize(serializer),
            Value::List(items) => items.serialize(serializer),
            Value::Link(target) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(LINK_KEY, target)?;
                map.end()
            }
        }
    }
}

/// Errors converting decoded JSON into a [`Value`].
#[derive(Debug, Clone, Error)]
pub enum ValueError {
    #[error("null is not a supported configuration value")]
    Null,

    #[error("link target must be a string")]
    LinkTarget,

    #[error("number {0} is out of range")]
    Number(String),
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        match json {
            serde_json::Value::Null => Err(ValueError::Null),
            serde_json::Value::Bool(b) => Ok(Value::from(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::from(i))
                } else if let Some(x) = n.as_f64() {
                    Ok(Value::from(x))
                } else {
                    Err(ValueError::Number(n.to_string()))
                }
            }
            serde_json::Value::String(s) => Ok(Value::from(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            serde_json::Value::Object(mut map) => {
                if let Some(target) = map.remove(LINK_KEY) {
                    return match target {
                        serde_json::Value::String(target) => Ok(Value::Link(target)),
                        _ => Err(ValueError::LinkTarget),
                    };
                }
                let mut mapping = Mapping::new();
                for (key, value) in map {
                    mapping.insert(key, Value::try_from(value)?);
                }
                Ok(Value::from(mapping))
            }
        }
    }
}
