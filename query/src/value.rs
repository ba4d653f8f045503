//! The dynamic value type carried by queries and mutations.
//!
//! Every composite node lives behind an `Arc`, so cloning a value is cheap and
//! two values can be checked for *reference* equality with [`Value::ptr_eq`].
//! Structural sharing relies on that distinction: an unchanged subtree keeps
//! its allocation across refetches.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{Error as _, SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::{Error, Result};

pub type Map = BTreeMap<String, Value>;

#[derive(Clone, Default)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Number(Number),
  String(Arc<str>),
  Array(Arc<Vec<Value>>),
  Object(Arc<Map>),
  /// Any Rust value that is not JSON-shaped. Compared by reference only and
  /// never serialized.
  Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
  pub fn array<I>(items: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<Value>,
  {
    Value::Array(Arc::new(items.into_iter().map(Into::into).collect()))
  }

  pub fn object<I, K>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
  {
    Value::Object(Arc::new(
      entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
    ))
  }

  pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
    Value::Opaque(Arc::new(value))
  }

  /// Converts any serializable Rust value.
  pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
    Ok(serde_json::to_value(value)?.into())
  }

  /// Converts back into a concrete Rust type.
  pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.to_json()?)?)
  }

  /// Renders the value as plain JSON. Fails on opaque nodes.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    Ok(match self {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Number(n) => serde_json::Value::Number(n.clone()),
      Value::String(s) => serde_json::Value::String(s.to_string()),
      Value::Array(items) => serde_json::Value::Array(
        items.iter().map(Value::to_json).collect::<Result<_>>()?,
      ),
      Value::Object(map) => serde_json::Value::Object(
        map
          .iter()
          .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
          .collect::<Result<_>>()?,
      ),
      Value::Opaque(_) => {
        return Err(Error::Conversion(
          "opaque values have no JSON representation".into(),
        ))
      }
    })
  }

  /// Reference equality: scalars compare by value, composite nodes by
  /// allocation.
  pub fn ptr_eq(&self, other: &Value) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Number(a), Value::Number(b)) => a == b,
      (Value::String(a), Value::String(b)) => a == b,
      (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
      (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
      (Value::Opaque(a), Value::Opaque(b)) => {
        Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
      }
      _ => false,
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Number(n) => n.as_i64(),
      _ => None,
    }
  }

  pub fn as_u64(&self) -> Option<u64> {
    match self {
      Value::Number(n) => n.as_u64(),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Number(n) => n.as_f64(),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[Value]> {
    match self {
      Value::Array(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&Map> {
    match self {
      Value::Object(map) => Some(map),
      _ => None,
    }
  }

  /// Object field lookup.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_object().and_then(|map| map.get(key))
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    match self {
      Value::Opaque(inner) => inner.downcast_ref::<T>(),
      _ => None,
    }
  }
}

/// Reference equality lifted over optional values.
pub(crate) fn opt_ptr_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
  match (a, b) {
    (Some(a), Some(b)) => a.ptr_eq(b),
    (None, None) => true,
    _ => false,
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b) || a == b,
      (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b) || a == b,
      _ => self.ptr_eq(other),
    }
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => f.write_str("Null"),
      Value::Bool(b) => write!(f, "Bool({b})"),
      Value::Number(n) => write!(f, "Number({n})"),
      Value::String(s) => write!(f, "String({s:?})"),
      Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
      Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
      Value::Opaque(_) => f.write_str("Opaque(..)"),
    }
  }
}

impl From<serde_json::Value> for Value {
  fn from(value: serde_json::Value) -> Self {
    match value {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => Value::Number(n),
      serde_json::Value::String(s) => Value::String(s.into()),
      serde_json::Value::Array(items) => Value::array(items),
      serde_json::Value::Object(map) => Value::object(map.into_iter().map(|(k, v)| (k, v.into()))),
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

macro_rules! number_from {
  ($($ty:ty),*) => {
    $(
      impl From<$ty> for Value {
        fn from(n: $ty) -> Self {
          Value::Number(Number::from(n))
        }
      }
    )*
  };
}

number_from!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<f64> for Value {
  fn from(n: f64) -> Self {
    Number::from_f64(n).map_or(Value::Null, Value::Number)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.into())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s.into())
  }
}

impl From<Vec<Value>> for Value {
  fn from(items: Vec<Value>) -> Self {
    Value::Array(Arc::new(items))
  }
}

impl From<Map> for Value {
  fn from(map: Map) -> Self {
    Value::Object(Arc::new(map))
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(value: Option<T>) -> Self {
    value.map_or(Value::Null, Into::into)
  }
}

impl Serialize for Value {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match self {
      Value::Null => serializer.serialize_unit(),
      Value::Bool(b) => serializer.serialize_bool(*b),
      Value::Number(n) => n.serialize(serializer),
      Value::String(s) => serializer.serialize_str(s),
      Value::Array(items) => {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items.iter() {
          seq.serialize_element(item)?;
        }
        seq.end()
      }
      Value::Object(map) => {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map.iter() {
          out.serialize_entry(k, v)?;
        }
        out.end()
      }
      Value::Opaque(_) => Err(S::Error::custom(
        "opaque values have no serialized representation",
      )),
    }
  }
}

impl<'de> Deserialize<'de> for Value {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    serde_json::Value::deserialize(deserializer).map(Value::from)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn clones_share_composite_nodes() {
    let value = Value::from(json!({ "a": [1, 2, 3] }));
    let copy = value.clone();
    assert!(value.ptr_eq(&copy));

    let rebuilt = Value::from(json!({ "a": [1, 2, 3] }));
    assert!(!value.ptr_eq(&rebuilt));
    assert_eq!(value, rebuilt);
  }

  #[test]
  fn opaque_values_refuse_json() {
    let value = Value::opaque(42_u8);
    assert_eq!(value.downcast_ref::<u8>(), Some(&42));
    assert!(value.to_json().is_err());
  }

  #[test]
  fn typed_conversion() {
    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Todo {
      id: u32,
      title: String,
    }

    let todo = Todo { id: 1, title: "write tests".into() };
    let value = Value::from_serialize(&todo).unwrap();
    assert_eq!(value.get("id").and_then(Value::as_u64), Some(1));
    assert_eq!(value.deserialize::<Todo>().unwrap(), todo);
  }
}
