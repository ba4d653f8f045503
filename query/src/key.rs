//! Query keys, their canonical hashes and partial matching.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A custom key hashing function. Keys that hash equal address the same entry.
pub type KeyHashFn = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;

/// An ordered list of JSON segments identifying a query or a mutation.
///
/// Build one with [`query_key!`](crate::query_key) or from a `Vec` of
/// `serde_json::Value`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<JsonValue>);

/// Mutations are keyed the same way queries are.
pub type MutationKey = QueryKey;

impl QueryKey {
  pub fn new(segments: Vec<JsonValue>) -> Self {
    Self(segments)
  }

  pub fn segments(&self) -> &[JsonValue] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The canonical string form of the key: object fields sorted at every
  /// depth, arrays kept in order.
  pub fn hash(&self) -> String {
    let mut out = String::new();
    out.push('[');
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        out.push(',');
      }
      write_canonical(segment, &mut out);
    }
    out.push(']');
    out
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hash())
  }
}

impl From<Vec<JsonValue>> for QueryKey {
  fn from(segments: Vec<JsonValue>) -> Self {
    Self(segments)
  }
}

impl From<&str> for QueryKey {
  fn from(segment: &str) -> Self {
    Self(vec![JsonValue::String(segment.to_owned())])
  }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
  fn from(segments: [&str; N]) -> Self {
    Self(segments.iter().map(|s| JsonValue::String((*s).to_owned())).collect())
  }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
  match value {
    JsonValue::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    JsonValue::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&JsonValue::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
      }
      out.push('}');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

/// Canonical hash of `key`, honoring a custom hash function when present.
pub fn hash_key_with(key: &QueryKey, hash_fn: Option<&KeyHashFn>) -> String {
  match hash_fn {
    Some(hash_fn) => hash_fn(key),
    None => key.hash(),
  }
}

/// True when `filter` is a prefix of `key`, where each filter segment only
/// needs to be a structural subset of the corresponding key segment.
pub fn partial_match_key(key: &QueryKey, filter: &QueryKey) -> bool {
  filter.len() <= key.len()
    && filter
      .0
      .iter()
      .zip(&key.0)
      .all(|(b, a)| partial_deep_equal(a, b))
}

/// True when every field present in `b` is present and partially equal in
/// `a`. Arrays must match element-wise over `b`'s length.
pub fn partial_deep_equal(a: &JsonValue, b: &JsonValue) -> bool {
  if a == b {
    return true;
  }
  match (a, b) {
    (JsonValue::Object(a), JsonValue::Object(b)) => b
      .iter()
      .all(|(k, bv)| a.get(k).is_some_and(|av| partial_deep_equal(av, bv))),
    (JsonValue::Array(a), JsonValue::Array(b)) => {
      b.len() <= a.len() && b.iter().zip(a).all(|(bv, av)| partial_deep_equal(av, bv))
    }
    _ => false,
  }
}

/// Builds a [`QueryKey`] from JSON-like segments.
///
/// ```
/// use fibre_query::query_key;
///
/// let key = query_key!["todos", { "status": "done", "page": 1 }];
/// assert_eq!(key.hash(), r#"["todos",{"page":1,"status":"done"}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:tt),* $(,)?) => {
    $crate::QueryKey::new(vec![$($crate::__private::json!($segment)),*])
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn hash_ignores_object_field_order() {
    let a = QueryKey::new(vec![json!("todos"), json!({ "a": 1, "b": { "y": 2, "x": 1 } })]);
    let b = QueryKey::new(vec![json!("todos"), json!({ "b": { "x": 1, "y": 2 }, "a": 1 })]);
    assert_eq!(a.hash(), b.hash());
  }

  #[test]
  fn hash_preserves_array_order() {
    let a = QueryKey::new(vec![json!([1, 2])]);
    let b = QueryKey::new(vec![json!([2, 1])]);
    assert_ne!(a.hash(), b.hash());
  }

  #[test]
  fn prefix_matching() {
    let key = crate::query_key!["todos", { "status": "done", "page": 1 }];
    assert!(partial_match_key(&key, &QueryKey::from("todos")));
    assert!(partial_match_key(&key, &crate::query_key!["todos", { "page": 1 }]));
    assert!(!partial_match_key(&key, &crate::query_key!["todos", { "page": 2 }]));
    assert!(!partial_match_key(&key, &crate::query_key!["posts"]));
    assert!(partial_match_key(&key, &QueryKey::default()));
  }

  #[test]
  fn longer_filter_never_matches() {
    let key = QueryKey::from("todos");
    assert!(!partial_match_key(&key, &crate::query_key!["todos", 1]));
  }

  #[test]
  fn custom_hash_fn_is_used() {
    let hash_fn: KeyHashFn = Arc::new(|key| format!("custom:{}", key.len()));
    assert_eq!(hash_key_with(&QueryKey::from("a"), Some(&hash_fn)), "custom:1");
  }
}
