//! Structural sharing between successive results.

use std::sync::Arc;

use crate::value::{Map, Value};

/// Returns `next`, reusing every subtree of `prev` that is deep-equal to its
/// counterpart. When nothing changed at all, `prev` itself is returned, so
/// `result.ptr_eq(prev)` tells callers the data is unchanged.
pub fn replace_equal_deep(prev: &Value, next: Value) -> Value {
  if prev.ptr_eq(&next) {
    return prev.clone();
  }

  match (prev, &next) {
    (Value::Array(a), Value::Array(b)) => {
      let mut equal_items = 0;
      let items: Vec<Value> = b
        .iter()
        .enumerate()
        .map(|(i, item)| match a.get(i) {
          Some(old) => {
            let merged = replace_equal_deep(old, item.clone());
            if merged.ptr_eq(old) {
              equal_items += 1;
            }
            merged
          }
          None => item.clone(),
        })
        .collect();

      if a.len() == b.len() && equal_items == a.len() {
        prev.clone()
      } else {
        Value::Array(Arc::new(items))
      }
    }
    (Value::Object(a), Value::Object(b)) => {
      let mut equal_items = 0;
      let fields: Map = b
        .iter()
        .map(|(key, item)| {
          let merged = match a.get(key) {
            Some(old) => {
              let merged = replace_equal_deep(old, item.clone());
              if merged.ptr_eq(old) {
                equal_items += 1;
              }
              merged
            }
            None => item.clone(),
          };
          (key.clone(), merged)
        })
        .collect();

      if a.len() == b.len() && equal_items == a.len() {
        prev.clone()
      } else {
        Value::Object(Arc::new(fields))
      }
    }
    _ => next,
  }
}

/// Applies structural sharing against the previous data when enabled.
pub(crate) fn replace_data(prev: Option<&Value>, next: Value, structural_sharing: bool) -> Value {
  match prev {
    Some(prev) if structural_sharing => replace_equal_deep(prev, next),
    _ => next,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn v(json: serde_json::Value) -> Value {
    Value::from(json)
  }

  #[test]
  fn identical_trees_return_previous_reference() {
    let prev = v(json!({ "todos": [{ "id": 1, "done": false }], "total": 1 }));
    let next = v(json!({ "todos": [{ "id": 1, "done": false }], "total": 1 }));
    let merged = replace_equal_deep(&prev, next);
    assert!(merged.ptr_eq(&prev));
  }

  #[test]
  fn unchanged_subtrees_are_reused() {
    let prev = v(json!({ "a": { "x": 1 }, "b": { "y": 2 } }));
    let next = v(json!({ "a": { "x": 1 }, "b": { "y": 3 } }));
    let merged = replace_equal_deep(&prev, next.clone());

    assert!(!merged.ptr_eq(&prev));
    assert_eq!(merged, next);
    assert!(merged.get("a").unwrap().ptr_eq(prev.get("a").unwrap()));
    assert!(!merged.get("b").unwrap().ptr_eq(prev.get("b").unwrap()));
  }

  #[test]
  fn array_length_change_rebuilds_container_but_keeps_items() {
    let prev = v(json!([{ "id": 1 }, { "id": 2 }]));
    let next = v(json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }]));
    let merged = replace_equal_deep(&prev, next);

    let (old, new) = (prev.as_array().unwrap(), merged.as_array().unwrap());
    assert_eq!(new.len(), 3);
    assert!(new[0].ptr_eq(&old[0]));
    assert!(new[1].ptr_eq(&old[1]));
  }

  #[test]
  fn removed_object_field_is_a_change() {
    let prev = v(json!({ "a": 1, "b": 2 }));
    let next = v(json!({ "a": 1 }));
    let merged = replace_equal_deep(&prev, next);
    assert!(!merged.ptr_eq(&prev));
    assert_eq!(merged, v(json!({ "a": 1 })));
  }

  #[test]
  fn type_change_takes_next() {
    let prev = v(json!([1, 2]));
    let next = v(json!({ "0": 1 }));
    assert_eq!(replace_equal_deep(&prev, next.clone()), next);
  }

  #[test]
  fn sharing_can_be_disabled() {
    let prev = v(json!({ "a": 1 }));
    let next = v(json!({ "a": 1 }));
    let merged = replace_data(Some(&prev), next, false);
    assert!(!merged.ptr_eq(&prev));
  }
}
