use crate::error::Error;
use crate::query::{FetchDirection, FetchStatus, QueryStatus};
use crate::value::{opt_ptr_eq, Value};

/// What an observer shows for its query at one point in time.
///
/// A snapshot: it never changes after delivery. `data` is the selected (or
/// placeholder, or previous-key) view, not necessarily what the cache holds.
#[derive(Debug, Clone, Default)]
pub struct QueryObserverResult {
  pub data: Option<Value>,
  pub data_updated_at: u64,
  pub error: Option<Error>,
  pub error_updated_at: u64,
  pub error_update_count: u32,
  pub failure_count: u32,
  pub failure_reason: Option<Error>,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
  /// The query has settled at least once.
  pub is_fetched: bool,
  /// The query has settled since this observer picked it up.
  pub is_fetched_after_mount: bool,
  pub is_placeholder_data: bool,
  /// `data` belongs to the query this observer watched before its key changed.
  pub is_previous_data: bool,
  pub is_stale: bool,
  pub(crate) raw_data: Option<Value>,
  pub(crate) fetch_direction: Option<FetchDirection>,
}

impl QueryObserverResult {
  pub fn is_idle(&self) -> bool {
    self.status == QueryStatus::Idle
  }

  pub fn is_pending(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn is_fetching(&self) -> bool {
    self.fetch_status == FetchStatus::Fetching
  }

  pub fn is_paused(&self) -> bool {
    self.fetch_status == FetchStatus::Paused
  }

  /// Fetching in the background while data is already shown.
  pub fn is_refetching(&self) -> bool {
    self.is_fetching() && !self.is_pending()
  }

  /// The very first fetch is in flight.
  pub fn is_initial_loading(&self) -> bool {
    self.is_pending() && self.is_fetching()
  }

  pub fn is_loading_error(&self) -> bool {
    self.is_error() && self.data_updated_at == 0
  }

  pub fn is_refetch_error(&self) -> bool {
    self.is_error() && self.data_updated_at != 0
  }

  /// Field-by-field equality, comparing values by reference.
  pub(crate) fn shallow_eq(&self, other: &Self) -> bool {
    opt_ptr_eq(self.data.as_ref(), other.data.as_ref())
      && opt_ptr_eq(self.raw_data.as_ref(), other.raw_data.as_ref())
      && self.data_updated_at == other.data_updated_at
      && self.error == other.error
      && self.error_updated_at == other.error_updated_at
      && self.error_update_count == other.error_update_count
      && self.failure_count == other.failure_count
      && self.failure_reason == other.failure_reason
      && self.status == other.status
      && self.fetch_status == other.fetch_status
      && self.fetch_direction == other.fetch_direction
      && self.is_fetched == other.is_fetched
      && self.is_fetched_after_mount == other.is_fetched_after_mount
      && self.is_placeholder_data == other.is_placeholder_data
      && self.is_previous_data == other.is_previous_data
      && self.is_stale == other.is_stale
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn derived_flags() {
    let result = QueryObserverResult {
      status: QueryStatus::Pending,
      fetch_status: FetchStatus::Fetching,
      ..Default::default()
    };
    assert!(result.is_initial_loading());
    assert!(!result.is_refetching());

    let result = QueryObserverResult {
      status: QueryStatus::Error,
      data_updated_at: 10,
      ..Default::default()
    };
    assert!(result.is_refetch_error());
    assert!(!result.is_loading_error());
  }

  #[test]
  fn shallow_eq_compares_data_by_reference() {
    let data = Value::array(vec![Value::from(1)]);
    let a = QueryObserverResult {
      data: Some(data.clone()),
      ..Default::default()
    };
    let same = QueryObserverResult {
      data: Some(data),
      ..Default::default()
    };
    let copy = QueryObserverResult {
      data: Some(Value::array(vec![Value::from(1)])),
      ..Default::default()
    };
    assert!(a.shallow_eq(&same));
    assert!(!a.shallow_eq(&copy));
  }
}
