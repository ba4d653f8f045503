use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::now_millis;
use crate::value::Value;

/// Where a query's data stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
  /// No data and no attempt yet.
  #[default]
  Idle,
  /// No data; the first fetch is underway or paused.
  Pending,
  Success,
  Error,
}

/// Whether a fetch is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchStatus {
  #[default]
  Idle,
  Fetching,
  /// A fetch is underway but waiting for focus or connectivity.
  Paused,
}

/// Which end of an infinite query is being extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchDirection {
  Forward,
  Backward,
}

/// The full state of one query.
///
/// `status == Success` implies `error.is_none()`; timestamps are
/// milliseconds since the Unix epoch, `0` meaning never.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
  pub data: Option<Value>,
  pub data_update_count: u32,
  pub data_updated_at: u64,
  pub error: Option<Error>,
  pub error_update_count: u32,
  pub error_updated_at: u64,
  pub failure_count: u32,
  pub failure_reason: Option<Error>,
  pub fetch_direction: Option<FetchDirection>,
  pub is_invalidated: bool,
  pub status: QueryStatus,
  pub fetch_status: FetchStatus,
}

impl QueryState {
  /// True when there is no data at all (idle or pending).
  pub fn has_no_data(&self) -> bool {
    matches!(self.status, QueryStatus::Idle | QueryStatus::Pending)
  }
}

/// A state transition of a query.
#[derive(Debug, Clone)]
pub enum QueryAction {
  Fetch {
    direction: Option<FetchDirection>,
    can_fetch: bool,
  },
  Failed {
    failure_count: u32,
    error: Error,
  },
  Pause,
  Continue,
  Success {
    data: Value,
    data_updated_at: Option<u64>,
    manual: bool,
  },
  Error {
    error: Error,
  },
  Invalidate,
  SetState {
    state: QueryState,
  },
}

/// Applies `action` to `state`. `revert` is the state captured when the
/// current fetch started; a cancellation asking to revert restores it.
pub(crate) fn reduce(state: &QueryState, action: &QueryAction, revert: Option<&QueryState>) -> QueryState {
  let mut next = state.clone();
  match action {
    QueryAction::Failed { failure_count, error } => {
      next.failure_count = *failure_count;
      next.failure_reason = Some(error.clone());
    }
    QueryAction::Pause => next.fetch_status = FetchStatus::Paused,
    QueryAction::Continue => next.fetch_status = FetchStatus::Fetching,
    QueryAction::Fetch { direction, can_fetch } => {
      next.failure_count = 0;
      next.failure_reason = None;
      next.fetch_direction = *direction;
      next.fetch_status = if *can_fetch {
        FetchStatus::Fetching
      } else {
        FetchStatus::Paused
      };
      if next.data_updated_at == 0 {
        next.error = None;
        next.status = QueryStatus::Pending;
      }
    }
    QueryAction::Success {
      data,
      data_updated_at,
      manual,
    } => {
      next.data = Some(data.clone());
      next.data_update_count += 1;
      next.data_updated_at = data_updated_at.unwrap_or_else(now_millis);
      next.error = None;
      next.is_invalidated = false;
      next.status = QueryStatus::Success;
      if !manual {
        next.fetch_status = FetchStatus::Idle;
        next.failure_count = 0;
        next.failure_reason = None;
      }
    }
    QueryAction::Error { error } => {
      if let (Some(options), Some(revert)) = (error.cancel_options(), revert) {
        if options.revert {
          return QueryState {
            fetch_status: FetchStatus::Idle,
            ..revert.clone()
          };
        }
      }
      next.error = Some(error.clone());
      next.error_update_count += 1;
      next.error_updated_at = now_millis();
      next.failure_count += 1;
      next.failure_reason = Some(error.clone());
      next.fetch_status = FetchStatus::Idle;
      next.status = QueryStatus::Error;
    }
    QueryAction::Invalidate => next.is_invalidated = true,
    QueryAction::SetState { state } => return state.clone(),
  }
  next
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CancelOptions;

  fn fetch() -> QueryAction {
    QueryAction::Fetch {
      direction: None,
      can_fetch: true,
    }
  }

  #[test]
  fn first_fetch_moves_to_pending() {
    let state = reduce(&QueryState::default(), &fetch(), None);
    assert_eq!(state.status, QueryStatus::Pending);
    assert_eq!(state.fetch_status, FetchStatus::Fetching);
  }

  #[test]
  fn offline_fetch_starts_paused() {
    let action = QueryAction::Fetch {
      direction: None,
      can_fetch: false,
    };
    let state = reduce(&QueryState::default(), &action, None);
    assert_eq!(state.fetch_status, FetchStatus::Paused);
  }

  #[test]
  fn success_clears_error_and_counts_updates() {
    let failed = reduce(
      &reduce(&QueryState::default(), &fetch(), None),
      &QueryAction::Error {
        error: Error::msg("x"),
      },
      None,
    );
    assert_eq!(failed.status, QueryStatus::Error);
    assert_eq!(failed.failure_count, 1);

    let state = reduce(
      &failed,
      &QueryAction::Success {
        data: Value::from(1),
        data_updated_at: Some(42),
        manual: false,
      },
      None,
    );
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_none());
    assert_eq!(state.data_update_count, 1);
    assert_eq!(state.data_updated_at, 42);
    assert_eq!(state.failure_count, 0);
  }

  #[test]
  fn refetch_keeps_existing_data_status() {
    let success = reduce(
      &QueryState::default(),
      &QueryAction::Success {
        data: Value::from("a"),
        data_updated_at: Some(1),
        manual: true,
      },
      None,
    );
    let refetching = reduce(&success, &fetch(), None);
    assert_eq!(refetching.status, QueryStatus::Success);
    assert_eq!(refetching.fetch_status, FetchStatus::Fetching);
  }

  #[test]
  fn cancelled_fetch_reverts_to_captured_state() {
    let before = QueryState::default();
    let fetching = reduce(&before, &fetch(), None);
    let cancelled = QueryAction::Error {
      error: Error::Cancelled(CancelOptions {
        revert: true,
        silent: false,
      }),
    };
    let state = reduce(&fetching, &cancelled, Some(&before));
    assert_eq!(state, before);
  }
}
