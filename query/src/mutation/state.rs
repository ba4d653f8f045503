use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::now_millis;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
  #[default]
  Idle,
  Pending,
  Success,
  Error,
}

/// The full state of one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationState {
  /// Whatever `on_mutate` returned, handed to the later callbacks.
  pub context: Option<Value>,
  pub data: Option<Value>,
  pub error: Option<Error>,
  pub failure_count: u32,
  pub failure_reason: Option<Error>,
  /// Waiting for connectivity before (or between) attempts.
  pub is_paused: bool,
  pub status: MutationStatus,
  pub variables: Option<Value>,
  /// When `execute` was called (ms since the Unix epoch), `0` if never.
  pub submitted_at: u64,
}

impl MutationState {
  pub fn is_idle(&self) -> bool {
    self.status == MutationStatus::Idle
  }

  pub fn is_pending(&self) -> bool {
    self.status == MutationStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == MutationStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == MutationStatus::Error
  }
}

/// What a mutation observer shows.
pub type MutationObserverResult = MutationState;

#[derive(Debug, Clone)]
pub enum MutationAction {
  Pending {
    variables: Option<Value>,
    context: Option<Value>,
    is_paused: bool,
  },
  Failed {
    failure_count: u32,
    error: Error,
  },
  Pause,
  Continue,
  Success {
    data: Value,
  },
  Error {
    error: Error,
  },
  SetState {
    state: MutationState,
  },
}

pub(crate) fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
  let mut next = state.clone();
  match action {
    MutationAction::Pending {
      variables,
      context,
      is_paused,
    } => {
      let submitted_at = if state.status == MutationStatus::Pending {
        state.submitted_at
      } else {
        now_millis()
      };
      next = MutationState {
        context: context.clone(),
        variables: variables.clone(),
        is_paused: *is_paused,
        status: MutationStatus::Pending,
        submitted_at,
        ..MutationState::default()
      };
    }
    MutationAction::Failed { failure_count, error } => {
      next.failure_count = *failure_count;
      next.failure_reason = Some(error.clone());
    }
    MutationAction::Pause => next.is_paused = true,
    MutationAction::Continue => next.is_paused = false,
    MutationAction::Success { data } => {
      next.data = Some(data.clone());
      next.error = None;
      next.failure_count = 0;
      next.failure_reason = None;
      next.is_paused = false;
      next.status = MutationStatus::Success;
    }
    MutationAction::Error { error } => {
      next.data = None;
      next.error = Some(error.clone());
      next.failure_count += 1;
      next.failure_reason = Some(error.clone());
      next.is_paused = false;
      next.status = MutationStatus::Error;
    }
    MutationAction::SetState { state } => return state.clone(),
  }
  next
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pending_resets_previous_outcome() {
    let failed = reduce(
      &MutationState::default(),
      &MutationAction::Error {
        error: Error::msg("boom"),
      },
    );
    assert_eq!(failed.failure_count, 1);

    let pending = reduce(
      &failed,
      &MutationAction::Pending {
        variables: Some(Value::from(1)),
        context: None,
        is_paused: true,
      },
    );
    assert!(pending.is_pending());
    assert!(pending.is_paused);
    assert!(pending.error.is_none());
    assert_eq!(pending.failure_count, 0);
    assert!(pending.submitted_at > 0);
  }

  #[test]
  fn context_update_keeps_submission_time() {
    let first = reduce(
      &MutationState::default(),
      &MutationAction::Pending {
        variables: None,
        context: None,
        is_paused: false,
      },
    );
    let second = reduce(
      &first,
      &MutationAction::Pending {
        variables: None,
        context: Some(Value::from("ctx")),
        is_paused: false,
      },
    );
    assert_eq!(second.submitted_at, first.submitted_at);
    assert_eq!(second.context, Some(Value::from("ctx")));
  }

  #[test]
  fn success_clears_pause() {
    let state = MutationState {
      is_paused: true,
      status: MutationStatus::Pending,
      ..Default::default()
    };
    let done = reduce(&state, &MutationAction::Success { data: Value::from(2) });
    assert!(done.is_success());
    assert!(!done.is_paused);
  }
}
