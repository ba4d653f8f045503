use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// How a cancellation should be applied to an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
  /// Restore the state captured right before the fetch started.
  pub revert: bool,
  /// Suppress the error transition entirely.
  pub silent: bool,
}

impl Default for CancelOptions {
  fn default() -> Self {
    Self {
      revert: true,
      silent: false,
    }
  }
}

impl CancelOptions {
  pub(crate) const SILENT: CancelOptions = CancelOptions {
    revert: false,
    silent: true,
  };
}

/// The error type shared by queries, mutations and their observers.
///
/// Errors are cheap to clone: operation failures are reference counted so the
/// same failure can be stored in an entry's state, handed to every observer
/// and returned to every caller awaiting the shared fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// The query or mutation function itself failed.
  #[error("{0}")]
  Operation(Arc<dyn std::error::Error + Send + Sync + 'static>),

  /// The operation was cancelled before it settled.
  #[error("operation cancelled (revert: {}, silent: {})", .0.revert, .0.silent)]
  Cancelled(CancelOptions),

  /// A fetch was started for a query that has no query function configured.
  #[error("missing query function for query '{query_hash}'")]
  MissingQueryFn { query_hash: String },

  /// A mutation was executed without a mutation function.
  #[error("no mutation function configured")]
  MissingMutationFn,

  /// An observer's `select` transform failed.
  #[error("select failed: {0}")]
  Select(Box<Error>),

  /// A value could not be converted to or from its serialized form.
  #[error("value conversion failed: {0}")]
  Conversion(String),
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for Message {}

impl Error {
  /// Wraps any error produced by user code.
  pub fn new<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Error::Operation(Arc::new(error))
  }

  /// Creates an operation error from a plain message.
  pub fn msg(message: impl Into<String>) -> Self {
    Error::Operation(Arc::new(Message(message.into())))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled(_))
  }

  /// The options the operation was cancelled with, if this is a cancellation.
  pub fn cancel_options(&self) -> Option<CancelOptions> {
    match self {
      Error::Cancelled(options) => Some(*options),
      _ => None,
    }
  }
}

impl PartialEq for Error {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      // Operation failures compare by identity: the same failure shared
      // between the entry state and its observers.
      (Error::Operation(a), Error::Operation(b)) => {
        Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
      }
      (Error::Cancelled(a), Error::Cancelled(b)) => a == b,
      (Error::MissingQueryFn { query_hash: a }, Error::MissingQueryFn { query_hash: b }) => a == b,
      (Error::MissingMutationFn, Error::MissingMutationFn) => true,
      (Error::Select(a), Error::Select(b)) => a == b,
      (Error::Conversion(a), Error::Conversion(b)) => a == b,
      _ => false,
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(error: serde_json::Error) -> Self {
    Error::Conversion(error.to_string())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operation_errors_compare_by_identity() {
    let a = Error::msg("boom");
    let b = Error::msg("boom");
    assert_eq!(a, a.clone());
    assert_ne!(a, b);
    assert_eq!(a.to_string(), "boom");
  }

  #[test]
  fn cancellation_carries_its_options() {
    let error = Error::Cancelled(CancelOptions::SILENT);
    assert!(error.is_cancelled());
    assert_eq!(error.cancel_options(), Some(CancelOptions::SILENT));
    assert!(!Error::MissingMutationFn.is_cancelled());
  }
}
