use std::{fmt, future::Future, pin::Pin, sync::Arc};

use crate::connectivity::{FocusManager, OnlineManager};
use crate::notify::NotifyManager;
use crate::retryer::NetworkMode;

/// A trait for spawning a future onto an asynchronous runtime.
pub trait TaskSpawner: Send + Sync + 'static {
  /// Spawns a type-erased future.
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
}

/// Spawns onto a Tokio runtime.
///
/// Without an explicit handle, tasks go to the runtime of the calling
/// context, so a client built in one test runtime keeps working there.
#[derive(Debug, Clone, Default)]
pub struct TokioSpawner(Option<tokio::runtime::Handle>);

impl TokioSpawner {
  /// Creates a spawner that uses the ambient Tokio runtime at spawn time.
  pub fn new() -> Self {
    Self(None)
  }

  /// Creates a spawner pinned to a specific runtime.
  pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
    Self(Some(handle))
  }
}

impl TaskSpawner for TokioSpawner {
  fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>) {
    match &self.0 {
      Some(handle) => {
        handle.spawn(future);
      }
      None => {
        tokio::spawn(future);
      }
    }
  }
}

/// Everything a cache entry needs from its surroundings: where to run
/// background work, how to deliver notifications and what the connectivity
/// signals currently say.
#[derive(Clone)]
pub(crate) struct RuntimeContext {
  pub(crate) spawner: Arc<dyn TaskSpawner>,
  pub(crate) notify: NotifyManager,
  pub(crate) focus: FocusManager,
  pub(crate) online: OnlineManager,
}

impl RuntimeContext {
  pub(crate) fn spawn<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.spawner.spawn(Box::pin(future));
  }

  /// Whether an operation in `mode` may start right now.
  pub(crate) fn can_fetch(&self, mode: NetworkMode) -> bool {
    mode != NetworkMode::Online || self.online.is_online()
  }

  /// Whether a retrying operation in `mode` should hold off before its next
  /// attempt.
  pub(crate) fn should_pause(&self, mode: NetworkMode) -> bool {
    !self.focus.is_focused() || (mode != NetworkMode::Always && !self.online.is_online())
  }
}

impl fmt::Debug for RuntimeContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RuntimeContext")
      .field("focused", &self.focus.is_focused())
      .field("online", &self.online.is_online())
      .finish_non_exhaustive()
  }
}
