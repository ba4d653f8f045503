use std::fmt;
use std::sync::Arc;

use super::{Cleanup, EventInstaller, Signal, SignalSetter};
use crate::listener::Subscription;

/// Tracks whether the application is in the foreground.
///
/// Cheap to clone; clones observe the same signal. Defaults to focused until
/// told otherwise.
#[derive(Clone)]
pub struct FocusManager {
  signal: Arc<Signal>,
}

impl Default for FocusManager {
  fn default() -> Self {
    Self::new()
  }
}

impl FocusManager {
  pub fn new() -> Self {
    Self {
      signal: Signal::new("focus"),
    }
  }

  pub fn is_focused(&self) -> bool {
    self.signal.current()
  }

  /// Overrides the focus state. `None` restores the default. Listeners only
  /// hear about actual changes.
  pub fn set_focused(&self, focused: Option<bool>) {
    self.signal.set(focused);
  }

  /// Replaces the platform hook. The previous hook is cleaned up first.
  pub fn set_event_listener<F>(&self, installer: F)
  where
    F: Fn(SignalSetter) -> Option<Cleanup> + Send + Sync + 'static,
  {
    let installer: EventInstaller = Arc::new(installer);
    self.signal.set_event_installer(installer);
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    self.signal.subscribe(Arc::new(listener))
  }

  pub fn has_listeners(&self) -> bool {
    self.signal.has_listeners()
  }
}

impl fmt::Debug for FocusManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FocusManager")
      .field("focused", &self.is_focused())
      .finish()
  }
}
