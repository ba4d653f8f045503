use std::fmt;
use std::sync::Arc;

use super::{Cleanup, EventInstaller, Signal, SignalSetter};
use crate::listener::Subscription;

/// Tracks network connectivity. Defaults to online.
#[derive(Clone)]
pub struct OnlineManager {
  signal: Arc<Signal>,
}

impl Default for OnlineManager {
  fn default() -> Self {
    Self::new()
  }
}

impl OnlineManager {
  pub fn new() -> Self {
    Self {
      signal: Signal::new("online"),
    }
  }

  pub fn is_online(&self) -> bool {
    self.signal.current()
  }

  pub fn set_online(&self, online: Option<bool>) {
    self.signal.set(online);
  }

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

impl fmt::Debug for OnlineManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OnlineManager")
      .field("online", &self.is_online())
      .finish()
  }
}
