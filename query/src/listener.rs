use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An ordered set of listeners, each addressable by the id it was given on
/// registration.
pub(crate) struct Listeners<L: ?Sized> {
  next_id: AtomicU64,
  entries: Mutex<Vec<(u64, Arc<L>)>>,
}

impl<L: ?Sized> Listeners<L> {
  pub(crate) fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      entries: Mutex::new(Vec::new()),
    }
  }

  /// Registers a listener. Returns its id and the listener count afterwards.
  pub(crate) fn add(&self, listener: Arc<L>) -> (u64, usize) {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let mut entries = self.entries.lock();
    entries.push((id, listener));
    (id, entries.len())
  }

  /// Removes a listener. Returns the remaining count, or `None` if the id was
  /// not registered.
  pub(crate) fn remove(&self, id: u64) -> Option<usize> {
    let mut entries = self.entries.lock();
    let index = entries.iter().position(|(entry_id, _)| *entry_id == id)?;
    entries.remove(index);
    Some(entries.len())
  }

  /// A copy of the current listeners, safe to invoke without holding the lock.
  pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
    self.entries.lock().iter().map(|(_, l)| l.clone()).collect()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  pub(crate) fn clear(&self) {
    self.entries.lock().clear();
  }
}

/// A handle to a registered listener.
///
/// Dropping the handle leaves the listener registered for the lifetime of the
/// subscribed object; call [`Subscription::unsubscribe`] to detach it.
#[must_use = "call `unsubscribe` to detach the listener"]
pub struct Subscription {
  unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
  pub(crate) fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
    Self {
      unsubscribe: Some(Box::new(unsubscribe)),
    }
  }

  /// Detaches the listener.
  pub fn unsubscribe(mut self) {
    if let Some(unsubscribe) = self.unsubscribe.take() {
      unsubscribe();
    }
  }
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription")
      .field("active", &self.unsubscribe.is_some())
      .finish()
  }
}
