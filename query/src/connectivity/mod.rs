//! Process-wide boolean signals: window focus and network connectivity.
//!
//! Both managers share one core. A platform hook ("event installer") feeds the
//! signal; it is installed when the first listener subscribes (or when it is
//! replaced) and torn down when the last listener leaves.

mod focus;
mod online;

pub use focus::FocusManager;
pub use online::OnlineManager;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::listener::{Listeners, Subscription};

/// Sets the signal. `None` clears any manual override and falls back to the
/// default (`true`).
pub type SignalSetter = Arc<dyn Fn(Option<bool>) + Send + Sync>;

/// Undoes whatever an [`EventInstaller`] set up.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Hooks the signal up to a platform event source.
pub type EventInstaller = Arc<dyn Fn(SignalSetter) -> Option<Cleanup> + Send + Sync>;

type SignalListener = dyn Fn(bool) + Send + Sync;

struct Installation {
  installed: bool,
  cleanup: Option<Cleanup>,
}

pub(crate) struct Signal {
  name: &'static str,
  value: Mutex<Option<bool>>,
  listeners: Listeners<SignalListener>,
  installer: Mutex<EventInstaller>,
  installation: Mutex<Installation>,
}

impl Signal {
  pub(crate) fn new(name: &'static str) -> Arc<Self> {
    Arc::new(Self {
      name,
      value: Mutex::new(None),
      listeners: Listeners::new(),
      installer: Mutex::new(Arc::new(|_: SignalSetter| -> Option<Cleanup> { None })),
      installation: Mutex::new(Installation {
        installed: false,
        cleanup: None,
      }),
    })
  }

  pub(crate) fn current(&self) -> bool {
    self.value.lock().unwrap_or(true)
  }

  pub(crate) fn set(&self, value: Option<bool>) {
    let changed = {
      let mut slot = self.value.lock();
      let before = slot.unwrap_or(true);
      *slot = value;
      let after = slot.unwrap_or(true);
      (before != after).then_some(after)
    };
    if let Some(current) = changed {
      tracing::debug!(signal = self.name, value = current, "signal changed");
      for listener in self.listeners.snapshot() {
        listener(current);
      }
    }
  }

  pub(crate) fn subscribe(self: &Arc<Self>, listener: Arc<SignalListener>) -> Subscription {
    let (id, _) = self.listeners.add(listener);
    let needs_install = !self.installation.lock().installed;
    if needs_install {
      self.install();
    }

    let weak = Arc::downgrade(self);
    Subscription::new(move || {
      if let Some(signal) = weak.upgrade() {
        if signal.listeners.remove(id) == Some(0) {
          signal.uninstall();
        }
      }
    })
  }

  /// Swaps the installer. The old one is cleaned up and the new one installed
  /// right away, whether or not anyone is subscribed.
  pub(crate) fn set_event_installer(self: &Arc<Self>, installer: EventInstaller) {
    *self.installer.lock() = installer;
    self.uninstall();
    self.install();
  }

  pub(crate) fn has_listeners(&self) -> bool {
    !self.listeners.is_empty()
  }

  fn install(self: &Arc<Self>) {
    let installer = self.installer.lock().clone();
    let cleanup = installer(setter(Arc::downgrade(self)));
    let previous = {
      let mut installation = self.installation.lock();
      installation.installed = true;
      std::mem::replace(&mut installation.cleanup, cleanup)
    };
    if let Some(previous) = previous {
      previous();
    }
  }

  fn uninstall(&self) {
    let cleanup = {
      let mut installation = self.installation.lock();
      installation.installed = false;
      installation.cleanup.take()
    };
    if let Some(cleanup) = cleanup {
      cleanup();
    }
  }
}

fn setter(signal: Weak<Signal>) -> SignalSetter {
  Arc::new(move |value| {
    if let Some(signal) = signal.upgrade() {
      signal.set(value);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn repeated_values_are_suppressed() {
    let signal = Signal::new("test");
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let subscription = signal.subscribe(Arc::new(move |_: bool| {
      c.fetch_add(1, Ordering::SeqCst);
    }));

    signal.set(Some(true));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    signal.set(Some(false));
    signal.set(Some(false));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    signal.set(None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(signal.current());
    subscription.unsubscribe();
  }

  #[test]
  fn installer_lifecycle_follows_subscribers() {
    let signal = Signal::new("test");
    let installs = Arc::new(AtomicUsize::new(0));
    let cleanups = Arc::new(AtomicUsize::new(0));
    let (i, c) = (installs.clone(), cleanups.clone());
    signal.set_event_installer(Arc::new(move |_set: SignalSetter| {
      i.fetch_add(1, Ordering::SeqCst);
      let c = c.clone();
      Some(Box::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
      }) as Cleanup)
    }));
    // Installed right away, even without subscribers.
    assert_eq!(installs.load(Ordering::SeqCst), 1);

    let a = signal.subscribe(Arc::new(|_: bool| {}));
    let b = signal.subscribe(Arc::new(|_: bool| {}));
    assert_eq!(installs.load(Ordering::SeqCst), 1);

    a.unsubscribe();
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    b.unsubscribe();
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let again = signal.subscribe(Arc::new(|_: bool| {}));
    assert_eq!(installs.load(Ordering::SeqCst), 2);
    again.unsubscribe();
  }

  #[test]
  fn replacing_the_installer_swaps_it_under_subscribers() {
    let signal = Signal::new("test");
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let installer = |name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>| -> EventInstaller {
      let log = log.clone();
      Arc::new(move |_set: SignalSetter| {
        log.lock().push(name);
        let log = log.clone();
        Some(Box::new(move || log.lock().push("cleanup")) as Cleanup)
      })
    };
    let subscription = signal.subscribe(Arc::new(|_: bool| {}));
    signal.set_event_installer(installer("first", &log));
    signal.set_event_installer(installer("second", &log));
    assert_eq!(*log.lock(), vec!["first", "cleanup", "second"]);

    subscription.unsubscribe();
    assert_eq!(*log.lock(), vec!["first", "cleanup", "second", "cleanup"]);
  }

  #[test]
  fn installer_can_drive_the_signal() {
    let signal = Signal::new("test");
    let captured: Arc<Mutex<Option<SignalSetter>>> = Arc::new(Mutex::new(None));
    let slot = captured.clone();
    signal.set_event_installer(Arc::new(move |set: SignalSetter| {
      *slot.lock() = Some(set);
      None
    }));

    let set = captured.lock().clone().unwrap();
    set(Some(false));
    assert!(!signal.current());
  }
}
