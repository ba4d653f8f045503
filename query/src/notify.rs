//! Batched, deferred delivery of change notifications.
//!
//! Everything a cache hands to application code (observer listeners, cache
//! event listeners, per-call callbacks) goes through a [`NotifyManager`].
//! Inside a [`NotifyManager::batch`] scope callbacks are queued; they are
//! delivered together, in scheduling order, once the outermost batch closes.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::runtime::{TaskSpawner, TokioSpawner};

/// A queued notification.
pub type NotifyCallback = Box<dyn FnOnce() + Send>;

/// Wraps the delivery of one notification, e.g. to run it inside a UI
/// framework's update scope.
pub type NotifyFunction = Arc<dyn Fn(NotifyCallback) + Send + Sync>;

/// Wraps the delivery of a whole flush.
pub type BatchNotifyFunction = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Where a flush runs once it has been scheduled.
#[derive(Clone, Default)]
pub enum NotifyScheduler {
  /// Run on the calling thread as soon as the outermost batch closes.
  #[default]
  Immediate,
  /// Run on a freshly spawned task.
  Spawn,
  /// Run on a spawned task after a delay.
  Delay(Duration),
  /// Run on the next "frame", a fixed 16ms delay.
  AnimationFrame,
  /// Hand the flush to application code.
  Custom(Arc<dyn Fn(NotifyCallback) + Send + Sync>),
}

impl fmt::Debug for NotifyScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NotifyScheduler::Immediate => f.write_str("Immediate"),
      NotifyScheduler::Spawn => f.write_str("Spawn"),
      NotifyScheduler::Delay(d) => f.debug_tuple("Delay").field(d).finish(),
      NotifyScheduler::AnimationFrame => f.write_str("AnimationFrame"),
      NotifyScheduler::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

const FRAME: Duration = Duration::from_millis(16);

struct Queue {
  transactions: usize,
  pending: Vec<NotifyCallback>,
}

struct NotifyShared {
  queue: Mutex<Queue>,
  scheduler: RwLock<NotifyScheduler>,
  notify_fn: RwLock<NotifyFunction>,
  batch_notify_fn: RwLock<BatchNotifyFunction>,
  spawner: Arc<dyn TaskSpawner>,
}

/// The notification scheduler. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct NotifyManager {
  shared: Arc<NotifyShared>,
}

impl Default for NotifyManager {
  fn default() -> Self {
    Self::new()
  }
}

impl NotifyManager {
  pub fn new() -> Self {
    Self::with_spawner(Arc::new(TokioSpawner::new()))
  }

  /// Creates a manager whose `Spawn` and `Delay` schedulers use `spawner`.
  pub fn with_spawner(spawner: Arc<dyn TaskSpawner>) -> Self {
    Self {
      shared: Arc::new(NotifyShared {
        queue: Mutex::new(Queue {
          transactions: 0,
          pending: Vec::new(),
        }),
        scheduler: RwLock::new(NotifyScheduler::Immediate),
        notify_fn: RwLock::new(Arc::new(|callback: NotifyCallback| callback())),
        batch_notify_fn: RwLock::new(Arc::new(|flush: &mut dyn FnMut()| flush())),
        spawner,
      }),
    }
  }

  /// Runs `f` as one batch. Notifications scheduled inside are delivered
  /// together after the outermost batch finishes.
  pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
    self.shared.queue.lock().transactions += 1;
    let guard = TransactionGuard { manager: self };
    let result = f();
    drop(guard);
    result
  }

  /// Queues `callback` when inside a batch, otherwise delivers it through
  /// the scheduler right away.
  pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
    {
      let mut queue = self.shared.queue.lock();
      if queue.transactions > 0 {
        queue.pending.push(Box::new(callback));
        return;
      }
    }
    let manager = self.clone();
    self.run(Box::new(move || manager.deliver(vec![Box::new(callback)])));
  }

  /// Wraps `f` so that every call is scheduled instead of run inline.
  pub fn batch_calls<T, F>(&self, f: F) -> impl Fn(T) + Send + Sync + 'static
  where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
  {
    let manager = self.clone();
    let f = Arc::new(f);
    move |arg: T| {
      let f = f.clone();
      manager.schedule(move || f(arg));
    }
  }

  pub fn set_scheduler(&self, scheduler: NotifyScheduler) {
    *self.shared.scheduler.write() = scheduler;
  }

  pub fn set_notify_function(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
    *self.shared.notify_fn.write() = Arc::new(f);
  }

  pub fn set_batch_notify_function(&self, f: impl Fn(&mut dyn FnMut()) + Send + Sync + 'static) {
    *self.shared.batch_notify_fn.write() = Arc::new(f);
  }

  fn flush(&self) {
    let pending = {
      let mut queue = self.shared.queue.lock();
      if queue.transactions > 0 || queue.pending.is_empty() {
        return;
      }
      std::mem::take(&mut queue.pending)
    };
    let manager = self.clone();
    self.run(Box::new(move || manager.deliver(pending)));
  }

  fn run(&self, flush: NotifyCallback) {
    let scheduler = self.shared.scheduler.read().clone();
    match scheduler {
      NotifyScheduler::Immediate => flush(),
      NotifyScheduler::Spawn => self.shared.spawner.spawn(Box::pin(async move { flush() })),
      NotifyScheduler::Delay(delay) => self.delayed(delay, flush),
      NotifyScheduler::AnimationFrame => self.delayed(FRAME, flush),
      NotifyScheduler::Custom(scheduler) => scheduler(flush),
    }
  }

  fn delayed(&self, delay: Duration, flush: NotifyCallback) {
    self.shared.spawner.spawn(Box::pin(async move {
      tokio::time::sleep(delay).await;
      flush();
    }));
  }

  /// Delivers `pending` in order. A panicking callback does not stop the
  /// rest; the first panic is resumed once the flush completes.
  fn deliver(&self, pending: Vec<NotifyCallback>) {
    let notify_fn = self.shared.notify_fn.read().clone();
    let batch_notify_fn = self.shared.batch_notify_fn.read().clone();
    let mut first_panic: Option<Box<dyn Any + Send>> = None;

    // Callbacks that schedule more work land in this batch's queue and are
    // flushed right after it.
    self.batch(|| {
      let mut pending = Some(pending);
      batch_notify_fn(&mut || {
        for callback in pending.take().into_iter().flatten() {
          let notify_fn = notify_fn.clone();
          if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || notify_fn(callback))) {
            tracing::error!("notification callback panicked");
            first_panic.get_or_insert(payload);
          }
        }
      });
    });

    if let Some(payload) = first_panic {
      panic::resume_unwind(payload);
    }
  }
}

impl fmt::Debug for NotifyManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let queue = self.shared.queue.lock();
    f.debug_struct("NotifyManager")
      .field("transactions", &queue.transactions)
      .field("pending", &queue.pending.len())
      .field("scheduler", &*self.shared.scheduler.read())
      .finish()
  }
}

struct TransactionGuard<'a> {
  manager: &'a NotifyManager,
}

impl Drop for TransactionGuard<'_> {
  fn drop(&mut self) {
    let closed = {
      let mut queue = self.manager.shared.queue.lock();
      queue.transactions -= 1;
      queue.transactions == 0
    };
    // Never deliver while unwinding out of a failed batch; the queue is
    // picked up by the next flush.
    if closed && !std::thread::panicking() {
      self.manager.flush();
    }
  }
}
