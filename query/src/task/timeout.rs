use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::runtime::RuntimeContext;

/// A resettable timer slot. Scheduling replaces whatever was pending; the
/// replaced task wakes up on its cancellation token and exits.
#[derive(Default)]
pub(crate) struct Timeout {
  token: Mutex<Option<CancellationToken>>,
}

impl Timeout {
  /// Runs `f` once after `delay`.
  pub(crate) fn schedule<F>(&self, ctx: &RuntimeContext, delay: Duration, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let token = self.rearm();
    ctx.spawn(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => f(),
      }
    });
  }

  /// Runs `f` every `period` until cleared or rescheduled.
  pub(crate) fn repeat<F>(&self, ctx: &RuntimeContext, period: Duration, f: F)
  where
    F: Fn() + Send + 'static,
  {
    let token = self.rearm();
    ctx.spawn(async move {
      let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      loop {
        tokio::select! {
          biased;
          _ = token.cancelled() => return,
          _ = ticker.tick() => f(),
        }
      }
    });
  }

  pub(crate) fn clear(&self) {
    if let Some(token) = self.token.lock().take() {
      token.cancel();
    }
  }

  fn rearm(&self) -> CancellationToken {
    let token = CancellationToken::new();
    if let Some(previous) = self.token.lock().replace(token.clone()) {
      previous.cancel();
    }
    token
  }
}

impl Drop for Timeout {
  fn drop(&mut self) {
    self.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::{FocusManager, OnlineManager};
  use crate::notify::NotifyManager;
  use crate::runtime::TokioSpawner;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn ctx() -> RuntimeContext {
    RuntimeContext {
      spawner: Arc::new(TokioSpawner::new()),
      notify: NotifyManager::new(),
      focus: FocusManager::new(),
      online: OnlineManager::new(),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn rescheduling_replaces_pending_timer() {
    let ctx = ctx();
    let timeout = Timeout::default();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    timeout.schedule(&ctx, Duration::from_millis(10), move || {
      f.fetch_add(1, Ordering::SeqCst);
    });
    let f = fired.clone();
    timeout.schedule(&ctx, Duration::from_millis(30), move || {
      f.fetch_add(10, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 10);
  }

  #[tokio::test(start_paused = true)]
  async fn repeat_runs_until_cleared() {
    let ctx = ctx();
    let timeout = Timeout::default();
    let ticks = Arc::new(AtomicUsize::new(0));

    let t = ticks.clone();
    timeout.repeat(&ctx, Duration::from_millis(10), move || {
      t.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(35)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    timeout.clear();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
  }
}
