//! Runs an async operation with retries, pausing while the environment says
//! work should not happen (unfocused, or offline for network-bound modes).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::deferred::{Deferred, DeferredFuture};
use crate::error::{CancelOptions, Error, Result};
use crate::runtime::RuntimeContext;

/// One invocation of the wrapped operation. Called again for every retry.
pub(crate) type Attempt<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// How often a failed operation is retried.
#[derive(Clone)]
pub enum Retry {
  Disabled,
  /// Retry up to this many times after the first failure.
  Count(u32),
  Forever,
  /// Decide from the number of failures so far and the latest error.
  Custom(Arc<dyn Fn(u32, &Error) -> bool + Send + Sync>),
}

impl Retry {
  pub fn custom<F>(f: F) -> Self
  where
    F: Fn(u32, &Error) -> bool + Send + Sync + 'static,
  {
    Retry::Custom(Arc::new(f))
  }

  pub(crate) fn should_retry(&self, failure_count: u32, error: &Error) -> bool {
    match self {
      Retry::Disabled => false,
      Retry::Count(max) => failure_count < *max,
      Retry::Forever => true,
      Retry::Custom(f) => f(failure_count, error),
    }
  }
}

impl From<bool> for Retry {
  fn from(retry: bool) -> Self {
    if retry {
      Retry::Forever
    } else {
      Retry::Disabled
    }
  }
}

impl From<u32> for Retry {
  fn from(count: u32) -> Self {
    Retry::Count(count)
  }
}

impl fmt::Debug for Retry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Retry::Disabled => f.write_str("Disabled"),
      Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
      Retry::Forever => f.write_str("Forever"),
      Retry::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

/// How long to wait before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
  /// `min(1000ms * 2^failures, 30s)`.
  #[default]
  Exponential,
  Fixed(Duration),
  Custom(Arc<dyn Fn(u32, &Error) -> Duration + Send + Sync>),
}

impl RetryDelay {
  pub fn custom<F>(f: F) -> Self
  where
    F: Fn(u32, &Error) -> Duration + Send + Sync + 'static,
  {
    RetryDelay::Custom(Arc::new(f))
  }

  pub(crate) fn delay(&self, failure_count: u32, error: &Error) -> Duration {
    match self {
      RetryDelay::Exponential => default_retry_delay(failure_count),
      RetryDelay::Fixed(delay) => *delay,
      RetryDelay::Custom(f) => f(failure_count, error),
    }
  }
}

impl fmt::Debug for RetryDelay {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RetryDelay::Exponential => f.write_str("Exponential"),
      RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
      RetryDelay::Custom(_) => f.write_str("Custom(..)"),
    }
  }
}

pub fn default_retry_delay(failure_count: u32) -> Duration {
  let millis = 1000u64.saturating_mul(1u64 << failure_count.min(16));
  Duration::from_millis(millis.min(30_000))
}

/// When an operation is allowed to run relative to connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
  /// Only run while online; pause otherwise.
  #[default]
  Online,
  /// Ignore connectivity.
  Always,
  /// Try once regardless, pause retries while offline.
  OfflineFirst,
}

type Hook = Option<Box<dyn Fn() + Send + Sync>>;

pub(crate) struct RetryerConfig<T> {
  attempt: Attempt<T>,
  retry: Retry,
  retry_delay: RetryDelay,
  network_mode: NetworkMode,
  abort: Hook,
  on_success: Option<Box<dyn Fn(&T) + Send + Sync>>,
  on_error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
  on_fail: Option<Box<dyn Fn(u32, &Error) + Send + Sync>>,
  on_pause: Hook,
  on_continue: Hook,
}

impl<T> RetryerConfig<T> {
  pub(crate) fn new(attempt: Attempt<T>) -> Self {
    Self {
      attempt,
      retry: Retry::Disabled,
      retry_delay: RetryDelay::Exponential,
      network_mode: NetworkMode::Online,
      abort: None,
      on_success: None,
      on_error: None,
      on_fail: None,
      on_pause: None,
      on_continue: None,
    }
  }

  pub(crate) fn retry(mut self, retry: Retry) -> Self {
    self.retry = retry;
    self
  }

  pub(crate) fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
    self.retry_delay = retry_delay;
    self
  }

  pub(crate) fn network_mode(mut self, network_mode: NetworkMode) -> Self {
    self.network_mode = network_mode;
    self
  }

  pub(crate) fn abort(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.abort = Some(Box::new(f));
    self
  }

  pub(crate) fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Box::new(f));
    self
  }

  pub(crate) fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Box::new(f));
    self
  }

  pub(crate) fn on_fail(mut self, f: impl Fn(u32, &Error) + Send + Sync + 'static) -> Self {
    self.on_fail = Some(Box::new(f));
    self
  }

  pub(crate) fn on_pause(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_pause = Some(Box::new(f));
    self
  }

  pub(crate) fn on_continue(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_continue = Some(Box::new(f));
    self
  }
}

struct Shared<T> {
  config: RetryerConfig<T>,
  ctx: RuntimeContext,
  outcome: Arc<Deferred<Result<T>>>,
  settled: AtomicBool,
  failure_count: AtomicU32,
  retry_cancelled: AtomicBool,
  wake: Notify,
  token: CancellationToken,
}

/// A running operation. Cheap to clone; every clone drives the same run.
pub(crate) struct Retryer<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for Retryer<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Retryer<T> {
  /// Starts the operation on the context's spawner.
  pub(crate) fn start(config: RetryerConfig<T>, ctx: RuntimeContext) -> Self {
    let retryer = Self::new(config, ctx);
    retryer.spawn();
    retryer
  }

  /// A run that does nothing until [`spawn`](Self::spawn) is called. It can
  /// already be awaited and cancelled.
  pub(crate) fn new(config: RetryerConfig<T>, ctx: RuntimeContext) -> Self {
    Self {
      shared: Arc::new(Shared {
        config,
        ctx,
        outcome: Deferred::new(),
        settled: AtomicBool::new(false),
        failure_count: AtomicU32::new(0),
        retry_cancelled: AtomicBool::new(false),
        wake: Notify::new(),
        token: CancellationToken::new(),
      }),
    }
  }

  /// Begins the run. A run cancelled before this point never calls the
  /// operation.
  pub(crate) fn spawn(&self) {
    if !self.shared.is_settled() {
      self.shared.ctx.spawn(self.shared.clone().run());
    }
  }

  /// The shared outcome of the run.
  pub(crate) fn promise(&self) -> DeferredFuture<Result<T>> {
    self.shared.outcome.wait()
  }

  /// Settles the run as cancelled. An in-flight attempt is abandoned and its
  /// result discarded.
  pub(crate) fn cancel(&self, options: CancelOptions) {
    if self.shared.reject(Error::Cancelled(options)) {
      self.shared.token.cancel();
      if let Some(abort) = &self.shared.config.abort {
        abort();
      }
    }
  }

  /// Lets the current attempt finish but schedules no further retries.
  pub(crate) fn cancel_retry(&self) {
    self.shared.retry_cancelled.store(true, Ordering::SeqCst);
  }

  pub(crate) fn continue_retry(&self) {
    self.shared.retry_cancelled.store(false, Ordering::SeqCst);
  }

  /// Wakes a paused run if the environment allows it. Returns whether the run
  /// can make progress.
  pub(crate) fn resume(&self) -> bool {
    let can_continue = self.shared.is_settled() || !self.shared.ctx.should_pause(self.shared.config.network_mode);
    if can_continue {
      self.shared.wake.notify_waiters();
    }
    can_continue
  }

  pub(crate) fn is_settled(&self) -> bool {
    self.shared.is_settled()
  }
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
  async fn run(self: Arc<Self>) {
    if self.is_settled() {
      return;
    }
    if !self.ctx.can_fetch(self.config.network_mode) {
      self.pause().await;
    }

    loop {
      if self.is_settled() {
        return;
      }

      let attempt = (self.config.attempt)();
      let outcome = tokio::select! {
        biased;
        _ = self.token.cancelled() => return,
        outcome = attempt => outcome,
      };

      let error = match outcome {
        Ok(value) => {
          self.resolve(value);
          return;
        }
        Err(error) => error,
      };
      if self.is_settled() {
        return;
      }

      let failure_count = self.failure_count.load(Ordering::SeqCst);
      if self.retry_cancelled.load(Ordering::SeqCst) || !self.config.retry.should_retry(failure_count, &error) {
        self.reject(error);
        return;
      }

      let delay = self.config.retry_delay.delay(failure_count, &error);
      let failure_count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
      if let Some(on_fail) = &self.config.on_fail {
        on_fail(failure_count, &error);
      }
      tracing::debug!(failure_count, delay_ms = delay.as_millis() as u64, %error, "attempt failed, retrying");

      tokio::select! {
        biased;
        _ = self.token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
      }

      if self.ctx.should_pause(self.config.network_mode) {
        self.pause().await;
      }
      if self.retry_cancelled.load(Ordering::SeqCst) {
        self.reject(error);
        return;
      }
    }
  }

  async fn pause(&self) {
    if let Some(on_pause) = &self.config.on_pause {
      on_pause();
    }
    tracing::debug!(network_mode = ?self.config.network_mode, "operation paused");

    loop {
      let mut notified = std::pin::pin!(self.wake.notified());
      notified.as_mut().enable();
      if self.is_settled() || !self.ctx.should_pause(self.config.network_mode) {
        break;
      }
      notified.await;
    }

    if !self.is_settled() {
      if let Some(on_continue) = &self.config.on_continue {
        on_continue();
      }
    }
  }

  fn is_settled(&self) -> bool {
    self.settled.load(Ordering::SeqCst)
  }

  fn claim(&self) -> bool {
    self
      .settled
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  fn resolve(&self, value: T) -> bool {
    if !self.claim() {
      return false;
    }
    if let Some(on_success) = &self.config.on_success {
      on_success(&value);
    }
    self.wake.notify_waiters();
    self.outcome.settle(Ok(value));
    true
  }

  fn reject(&self, error: Error) -> bool {
    if !self.claim() {
      return false;
    }
    if let Some(on_error) = &self.config.on_error {
      on_error(&error);
    }
    self.wake.notify_waiters();
    self.outcome.settle(Err(error));
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::{FocusManager, OnlineManager};
  use crate::notify::NotifyManager;
  use crate::runtime::TokioSpawner;
  use std::sync::atomic::AtomicUsize;

  fn ctx() -> RuntimeContext {
    RuntimeContext {
      spawner: Arc::new(TokioSpawner::new()),
      notify: NotifyManager::new(),
      focus: FocusManager::new(),
      online: OnlineManager::new(),
    }
  }

  fn failing(calls: Arc<AtomicUsize>) -> Attempt<u32> {
    Arc::new(move || {
      calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async { Err(Error::msg("nope")) })
    })
  }

  #[test]
  fn exponential_delay_is_capped() {
    assert_eq!(default_retry_delay(0), Duration::from_millis(1000));
    assert_eq!(default_retry_delay(2), Duration::from_millis(4000));
    assert_eq!(default_retry_delay(10), Duration::from_millis(30_000));
  }

  #[tokio::test(start_paused = true)]
  async fn retries_until_count_is_exhausted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let f = failures.clone();
    let config = RetryerConfig::new(failing(calls.clone()))
      .retry(Retry::Count(3))
      .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)))
      .on_fail(move |count, _| f.lock().push(count));

    let retryer = Retryer::start(config, ctx());
    let outcome = retryer.promise().await;

    assert_eq!(outcome.unwrap_err().to_string(), "nope");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(*failures.lock(), vec![1, 2, 3]);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_settles_once_and_aborts() {
    let aborted = Arc::new(AtomicBool::new(false));
    let a = aborted.clone();
    let attempt: Attempt<u32> = Arc::new(|| {
      Box::pin(async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(1)
      })
    });
    let config = RetryerConfig::new(attempt).abort(move || a.store(true, Ordering::SeqCst));
    let retryer = Retryer::start(config, ctx());
    tokio::task::yield_now().await;

    retryer.cancel(CancelOptions::SILENT);
    retryer.cancel(CancelOptions::default());
    let outcome = retryer.promise().await;

    assert_eq!(outcome.unwrap_err().cancel_options(), Some(CancelOptions::SILENT));
    assert!(aborted.load(Ordering::SeqCst));
  }

  #[tokio::test(start_paused = true)]
  async fn pauses_while_offline_and_resumes() {
    let ctx = ctx();
    ctx.online.set_online(Some(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let attempt: Attempt<u32> = Arc::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
      Box::pin(async { Ok(7) })
    });

    let retryer = Retryer::start(RetryerConfig::new(attempt), ctx.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!retryer.resume());

    ctx.online.set_online(Some(true));
    assert!(retryer.resume());
    assert_eq!(retryer.promise().await.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn always_mode_ignores_connectivity() {
    let ctx = ctx();
    ctx.online.set_online(Some(false));
    let attempt: Attempt<u32> = Arc::new(|| Box::pin(async { Ok(3) }));
    let config = RetryerConfig::new(attempt).network_mode(NetworkMode::Always);
    let retryer = Retryer::start(config, ctx);
    assert_eq!(retryer.promise().await.unwrap(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn cancel_retry_stops_after_current_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = RetryerConfig::new(failing(calls.clone()))
      .retry(Retry::Forever)
      .retry_delay(RetryDelay::Fixed(Duration::from_millis(10)));
    let retryer = Retryer::start(config, ctx());
    tokio::time::sleep(Duration::from_millis(15)).await;
    retryer.cancel_retry();

    assert!(retryer.promise().await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn run_cancelled_before_spawn_never_calls_the_operation() {
    let ctx = ctx();
    ctx.online.set_online(Some(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let paused = Arc::new(AtomicBool::new(false));
    let p = paused.clone();
    let config = RetryerConfig::new(failing(calls.clone())).on_pause(move || p.store(true, Ordering::SeqCst));

    let retryer = Retryer::new(config, ctx);
    retryer.cancel(CancelOptions::SILENT);
    retryer.spawn();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(retryer.promise().await.unwrap_err().is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!paused.load(Ordering::SeqCst));
  }
}
