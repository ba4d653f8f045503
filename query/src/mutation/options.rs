use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::{Error, Result};
use crate::key::MutationKey;
use crate::query::DEFAULT_CACHE_TIME;
use crate::retryer::{NetworkMode, Retry, RetryDelay};
use crate::value::Value;

/// Performs the write, given the variables.
pub type MutationFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Runs before the write; its result becomes the mutation's context.
pub type OnMutateFn = Arc<dyn Fn(&Value) -> Result<Option<Value>> + Send + Sync>;

/// `(data, variables, context)`.
pub type MutationSuccessFn = Arc<dyn Fn(&Value, &Value, Option<&Value>) -> Result<()> + Send + Sync>;

/// `(error, variables, context)`.
pub type MutationErrorFn = Arc<dyn Fn(&Error, &Value, Option<&Value>) -> Result<()> + Send + Sync>;

/// `(data, error, variables, context)`.
pub type MutationSettledFn =
  Arc<dyn Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>) -> Result<()> + Send + Sync>;

/// Configuration of a mutation.
///
/// The callbacks here belong to the mutation itself: they always run, before
/// any per-call callback, and a failing callback fails the mutation.
#[derive(Clone, Default)]
pub struct MutationOptions {
  pub(crate) mutation_key: Option<MutationKey>,
  pub(crate) mutation_fn: Option<MutationFn>,
  pub(crate) cache_time: Option<Duration>,
  pub(crate) retry: Option<Retry>,
  pub(crate) retry_delay: Option<RetryDelay>,
  pub(crate) network_mode: Option<NetworkMode>,
  pub(crate) meta: Option<Value>,
  pub(crate) on_mutate: Option<OnMutateFn>,
  pub(crate) on_success: Option<MutationSuccessFn>,
  pub(crate) on_error: Option<MutationErrorFn>,
  pub(crate) on_settled: Option<MutationSettledFn>,
}

impl MutationOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_defaults(mut self, defaults: &MutationOptions) -> Self {
    macro_rules! fill {
      ($($field:ident),*) => {
        $(
          if self.$field.is_none() {
            self.$field = defaults.$field.clone();
          }
        )*
      };
    }
    fill!(
      mutation_key,
      mutation_fn,
      cache_time,
      retry,
      retry_delay,
      network_mode,
      meta,
      on_mutate,
      on_success,
      on_error,
      on_settled
    );
    self
  }

  pub fn mutation_key(mut self, key: impl Into<MutationKey>) -> Self {
    self.mutation_key = Some(key.into());
    self
  }

  pub fn mutation_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
  {
    self.mutation_fn = Some(Arc::new(move |variables: Value| f(variables).boxed()));
    self
  }

  pub fn cache_time(mut self, cache_time: Duration) -> Self {
    self.cache_time = Some(cache_time);
    self
  }

  pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
    self.retry = Some(retry.into());
    self
  }

  pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
    self.retry_delay = Some(retry_delay);
    self
  }

  pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
    self.network_mode = Some(network_mode);
    self
  }

  pub fn meta(mut self, meta: impl Into<Value>) -> Self {
    self.meta = Some(meta.into());
    self
  }

  pub fn on_mutate(mut self, f: impl Fn(&Value) -> Result<Option<Value>> + Send + Sync + 'static) -> Self {
    self.on_mutate = Some(Arc::new(f));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&Value, &Value, Option<&Value>) -> Result<()> + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&Error, &Value, Option<&Value>) -> Result<()> + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>) -> Result<()> + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }

  pub fn get_mutation_key(&self) -> Option<&MutationKey> {
    self.mutation_key.as_ref()
  }

  pub fn get_cache_time(&self) -> Duration {
    self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
  }

  pub fn get_network_mode(&self) -> NetworkMode {
    self.network_mode.unwrap_or_default()
  }

  /// Mutations are not retried unless asked to.
  pub(crate) fn get_retry(&self) -> Retry {
    self.retry.clone().unwrap_or(Retry::Disabled)
  }

  pub(crate) fn get_retry_delay(&self) -> RetryDelay {
    self.retry_delay.clone().unwrap_or_default()
  }
}

impl fmt::Debug for MutationOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationOptions")
      .field("mutation_key", &self.mutation_key)
      .field("mutation_fn", &self.mutation_fn.is_some())
      .field("cache_time", &self.cache_time)
      .field("retry", &self.retry)
      .field("network_mode", &self.network_mode)
      .finish_non_exhaustive()
  }
}

type CallSuccess = Arc<dyn Fn(&Value, &Value, Option<&Value>) + Send + Sync>;
type CallError = Arc<dyn Fn(&Error, &Value, Option<&Value>) + Send + Sync>;
type CallSettled = Arc<dyn Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>) + Send + Sync>;

/// Callbacks for one `mutate` call. They run after the mutation's own
/// callbacks, and only for the observer that last started the mutation.
#[derive(Clone, Default)]
pub struct MutateOptions {
  pub(crate) on_success: Option<CallSuccess>,
  pub(crate) on_error: Option<CallError>,
  pub(crate) on_settled: Option<CallSettled>,
}

impl MutateOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_success(mut self, f: impl Fn(&Value, &Value, Option<&Value>) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&Error, &Value, Option<&Value>) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }
}

impl fmt::Debug for MutateOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutateOptions")
      .field("on_success", &self.on_success.is_some())
      .field("on_error", &self.on_error.is_some())
      .field("on_settled", &self.on_settled.is_some())
      .finish()
  }
}
