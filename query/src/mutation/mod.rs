//! The write side: one entry per invocation, retried and paused like a fetch.

mod cache;
mod observer;
mod options;
mod state;

pub use cache::{
  MutationCache, MutationCacheConfig, MutationErrorHook, MutationMutateHook, MutationSettledHook,
  MutationSuccessHook, MutationCacheEvent,
};
pub use observer::MutationObserver;
pub use options::{
  MutateOptions, MutationErrorFn, MutationFn, MutationOptions, MutationSettledFn, MutationSuccessFn, OnMutateFn,
};
pub use state::{MutationAction, MutationObserverResult, MutationState, MutationStatus};

pub(crate) use cache::MutationCacheInner;
pub(crate) use observer::MutationObserverInner;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::deferred::{Deferred, DeferredFuture};
use crate::error::{Error, Result};
use crate::key::MutationKey;
use crate::query::{DEFAULT_CACHE_TIME, GC_RECHECK};
use crate::retryer::{Attempt, Retryer, RetryerConfig};
use crate::runtime::RuntimeContext;
use crate::task::timeout::Timeout;
use crate::time::is_valid_timeout;
use crate::value::Value;

pub(crate) struct MutationConfig {
  pub(crate) mutation_id: u64,
  pub(crate) cache: Weak<MutationCacheInner>,
  pub(crate) options: MutationOptions,
  pub(crate) variables: Option<Value>,
  pub(crate) state: Option<MutationState>,
  pub(crate) ctx: RuntimeContext,
}

pub(crate) struct MutationInner {
  mutation_id: u64,
  variables: Value,
  options: RwLock<MutationOptions>,
  state: Mutex<MutationState>,
  // Attach order; the last entry is the observer whose call-site callbacks run.
  observers: Mutex<Vec<(u64, Weak<MutationObserverInner>)>>,
  retryer: Mutex<Option<Retryer<Value>>>,
  outcome: Mutex<Option<Arc<Deferred<Result<Value>>>>>,
  cache_time: Mutex<Duration>,
  gc: Timeout,
  // Set when the gc timer fired while the mutation was still pending.
  gc_elapsed: AtomicBool,
  cache: Weak<MutationCacheInner>,
  ctx: RuntimeContext,
}

/// A handle to one mutation invocation. Cheap to clone.
#[derive(Clone)]
pub struct Mutation {
  pub(crate) inner: Arc<MutationInner>,
}

impl Mutation {
  pub(crate) fn new(config: MutationConfig) -> Self {
    let state = config.state.unwrap_or_default();
    let variables = config
      .variables
      .or_else(|| state.variables.clone())
      .unwrap_or_default();
    let mutation = Mutation {
      inner: Arc::new(MutationInner {
        mutation_id: config.mutation_id,
        variables,
        options: RwLock::new(MutationOptions::default()),
        state: Mutex::new(state),
        observers: Mutex::new(Vec::new()),
        retryer: Mutex::new(None),
        outcome: Mutex::new(None),
        cache_time: Mutex::new(Duration::ZERO),
        gc: Timeout::default(),
        gc_elapsed: AtomicBool::new(false),
        cache: config.cache,
        ctx: config.ctx,
      }),
    };
    mutation.set_options(config.options);
    mutation.schedule_gc();
    mutation
  }

  /// Position in the cache's creation order.
  pub fn mutation_id(&self) -> u64 {
    self.inner.mutation_id
  }

  pub fn key(&self) -> Option<MutationKey> {
    self.inner.options.read().mutation_key.clone()
  }

  pub fn state(&self) -> MutationState {
    self.inner.state.lock().clone()
  }

  pub fn options(&self) -> MutationOptions {
    self.inner.options.read().clone()
  }

  pub fn meta(&self) -> Option<Value> {
    self.inner.options.read().meta.clone()
  }

  pub fn variables(&self) -> &Value {
    &self.inner.variables
  }

  pub fn ptr_eq(&self, other: &Mutation) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub fn set_options(&self, options: MutationOptions) {
    {
      let mut cache_time = self.inner.cache_time.lock();
      *cache_time = (*cache_time).max(options.cache_time.unwrap_or(DEFAULT_CACHE_TIME));
    }
    *self.inner.options.write() = options;
  }

  /// Runs the mutation: the optimistic prelude (`on_mutate` hooks) happens
  /// before this returns, even when offline; the write itself is retried and
  /// paused by connectivity like a query fetch.
  ///
  /// A mutation restored in the pending state skips the prelude and goes
  /// straight to the write.
  pub fn execute(&self) -> DeferredFuture<Result<Value>> {
    let outcome = Deferred::new();
    *self.inner.outcome.lock() = Some(outcome.clone());
    let variables = self.inner.variables.clone();

    let state = self.state();
    let restored = state.is_pending();
    tracing::debug!(mutation_id = self.inner.mutation_id, restored, "executing mutation");
    let prelude = if restored {
      Ok(state.context)
    } else {
      self.prelude(&variables)
    };

    let mutation = self.clone();
    let done = outcome.clone();
    match prelude.and_then(|context| Ok((self.start_retryer(variables.clone())?, context))) {
      Ok((retryer, context)) => {
        let promise = retryer.promise();
        self.inner.ctx.spawn(async move {
          let outcome = promise.await;
          done.settle(mutation.settle(&variables, context.as_ref(), outcome));
        });
      }
      Err(error) => {
        let context = state_context(self);
        self.inner.ctx.spawn(async move {
          done.settle(mutation.settle(&variables, context.as_ref(), Err(error)));
        });
      }
    }
    outcome.wait()
  }

  /// Continues a paused run, or starts one if nothing is running.
  pub fn resume(&self) -> DeferredFuture<Result<Value>> {
    let retryer = self.inner.retryer.lock().clone();
    let outcome = self.inner.outcome.lock().clone();
    match (retryer, outcome) {
      (Some(retryer), Some(outcome)) if !outcome.is_settled() => {
        retryer.resume();
        outcome.wait()
      }
      _ => self.execute(),
    }
  }

  fn prelude(&self, variables: &Value) -> Result<Option<Value>> {
    let options = self.options();
    let can_fetch = self.inner.ctx.can_fetch(options.get_network_mode());
    self.dispatch(MutationAction::Pending {
      variables: Some(variables.clone()),
      context: None,
      is_paused: !can_fetch,
    });
    if let Some(cache) = self.cache() {
      cache.on_mutate(variables, self);
    }
    let context = match &options.on_mutate {
      Some(on_mutate) => on_mutate(variables)?,
      None => None,
    };
    if context.is_some() {
      let is_paused = self.inner.state.lock().is_paused;
      self.dispatch(MutationAction::Pending {
        variables: Some(variables.clone()),
        context: context.clone(),
        is_paused,
      });
    }
    Ok(context)
  }

  fn start_retryer(&self, variables: Value) -> Result<Retryer<Value>> {
    let options = self.options();
    let mutation_fn = options.mutation_fn.clone().ok_or(Error::MissingMutationFn)?;
    let attempt: Attempt<Value> = Arc::new(move || mutation_fn(variables.clone()));

    let weak = Arc::downgrade(&self.inner);
    let config = RetryerConfig::new(attempt)
      .retry(options.get_retry())
      .retry_delay(options.get_retry_delay())
      .network_mode(options.get_network_mode())
      .on_fail({
        let weak = weak.clone();
        move |failure_count, error: &Error| {
          if let Some(mutation) = upgrade(&weak) {
            mutation.dispatch(MutationAction::Failed {
              failure_count,
              error: error.clone(),
            });
          }
        }
      })
      .on_pause({
        let weak = weak.clone();
        move || {
          if let Some(mutation) = upgrade(&weak) {
            mutation.dispatch(MutationAction::Pause);
          }
        }
      })
      .on_continue(move || {
        if let Some(mutation) = upgrade(&weak) {
          mutation.dispatch(MutationAction::Continue);
        }
      });

    let retryer = Retryer::start(config, self.inner.ctx.clone());
    *self.inner.retryer.lock() = Some(retryer.clone());
    Ok(retryer)
  }

  // Cache hooks run before the mutation's own callbacks. A failing callback
  // turns a successful write into an error.
  fn settle(&self, variables: &Value, context: Option<&Value>, outcome: Result<Value>) -> Result<Value> {
    let options = self.options();
    let cache = self.cache();
    let outcome = outcome.and_then(|data| {
      if let Some(cache) = &cache {
        cache.on_success(&data, variables, context, self);
      }
      if let Some(on_success) = &options.on_success {
        on_success(&data, variables, context)?;
      }
      if let Some(cache) = &cache {
        cache.on_settled(Some(&data), None, variables, context, self);
      }
      if let Some(on_settled) = &options.on_settled {
        on_settled(Some(&data), None, variables, context)?;
      }
      Ok(data)
    });

    let outcome = match outcome {
      Ok(data) => {
        self.dispatch(MutationAction::Success { data: data.clone() });
        tracing::debug!(mutation_id = self.inner.mutation_id, "mutation succeeded");
        Ok(data)
      }
      Err(error) => {
        let error = self.run_error_callbacks(&options, cache.as_ref(), error, variables, context);
        self.dispatch(MutationAction::Error { error: error.clone() });
        tracing::debug!(mutation_id = self.inner.mutation_id, %error, "mutation failed");
        Err(error)
      }
    };
    self.collect_if_due();
    outcome
  }

  fn run_error_callbacks(
    &self,
    options: &MutationOptions,
    cache: Option<&MutationCache>,
    error: Error,
    variables: &Value,
    context: Option<&Value>,
  ) -> Error {
    if let Some(cache) = cache {
      cache.on_error(&error, variables, context, self);
    }
    let mut error = error;
    if let Some(on_error) = &options.on_error {
      if let Err(failure) = on_error(&error, variables, context) {
        error = failure;
      }
    }
    if let Some(cache) = cache {
      cache.on_settled(None, Some(&error), variables, context, self);
    }
    if let Some(on_settled) = &options.on_settled {
      if let Err(failure) = on_settled(None, Some(&error), variables, context) {
        error = failure;
      }
    }
    error
  }

  pub(crate) fn add_observer(&self, observer_id: u64, observer: Weak<MutationObserverInner>) {
    let added = {
      let mut observers = self.inner.observers.lock();
      if observers.iter().any(|(id, _)| *id == observer_id) {
        false
      } else {
        observers.push((observer_id, observer));
        true
      }
    };
    if added {
      self.inner.gc.clear();
      self.notify_cache(MutationCacheEvent::ObserverAdded {
        mutation: self.clone(),
        observer_id,
      });
    }
  }

  pub(crate) fn remove_observer(&self, observer_id: u64) {
    let removed = {
      let mut observers = self.inner.observers.lock();
      let before = observers.len();
      observers.retain(|(id, weak)| *id != observer_id && weak.strong_count() > 0);
      observers.len() != before
    };
    if removed {
      self.schedule_gc();
      self.notify_cache(MutationCacheEvent::ObserverRemoved {
        mutation: self.clone(),
        observer_id,
      });
    }
  }

  pub fn observers_count(&self) -> usize {
    let mut observers = self.inner.observers.lock();
    observers.retain(|(_, weak)| weak.strong_count() > 0);
    observers.len()
  }

  pub(crate) fn dispatch(&self, action: MutationAction) {
    {
      let mut state = self.inner.state.lock();
      *state = state::reduce(&state, &action);
    }

    let observers: Vec<MutationObserver> = {
      let observers = self.inner.observers.lock();
      observers
        .iter()
        .filter_map(|(_, weak)| weak.upgrade())
        .map(|inner| MutationObserver { inner })
        .collect()
    };
    self.inner.ctx.notify.batch(|| {
      let last = observers.len().saturating_sub(1);
      for (index, observer) in observers.iter().enumerate() {
        observer.on_mutation_update(self, &action, index == last);
      }
      self.notify_cache(MutationCacheEvent::Updated {
        mutation: self.clone(),
        action,
      });
    });
  }

  fn notify_cache(&self, event: MutationCacheEvent) {
    if let Some(cache) = self.cache() {
      cache.notify(event);
    }
  }

  fn cache(&self) -> Option<MutationCache> {
    self.inner.cache.upgrade().map(MutationCache::from_inner)
  }

  pub(crate) fn destroy(&self) {
    self.inner.gc.clear();
  }

  fn schedule_gc(&self) {
    self.inner.gc_elapsed.store(false, Ordering::SeqCst);
    let cache_time = *self.inner.cache_time.lock();
    if !is_valid_timeout(cache_time) {
      self.inner.gc.clear();
      return;
    }
    let weak = Arc::downgrade(&self.inner);
    self.inner.gc.schedule(&self.inner.ctx, cache_time.max(GC_RECHECK), move || {
      if let Some(mutation) = upgrade(&weak) {
        mutation.optional_remove();
      }
    });
  }

  // The cache time counts from the last time the mutation became unused, not
  // from settling. A timer still running keeps going; one that already ran out
  // during the run only waits for the recheck delay.
  fn collect_if_due(&self) {
    if !self.inner.gc_elapsed.load(Ordering::SeqCst) || self.observers_count() > 0 {
      return;
    }
    let weak = Arc::downgrade(&self.inner);
    self.inner.gc.schedule(&self.inner.ctx, GC_RECHECK, move || {
      if let Some(mutation) = upgrade(&weak) {
        mutation.optional_remove();
      }
    });
  }

  fn optional_remove(&self) {
    if self.observers_count() > 0 {
      return;
    }
    if self.state().is_pending() {
      self.inner.gc_elapsed.store(true, Ordering::SeqCst);
      return;
    }
    if let Some(cache) = self.cache() {
      tracing::trace!(mutation_id = self.inner.mutation_id, "collecting settled mutation");
      cache.remove(self);
    }
  }
}

fn upgrade(weak: &Weak<MutationInner>) -> Option<Mutation> {
  weak.upgrade().map(|inner| Mutation { inner })
}

fn state_context(mutation: &Mutation) -> Option<Value> {
  mutation.inner.state.lock().context.clone()
}

impl fmt::Debug for Mutation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("Mutation")
      .field("mutation_id", &self.inner.mutation_id)
      .field("status", &state.status)
      .field("is_paused", &state.is_paused)
      .finish_non_exhaustive()
  }
}
