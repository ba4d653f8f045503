//! A single cached query: its state machine, its fetch and its lifetime.

mod options;
mod state;

pub use options::{
  DataCallback, ErrorCallback, FetchMeta, FetchMore, FetchOptions, InitialData, PageParamFn, PlaceholderData,
  QueryFn, QueryFunctionContext, QueryOptions, RefetchInterval, RefetchOn, RefetchPageFn, RefetchPolicy, SelectFn,
  SettledCallback, ThrowOnError, DEFAULT_CACHE_TIME, DEFAULT_QUERY_RETRY,
};
pub use state::{FetchDirection, FetchStatus, QueryAction, QueryState, QueryStatus};

pub(crate) use options::{default_attempt, AbortSignal, FetchContext, QueryBehavior};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::deferred::DeferredFuture;
use crate::error::{CancelOptions, Error, Result};
use crate::key::QueryKey;
use crate::observer::{ObserverInner, QueryObserver, RefetchOptions};
use crate::query_cache::{QueryCache, QueryCacheEvent, QueryCacheInner};
use crate::retryer::{Retryer, RetryerConfig};
use crate::runtime::RuntimeContext;
use crate::structural::replace_data;
use crate::task::timeout::Timeout;
use crate::time::{is_valid_timeout, now_millis, time_until_stale};
use crate::value::Value;

/// The shared outcome of a query fetch.
pub type QueryPromise = DeferredFuture<Result<Value>>;

/// Minimum delay before a busy entry is looked at again by the collector.
pub(crate) const GC_RECHECK: Duration = Duration::from_millis(1);

/// Options for [`Query::set_data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetDataOptions {
  /// Overrides the update timestamp (ms since the Unix epoch).
  pub updated_at: Option<u64>,
  /// Marks the update as written by application code rather than a fetch.
  pub manual: bool,
}

pub(crate) struct QueryConfig {
  pub(crate) cache: Weak<QueryCacheInner>,
  pub(crate) options: QueryOptions,
  pub(crate) default_options: Option<QueryOptions>,
  pub(crate) state: Option<QueryState>,
  pub(crate) ctx: RuntimeContext,
}

static NEXT_FETCH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct ActiveFetch {
  id: u64,
  retryer: Retryer<Value>,
  signal: AbortSignal,
}

pub(crate) struct QueryInner {
  query_key: QueryKey,
  query_hash: String,
  default_options: Option<QueryOptions>,
  options: RwLock<QueryOptions>,
  initial_state: QueryState,
  state: Mutex<QueryState>,
  revert_state: Mutex<Option<QueryState>>,
  observers: Mutex<Vec<(u64, Weak<ObserverInner>)>>,
  active_fetch: Mutex<Option<ActiveFetch>>,
  cache_time: Mutex<Duration>,
  gc: Timeout,
  cache: Weak<QueryCacheInner>,
  pub(crate) ctx: RuntimeContext,
}

/// A handle to one cache entry. Cheap to clone; clones address the same
/// entry.
#[derive(Clone)]
pub struct Query {
  pub(crate) inner: Arc<QueryInner>,
}

impl Query {
  pub(crate) fn new(config: QueryConfig) -> Self {
    let options = match &config.default_options {
      Some(defaults) => config.options.with_defaults(defaults),
      None => config.options,
    };
    let initial_state = config.state.unwrap_or_else(|| default_state(&options));

    let query = Query {
      inner: Arc::new(QueryInner {
        query_key: options.query_key.clone().unwrap_or_default(),
        query_hash: options.get_query_hash(),
        default_options: config.default_options,
        options: RwLock::new(QueryOptions::default()),
        state: Mutex::new(initial_state.clone()),
        initial_state,
        revert_state: Mutex::new(None),
        observers: Mutex::new(Vec::new()),
        active_fetch: Mutex::new(None),
        cache_time: Mutex::new(Duration::ZERO),
        gc: Timeout::default(),
        cache: config.cache,
        ctx: config.ctx,
      }),
    };
    query.update_cache_time(options.cache_time);
    *query.inner.options.write() = options;
    query.schedule_gc();
    query
  }

  pub fn key(&self) -> &QueryKey {
    &self.inner.query_key
  }

  pub fn hash(&self) -> &str {
    &self.inner.query_hash
  }

  pub fn state(&self) -> QueryState {
    self.inner.state.lock().clone()
  }

  pub fn options(&self) -> QueryOptions {
    self.inner.options.read().clone()
  }

  pub fn meta(&self) -> Option<Value> {
    self.inner.options.read().meta.clone()
  }

  pub fn ptr_eq(&self, other: &Query) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Replaces the options, layered over this query's per-key defaults.
  pub fn set_options(&self, options: QueryOptions) {
    let options = match &self.inner.default_options {
      Some(defaults) => options.with_defaults(defaults),
      None => options,
    };
    self.update_cache_time(options.cache_time);
    *self.inner.options.write() = options;
  }

  /// Writes data as a successful update. Returns the stored value, which is
  /// the previous one when structural sharing found nothing changed.
  pub fn set_data(&self, data: Value, options: SetDataOptions) -> Value {
    let previous = self.inner.state.lock().data.clone();
    let sharing = self.inner.options.read().get_structural_sharing();
    let data = replace_data(previous.as_ref(), data, sharing);
    self.dispatch(QueryAction::Success {
      data: data.clone(),
      data_updated_at: options.updated_at,
      manual: options.manual,
    });
    data
  }

  pub fn set_state(&self, state: QueryState) {
    self.dispatch(QueryAction::SetState { state });
  }

  /// Cancels the running fetch, if any. Resolves once it has settled.
  pub fn cancel(&self, options: CancelOptions) -> impl Future<Output = ()> + Send + 'static {
    let active = self.inner.active_fetch.lock().clone();
    let promise = active.as_ref().map(|active| active.retryer.promise());
    if let Some(active) = active {
      active.retryer.cancel(options);
    }
    async move {
      if let Some(promise) = promise {
        let _ = promise.await;
      }
    }
  }

  /// Stops timers and silently cancels any running fetch.
  pub(crate) fn destroy(&self) {
    self.inner.gc.clear();
    let _ = self.cancel(CancelOptions::SILENT);
  }

  /// Back to the state the query was created with.
  pub fn reset(&self) {
    self.destroy();
    self.set_state(self.inner.initial_state.clone());
    if self.observers_count() == 0 {
      self.schedule_gc();
    }
  }

  /// True when at least one observer is enabled.
  pub fn is_active(&self) -> bool {
    self.observers().iter().any(|observer| observer.options().is_enabled())
  }

  /// True when observed, but only by disabled observers.
  pub fn is_disabled(&self) -> bool {
    self.observers_count() > 0 && !self.is_active()
  }

  pub fn is_stale(&self) -> bool {
    let (invalidated, updated_at) = {
      let state = self.inner.state.lock();
      (state.is_invalidated, state.data_updated_at)
    };
    invalidated
      || updated_at == 0
      || self
        .observers()
        .iter()
        .any(|observer| observer.get_current_result().is_stale)
  }

  pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
    let state = self.inner.state.lock();
    state.is_invalidated
      || state.data_updated_at == 0
      || time_until_stale(state.data_updated_at, stale_time).is_zero()
  }

  pub fn invalidate(&self) {
    if !self.inner.state.lock().is_invalidated {
      self.dispatch(QueryAction::Invalidate);
    }
  }

  /// Wakes a paused fetch if the environment allows it.
  pub fn resume_fetch(&self) -> bool {
    let active = self.inner.active_fetch.lock().clone();
    active.is_some_and(|active| active.retryer.resume())
  }

  pub(crate) fn on_focus(&self) {
    let observer = self
      .observers()
      .into_iter()
      .find(QueryObserver::should_fetch_on_window_focus);
    if let Some(observer) = observer {
      drop(observer.refetch(RefetchOptions::default().cancel_refetch(false)));
    }
    self.resume_fetch();
  }

  pub(crate) fn on_online(&self) {
    let observer = self
      .observers()
      .into_iter()
      .find(QueryObserver::should_fetch_on_reconnect);
    if let Some(observer) = observer {
      drop(observer.refetch(RefetchOptions::default().cancel_refetch(false)));
    }
    self.resume_fetch();
  }

  /// Live observers, oldest first.
  pub fn observers(&self) -> Vec<QueryObserver> {
    let mut observers = self.inner.observers.lock();
    observers.retain(|(_, weak)| weak.strong_count() > 0);
    observers
      .iter()
      .filter_map(|(_, weak)| weak.upgrade())
      .map(|inner| QueryObserver { inner })
      .collect()
  }

  pub fn observers_count(&self) -> usize {
    let mut observers = self.inner.observers.lock();
    observers.retain(|(_, weak)| weak.strong_count() > 0);
    observers.len()
  }

  pub(crate) fn add_observer(&self, observer: &QueryObserver) {
    let id = observer.id();
    let added = {
      let mut observers = self.inner.observers.lock();
      if observers.iter().any(|(existing, _)| *existing == id) {
        false
      } else {
        observers.push((id, Arc::downgrade(&observer.inner)));
        true
      }
    };
    if added {
      self.inner.gc.clear();
      self.notify_cache(QueryCacheEvent::ObserverAdded {
        query: self.clone(),
        observer_id: id,
      });
    }
  }

  pub(crate) fn remove_observer(&self, observer_id: u64) {
    let (removed, empty) = {
      let mut observers = self.inner.observers.lock();
      let before = observers.len();
      observers.retain(|(id, weak)| *id != observer_id && weak.strong_count() > 0);
      (observers.len() != before, observers.is_empty())
    };
    if !removed {
      return;
    }

    if empty {
      let active = self.inner.active_fetch.lock().clone();
      if let Some(active) = active {
        // A query function that took the signal can be aborted outright.
        if active.signal.is_consumed() {
          active.retryer.cancel(CancelOptions {
            revert: true,
            silent: false,
          });
        } else {
          active.retryer.cancel_retry();
        }
      }
      self.schedule_gc();
    }

    self.notify_cache(QueryCacheEvent::ObserverRemoved {
      query: self.clone(),
      observer_id,
    });
  }

  /// Starts a fetch, or joins the one already running.
  ///
  /// The work starts before this returns; dropping the returned future does
  /// not cancel it.
  pub fn fetch(&self, options: Option<QueryOptions>, fetch_options: FetchOptions) -> QueryPromise {
    while let Some(active) = self.running_fetch() {
      if self.inner.state.lock().data_updated_at != 0 && fetch_options.cancel_refetch {
        active.retryer.cancel(CancelOptions::SILENT);
      } else {
        active.retryer.continue_retry();
        return active.retryer.promise();
      }
    }

    if let Some(options) = options {
      self.set_options(options);
    }
    if self.inner.options.read().query_fn.is_none() {
      let donor = self
        .observers()
        .into_iter()
        .map(|observer| observer.options())
        .find(|options| options.query_fn.is_some());
      if let Some(options) = donor {
        self.set_options(options);
      }
    }

    let options = self.options();
    let state = self.state();
    let signal = AbortSignal::default();
    let context = FetchContext {
      query_key: self.inner.query_key.clone(),
      query_hash: self.inner.query_hash.clone(),
      options: options.clone(),
      state: state.clone(),
      fetch_options: fetch_options.clone(),
      signal: signal.clone(),
    };
    let attempt = match &options.behavior {
      Some(behavior) => behavior.attempt(context),
      None => default_attempt(context),
    };

    let fetch_id = NEXT_FETCH_ID.fetch_add(1, Ordering::Relaxed);
    let weak = Arc::downgrade(&self.inner);
    let config = RetryerConfig::new(attempt)
      .retry(options.get_retry())
      .retry_delay(options.get_retry_delay())
      .network_mode(options.get_network_mode())
      .abort({
        let signal = signal.clone();
        move || signal.cancel()
      })
      .on_success({
        let weak = weak.clone();
        move |data: &Value| {
          if let Some(query) = upgrade(&weak) {
            query.on_fetch_success(fetch_id, data.clone());
          }
        }
      })
      .on_error({
        let weak = weak.clone();
        move |error: &Error| {
          if let Some(query) = upgrade(&weak) {
            query.on_fetch_error(fetch_id, error);
          }
        }
      })
      .on_fail({
        let weak = weak.clone();
        move |failure_count, error: &Error| {
          if let Some(query) = upgrade(&weak) {
            query.dispatch(QueryAction::Failed {
              failure_count,
              error: error.clone(),
            });
          }
        }
      })
      .on_pause({
        let weak = weak.clone();
        move || {
          if let Some(query) = upgrade(&weak) {
            query.dispatch(QueryAction::Pause);
          }
        }
      })
      .on_continue(move || {
        if let Some(query) = upgrade(&weak) {
          query.dispatch(QueryAction::Continue);
        }
      });

    // The run is recorded before anyone hears about it, so a fetch issued
    // from a listener finds it. A run recorded by another thread meanwhile
    // wins and this one is never spawned.
    let retryer = Retryer::new(config, self.inner.ctx.clone());
    {
      let mut active = self.inner.active_fetch.lock();
      if let Some(current) = active.as_ref().filter(|current| !current.retryer.is_settled()) {
        current.retryer.continue_retry();
        return current.retryer.promise();
      }
      *active = Some(ActiveFetch {
        id: fetch_id,
        retryer: retryer.clone(),
        signal,
      });
    }

    *self.inner.revert_state.lock() = Some(state.clone());
    let direction = fetch_options.direction();
    if state.fetch_status == FetchStatus::Idle || state.fetch_direction != direction {
      let can_fetch = self.inner.ctx.can_fetch(options.get_network_mode());
      self.dispatch(QueryAction::Fetch { direction, can_fetch });
    }

    tracing::debug!(query_hash = %self.hash(), "fetching query");
    retryer.spawn();
    retryer.promise()
  }

  fn running_fetch(&self) -> Option<ActiveFetch> {
    let active = self.inner.active_fetch.lock();
    active.as_ref().filter(|active| !active.retryer.is_settled()).cloned()
  }

  fn clear_active_fetch(&self, fetch_id: u64) {
    let mut active = self.inner.active_fetch.lock();
    if active.as_ref().is_some_and(|active| active.id == fetch_id) {
      *active = None;
    }
  }

  fn on_fetch_success(&self, fetch_id: u64, data: Value) {
    self.clear_active_fetch(fetch_id);
    let data = self.set_data(data, SetDataOptions::default());
    if let Some(cache) = self.cache() {
      cache.on_query_success(&data, self);
    }
    self.schedule_gc();
  }

  fn on_fetch_error(&self, fetch_id: u64, error: &Error) {
    self.clear_active_fetch(fetch_id);
    let silent = error.cancel_options().is_some_and(|options| options.silent);
    if !silent {
      self.dispatch(QueryAction::Error { error: error.clone() });
    }
    if !error.is_cancelled() {
      if let Some(cache) = self.cache() {
        cache.on_query_error(error, self);
      }
      tracing::error!(query_hash = %self.hash(), %error, "query failed");
    }
    self.schedule_gc();
  }

  /// Applies a state transition and tells observers and the cache.
  pub(crate) fn dispatch(&self, action: QueryAction) {
    {
      let revert = self.inner.revert_state.lock().clone();
      let mut current = self.inner.state.lock();
      *current = state::reduce(&current, &action, revert.as_ref());
    }

    let observers = self.observers();
    self.inner.ctx.notify.batch(|| {
      for observer in &observers {
        observer.on_query_update(&action);
      }
      self.notify_cache(QueryCacheEvent::Updated {
        query: self.clone(),
        action,
      });
    });
  }

  fn notify_cache(&self, event: QueryCacheEvent) {
    if let Some(cache) = self.cache() {
      cache.notify(event);
    }
  }

  fn cache(&self) -> Option<QueryCache> {
    self.inner.cache.upgrade().map(QueryCache::from_inner)
  }

  pub(crate) fn update_cache_time(&self, cache_time: Option<Duration>) {
    let mut current = self.inner.cache_time.lock();
    *current = (*current).max(cache_time.unwrap_or(DEFAULT_CACHE_TIME));
  }

  pub(crate) fn schedule_gc(&self) {
    let cache_time = *self.inner.cache_time.lock();
    self.schedule_gc_after(cache_time);
  }

  fn schedule_gc_after(&self, delay: Duration) {
    if !is_valid_timeout(delay) {
      self.inner.gc.clear();
      return;
    }
    let weak = Arc::downgrade(&self.inner);
    self.inner.gc.schedule(&self.inner.ctx, delay, move || {
      if let Some(query) = upgrade(&weak) {
        query.optional_remove();
      }
    });
  }

  fn optional_remove(&self) {
    if self.observers_count() > 0 {
      return;
    }
    if self.state().fetch_status != FetchStatus::Idle {
      let cache_time = *self.inner.cache_time.lock();
      self.schedule_gc_after(cache_time.max(GC_RECHECK));
      return;
    }
    if let Some(cache) = self.cache() {
      tracing::trace!(query_hash = %self.hash(), "collecting unused query");
      cache.remove(self);
    }
  }
}

fn upgrade(weak: &Weak<QueryInner>) -> Option<Query> {
  weak.upgrade().map(|inner| Query { inner })
}

fn default_state(options: &QueryOptions) -> QueryState {
  match options.initial_data.as_ref().and_then(InitialData::resolve) {
    Some(data) => QueryState {
      data: Some(data),
      data_updated_at: options.initial_data_updated_at.unwrap_or_else(now_millis),
      status: QueryStatus::Success,
      ..QueryState::default()
    },
    None => QueryState::default(),
  }
}

impl fmt::Debug for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("Query")
      .field("query_hash", &self.inner.query_hash)
      .field("status", &state.status)
      .field("fetch_status", &state.fetch_status)
      .finish_non_exhaustive()
  }
}
