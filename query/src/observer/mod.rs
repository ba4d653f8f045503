//! Observers: live views of cache entries that decide when to fetch and
//! push derived results to their listeners.

mod infinite;
mod queries;
mod result;

pub use infinite::{InfiniteQueryObserver, InfiniteQueryObserverResult};
pub use queries::QueriesObserver;
pub use result::QueryObserverResult;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::client::QueryClient;
use crate::error::{Error, Result};
use crate::listener::{Listeners, Subscription};
use crate::query::{
  FetchMeta, FetchOptions, FetchStatus, PlaceholderData, Query, QueryAction, QueryOptions, QueryPromise, QueryState,
  QueryStatus, RefetchInterval, RefetchOn, RefetchPageFn, RefetchPolicy, SelectFn,
};
use crate::query_cache::QueryCacheEvent;
use crate::structural::replace_data;
use crate::task::timeout::Timeout;
use crate::time::{is_valid_timeout, now_millis, time_until_stale};
use crate::value::Value;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Ids shared by query and mutation observers, unique per process.
pub(crate) fn next_observer_id() -> u64 {
  NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Controls what [`QueryObserver::update_result`] tells when the result
/// changed. Unset fields mean "yes".
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyOptions {
  pub listeners: Option<bool>,
  /// Emit `ObserverResultsUpdated` on the query cache.
  pub cache: Option<bool>,
}

/// Options of an explicit refetch.
#[derive(Clone)]
pub struct RefetchOptions {
  /// Cancel a fetch in flight and start over (default) instead of joining it.
  pub cancel_refetch: bool,
  /// Report a failed fetch as `Err` instead of only through the result.
  pub throw_on_error: bool,
  /// For infinite queries: which pages to re-request.
  pub refetch_page: Option<RefetchPageFn>,
  /// For infinite queries: recompute cursors from the refetched pages.
  pub rebuild_page_params: bool,
}

impl Default for RefetchOptions {
  fn default() -> Self {
    Self {
      cancel_refetch: true,
      throw_on_error: false,
      refetch_page: None,
      rebuild_page_params: false,
    }
  }
}

impl RefetchOptions {
  pub fn cancel_refetch(mut self, cancel_refetch: bool) -> Self {
    self.cancel_refetch = cancel_refetch;
    self
  }

  pub fn throw_on_error(mut self, throw_on_error: bool) -> Self {
    self.throw_on_error = throw_on_error;
    self
  }

  pub fn refetch_page<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, usize, &[Value]) -> bool + Send + Sync + 'static,
  {
    self.refetch_page = Some(Arc::new(f));
    self
  }

  pub fn rebuild_page_params(mut self, rebuild: bool) -> Self {
    self.rebuild_page_params = rebuild;
    self
  }

  pub(crate) fn fetch_options(&self) -> FetchOptions {
    FetchOptions {
      cancel_refetch: self.cancel_refetch,
      meta: FetchMeta {
        fetch_more: None,
        refetch_page: self.refetch_page.clone(),
        rebuild_page_params: self.rebuild_page_params,
      },
    }
  }
}

impl fmt::Debug for RefetchOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefetchOptions")
      .field("cancel_refetch", &self.cancel_refetch)
      .field("throw_on_error", &self.throw_on_error)
      .field("refetch_page", &self.refetch_page.is_some())
      .field("rebuild_page_params", &self.rebuild_page_params)
      .finish()
  }
}

type ResultListener = dyn Fn(&QueryObserverResult) + Send + Sync;

// Last select input/output, so an unchanged input is not re-selected.
#[derive(Clone, Default)]
struct SelectMemo {
  select: Option<SelectFn>,
  input: Option<Value>,
  output: Option<Value>,
  error: Option<Error>,
}

#[derive(Clone)]
struct ObserverState {
  options: QueryOptions,
  query: Query,
  query_initial_state: QueryState,
  result: QueryObserverResult,
  previous_query_result: Option<QueryObserverResult>,
  result_placeholder: Option<PlaceholderData>,
  select: SelectMemo,
  refetch_interval: Option<Duration>,
}

#[derive(Clone, Copy, Default)]
struct Delivery {
  listeners: bool,
  cache: bool,
  on_success: bool,
  on_error: bool,
}

pub(crate) struct ObserverInner {
  id: u64,
  client: QueryClient,
  state: Mutex<ObserverState>,
  listeners: Listeners<ResultListener>,
  stale_timeout: Timeout,
  refetch_interval: Timeout,
}

impl Drop for ObserverInner {
  fn drop(&mut self) {
    self.state.get_mut().query.remove_observer(self.id);
  }
}

/// Watches one query and keeps a derived result up to date.
///
/// The observer attaches to its query when it gets its first listener and
/// detaches when the last one leaves (or when the last handle is dropped).
/// While attached it fetches on mount, focus, reconnect and interval as its
/// options say.
#[derive(Clone)]
pub struct QueryObserver {
  pub(crate) inner: Arc<ObserverInner>,
}

impl QueryObserver {
  pub fn new(client: &QueryClient, options: QueryOptions) -> Self {
    let options = client.default_query_options(options);
    let query = client.query_cache().build(client, options.clone(), None);
    let observer = QueryObserver {
      inner: Arc::new(ObserverInner {
        id: next_observer_id(),
        client: client.clone(),
        state: Mutex::new(ObserverState {
          options,
          query_initial_state: query.state(),
          query,
          result: QueryObserverResult::default(),
          previous_query_result: None,
          result_placeholder: None,
          select: SelectMemo::default(),
          refetch_interval: None,
        }),
        listeners: Listeners::new(),
        stale_timeout: Timeout::default(),
        refetch_interval: Timeout::default(),
      }),
    };
    observer.update_result(NotifyOptions::default());
    observer
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn options(&self) -> QueryOptions {
    self.inner.state.lock().options.clone()
  }

  pub fn get_current_result(&self) -> QueryObserverResult {
    self.inner.state.lock().result.clone()
  }

  pub fn get_current_query(&self) -> Query {
    self.inner.state.lock().query.clone()
  }

  pub fn has_listeners(&self) -> bool {
    !self.inner.listeners.is_empty()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&QueryObserverResult) + Send + Sync + 'static,
  {
    let (id, count) = self.inner.listeners.add(Arc::new(listener));
    if count == 1 {
      self.on_subscribe();
    }
    let weak = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(observer) = upgrade(&weak) {
        if observer.inner.listeners.remove(id) == Some(0) {
          observer.destroy();
        }
      }
    })
  }

  fn on_subscribe(&self) {
    let (query, options) = self.current();
    query.add_observer(self);
    if should_fetch_on_mount(&query, &options) {
      drop(self.execute_fetch(FetchOptions::default()));
    }
    self.update_timers();
  }

  /// Drops every listener, stops the timers and detaches from the query.
  pub fn destroy(&self) {
    self.inner.listeners.clear();
    self.inner.stale_timeout.clear();
    self.inner.refetch_interval.clear();
    self.get_current_query().remove_observer(self.inner.id);
  }

  pub fn set_options(&self, options: QueryOptions) {
    self.set_options_with(options, NotifyOptions::default());
  }

  /// Replaces the options. Switches to another query when the key changed
  /// and fetches when the new combination calls for it.
  pub fn set_options_with(&self, options: QueryOptions, notify: NotifyOptions) {
    let (prev_options, prev_query) = {
      let state = self.inner.state.lock();
      (state.options.clone(), state.query.clone())
    };
    let mut options = options;
    if options.query_key.is_none() {
      options.query_key = prev_options.query_key.clone();
    }
    let options = self.inner.client.default_query_options(options);
    self.inner.state.lock().options = options.clone();

    if options_changed(&prev_options, &options) {
      self
        .inner
        .client
        .query_cache()
        .notify(QueryCacheEvent::ObserverOptionsUpdated {
          query: prev_query.clone(),
          observer_id: self.inner.id,
        });
    }

    self.update_query();
    let query = self.get_current_query();
    let mounted = self.has_listeners();

    if mounted && should_fetch_optionally(&query, &prev_query, &options, &prev_options) {
      drop(self.execute_fetch(FetchOptions::default()));
    }

    self.update_result(notify);

    let query_changed = !query.ptr_eq(&prev_query);
    let enabled_changed = options.is_enabled() != prev_options.is_enabled();
    if mounted && (query_changed || enabled_changed || options.get_stale_time() != prev_options.get_stale_time()) {
      self.update_stale_timeout();
    }

    let next_interval = self.compute_refetch_interval();
    let current_interval = self.inner.state.lock().refetch_interval;
    if mounted && (query_changed || enabled_changed || next_interval != current_interval) {
      self.update_refetch_interval(next_interval);
    }
  }

  /// The result these options would produce right now, including a fetch
  /// that mounting would start. Does not change the observer.
  pub fn get_optimistic_result(&self, options: QueryOptions) -> QueryObserverResult {
    let client = &self.inner.client;
    let options = client.default_query_options(options);
    let query = client.query_cache().build(client, options.clone(), None);
    self.create_result(&query, &options, true)
  }

  pub fn refetch(&self, options: RefetchOptions) -> impl Future<Output = Result<QueryObserverResult>> + Send + 'static {
    self.fetch(options.fetch_options(), options.throw_on_error)
  }

  /// Removes the current query from the cache.
  pub fn remove(&self) {
    self.inner.client.query_cache().remove(&self.get_current_query());
  }

  /// Recomputes the result and tells listeners if it changed.
  pub fn update_result(&self, notify: NotifyOptions) {
    self.update_result_with(notify, false, false);
  }

  pub(crate) fn fetch(
    &self,
    fetch_options: FetchOptions,
    throw_on_error: bool,
  ) -> impl Future<Output = Result<QueryObserverResult>> + Send + 'static {
    let promise = self.execute_fetch(fetch_options);
    let observer = self.clone();
    async move {
      let outcome = promise.await;
      observer.update_result(NotifyOptions::default());
      if let Err(error) = outcome {
        let (query, options) = observer.current();
        let throw = throw_on_error
          || options
            .throw_on_error
            .as_ref()
            .is_some_and(|policy| policy.should_throw(&error, &query));
        if throw {
          return Err(error);
        }
      }
      Ok(observer.get_current_result())
    }
  }

  fn execute_fetch(&self, fetch_options: FetchOptions) -> QueryPromise {
    self.update_query();
    let (query, options) = self.current();
    query.fetch(Some(options), fetch_options)
  }

  fn current(&self) -> (Query, QueryOptions) {
    let state = self.inner.state.lock();
    (state.query.clone(), state.options.clone())
  }

  fn update_query(&self) {
    let client = &self.inner.client;
    let options = self.options();
    let query = client.query_cache().build(client, options, None);
    let previous = {
      let mut state = self.inner.state.lock();
      if state.query.ptr_eq(&query) {
        return;
      }
      state.query_initial_state = query.state();
      state.previous_query_result = Some(state.result.clone());
      std::mem::replace(&mut state.query, query.clone())
    };
    if self.has_listeners() {
      previous.remove_observer(self.inner.id);
      query.add_observer(self);
    }
  }

  pub(crate) fn on_query_update(&self, action: &QueryAction) {
    let (on_success, on_error) = match action {
      QueryAction::Success { manual, .. } => (!manual, false),
      QueryAction::Error { error } => (false, !error.is_cancelled()),
      _ => (false, false),
    };
    self.update_result_with(NotifyOptions::default(), on_success, on_error);
    if self.has_listeners() {
      self.update_timers();
    }
  }

  pub(crate) fn should_fetch_on_window_focus(&self) -> bool {
    let (query, options) = self.current();
    should_fetch_on(&query, &options, &options.get_refetch_on_window_focus())
  }

  pub(crate) fn should_fetch_on_reconnect(&self) -> bool {
    let (query, options) = self.current();
    should_fetch_on(&query, &options, &options.get_refetch_on_reconnect())
  }

  fn update_result_with(&self, notify: NotifyOptions, on_success: bool, on_error: bool) {
    let (query, options) = self.current();
    let next = self.create_result(&query, &options, false);
    {
      let mut state = self.inner.state.lock();
      state.result_placeholder = options.placeholder_data.clone();
      if next.shallow_eq(&state.result) {
        return;
      }
      state.result = next.clone();
    }
    let delivery = Delivery {
      listeners: notify.listeners.unwrap_or(true),
      cache: notify.cache.unwrap_or(true),
      on_success,
      on_error,
    };
    self.notify(&query, &options, next, delivery);
  }

  fn notify(&self, query: &Query, options: &QueryOptions, result: QueryObserverResult, delivery: Delivery) {
    let manager = &self.inner.client.ctx().notify;
    let listeners = if delivery.listeners {
      self.inner.listeners.snapshot()
    } else {
      Vec::new()
    };

    manager.batch(|| {
      if delivery.on_success {
        if let (Some(callback), Some(data)) = (options.on_success.clone(), result.data.clone()) {
          manager.schedule(move || callback(&data));
        }
        if let Some(callback) = options.on_settled.clone() {
          let data = result.data.clone();
          manager.schedule(move || callback(data.as_ref(), None));
        }
      } else if delivery.on_error {
        if let (Some(callback), Some(error)) = (options.on_error.clone(), result.error.clone()) {
          manager.schedule(move || callback(&error));
        }
        if let Some(callback) = options.on_settled.clone() {
          let error = result.error.clone();
          manager.schedule(move || callback(None, error.as_ref()));
        }
      }

      for listener in listeners {
        let result = result.clone();
        manager.schedule(move || listener(&result));
      }

      if delivery.cache {
        self
          .inner
          .client
          .query_cache()
          .notify(QueryCacheEvent::ObserverResultsUpdated { query: query.clone() });
      }
    });
  }

  fn create_result(&self, query: &Query, options: &QueryOptions, optimistic: bool) -> QueryObserverResult {
    let snapshot = self.inner.state.lock().clone();
    let mut memo = snapshot.select;
    let prev_result = &snapshot.result;
    let sharing = options.get_structural_sharing();

    let query_changed = !query.ptr_eq(&snapshot.query);
    let initial_state = if query_changed {
      query.state()
    } else {
      snapshot.query_initial_state
    };
    let prev_query_result = if query_changed {
      Some(prev_result.clone())
    } else {
      snapshot.previous_query_result
    };

    let state = query.state();
    let mut status = state.status;
    let mut fetch_status = state.fetch_status;
    let mut data_updated_at = state.data_updated_at;
    let mut error = state.error.clone();
    let mut error_updated_at = state.error_updated_at;
    let mut is_previous_data = false;
    let mut is_placeholder_data = false;
    let mut select_error = None;
    let mut data;

    if optimistic {
      let mounted = self.has_listeners();
      let fetch_on_mount = !mounted && should_fetch_on_mount(query, options);
      let fetch_optionally = mounted && should_fetch_optionally(query, &snapshot.query, options, &snapshot.options);
      if fetch_on_mount || fetch_optionally {
        fetch_status = if self.inner.client.ctx().can_fetch(options.get_network_mode()) {
          FetchStatus::Fetching
        } else {
          FetchStatus::Paused
        };
        if data_updated_at == 0 {
          status = QueryStatus::Pending;
        }
      }
    }

    let previous = prev_query_result.filter(|previous| {
      options.get_keep_previous_data()
        && state.data_updated_at == 0
        && status != QueryStatus::Error
        && previous.is_success()
    });

    if let Some(previous) = previous {
      data = previous.data;
      data_updated_at = previous.data_updated_at;
      status = previous.status;
      is_previous_data = true;
    } else if let (Some(select), Some(raw)) = (options.select.as_ref(), state.data.as_ref()) {
      let memo_hit = memo.select.as_ref().is_some_and(|f| Arc::ptr_eq(f, select))
        && memo.input.as_ref().is_some_and(|input| input.ptr_eq(raw));
      if memo_hit {
        data = memo.output.clone();
        select_error = memo.error.clone();
      } else {
        memo.select = Some(select.clone());
        memo.input = Some(raw.clone());
        match select(raw) {
          Ok(selected) => {
            let selected = replace_data(prev_result.data.as_ref(), selected, sharing);
            memo.output = Some(selected.clone());
            memo.error = None;
            data = Some(selected);
          }
          Err(e) => {
            memo.error = Some(Error::Select(Box::new(e)));
            select_error = memo.error.clone();
            data = None;
          }
        }
      }
    } else {
      data = state.data.clone();
    }

    let placeholder = options
      .placeholder_data
      .as_ref()
      .filter(|_| data.is_none() && status == QueryStatus::Pending);
    if let Some(placeholder) = placeholder {
      let reuse = prev_result.is_placeholder_data
        && snapshot
          .result_placeholder
          .as_ref()
          .is_some_and(|previous| previous.same_as(placeholder));
      let resolved = if reuse {
        prev_result.data.clone()
      } else {
        match (placeholder.resolve(), options.select.as_ref()) {
          (Some(value), Some(select)) => match select(&value) {
            Ok(selected) => Some(selected),
            Err(e) => {
              select_error = Some(Error::Select(Box::new(e)));
              None
            }
          },
          (value, _) => value,
        }
      };
      if let Some(resolved) = resolved {
        status = QueryStatus::Success;
        data = Some(replace_data(prev_result.data.as_ref(), resolved, sharing));
        is_placeholder_data = true;
      }
    }

    if let Some(e) = select_error {
      error = Some(e);
      data = memo.output.clone();
      error_updated_at = now_millis();
      status = QueryStatus::Error;
    }

    let result = QueryObserverResult {
      data,
      data_updated_at,
      error,
      error_updated_at,
      error_update_count: state.error_update_count,
      failure_count: state.failure_count,
      failure_reason: state.failure_reason.clone(),
      status,
      fetch_status,
      is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
      is_fetched_after_mount: state.data_update_count > initial_state.data_update_count
        || state.error_update_count > initial_state.error_update_count,
      is_placeholder_data,
      is_previous_data,
      is_stale: is_stale(query, options),
      raw_data: state.data.clone(),
      fetch_direction: state.fetch_direction,
    };

    self.inner.state.lock().select = memo;
    result
  }

  fn update_timers(&self) {
    self.update_stale_timeout();
    self.update_refetch_interval(self.compute_refetch_interval());
  }

  fn update_stale_timeout(&self) {
    self.inner.stale_timeout.clear();
    let (result, stale_time) = {
      let state = self.inner.state.lock();
      (state.result.clone(), state.options.get_stale_time())
    };
    if result.is_stale || !is_valid_timeout(stale_time) {
      return;
    }
    // One extra millisecond so the data is really stale when we look.
    let delay = time_until_stale(result.data_updated_at, stale_time).saturating_add(Duration::from_millis(1));
    let weak = Arc::downgrade(&self.inner);
    self.inner.stale_timeout.schedule(self.inner.client.ctx(), delay, move || {
      if let Some(observer) = upgrade(&weak) {
        if !observer.get_current_result().is_stale {
          observer.update_result(NotifyOptions::default());
        }
      }
    });
  }

  fn compute_refetch_interval(&self) -> Option<Duration> {
    let (query, options) = self.current();
    let data = self.inner.state.lock().result.data.clone();
    match options.refetch_interval? {
      RefetchInterval::Every(period) => Some(period),
      RefetchInterval::Dynamic(f) => f(data.as_ref(), &query),
    }
  }

  fn update_refetch_interval(&self, next: Option<Duration>) {
    self.inner.refetch_interval.clear();
    let enabled = {
      let mut state = self.inner.state.lock();
      state.refetch_interval = next;
      state.options.is_enabled()
    };
    let Some(period) = next.filter(|period| enabled && !period.is_zero() && is_valid_timeout(*period)) else {
      return;
    };
    let weak = Arc::downgrade(&self.inner);
    self.inner.refetch_interval.repeat(self.inner.client.ctx(), period, move || {
      if let Some(observer) = upgrade(&weak) {
        let in_background = observer.options().get_refetch_interval_in_background();
        if in_background || observer.inner.client.ctx().focus.is_focused() {
          drop(observer.execute_fetch(FetchOptions::default()));
        }
      }
    });
  }
}

impl fmt::Debug for QueryObserver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("QueryObserver")
      .field("id", &self.inner.id)
      .field("query_hash", &state.query.hash())
      .field("status", &state.result.status)
      .field("fetch_status", &state.result.fetch_status)
      .finish_non_exhaustive()
  }
}

fn upgrade(weak: &Weak<ObserverInner>) -> Option<QueryObserver> {
  weak.upgrade().map(|inner| QueryObserver { inner })
}

fn is_stale(query: &Query, options: &QueryOptions) -> bool {
  query.is_stale_by_time(options.get_stale_time())
}

fn should_load_on_mount(query: &Query, options: &QueryOptions) -> bool {
  let state = query.state();
  options.is_enabled()
    && state.data_updated_at == 0
    && !(state.status == QueryStatus::Error && !options.get_retry_on_mount())
}

fn should_fetch_on_mount(query: &Query, options: &QueryOptions) -> bool {
  should_load_on_mount(query, options)
    || (query.state().data_updated_at > 0 && should_fetch_on(query, options, &options.get_refetch_on_mount()))
}

fn should_fetch_on(query: &Query, options: &QueryOptions, policy: &RefetchPolicy) -> bool {
  if !options.is_enabled() {
    return false;
  }
  match policy.resolve(query) {
    RefetchOn::Always => true,
    RefetchOn::IfStale => is_stale(query, options),
    RefetchOn::Never => false,
  }
}

fn should_fetch_optionally(query: &Query, prev_query: &Query, options: &QueryOptions, prev_options: &QueryOptions) -> bool {
  options.is_enabled() && (!query.ptr_eq(prev_query) || !prev_options.is_enabled()) && is_stale(query, options)
}

fn options_changed(prev: &QueryOptions, next: &QueryOptions) -> bool {
  prev.get_query_hash() != next.get_query_hash()
    || prev.is_enabled() != next.is_enabled()
    || prev.stale_time != next.stale_time
    || prev.cache_time != next.cache_time
    || !same_fn(&prev.query_fn, &next.query_fn)
    || !same_fn(&prev.select, &next.select)
}

fn same_fn<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
  match (a, b) {
    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
    (None, None) => true,
    _ => false,
  }
}
