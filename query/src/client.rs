//! The facade tying the query cache, the mutation cache and the connectivity
//! signals together.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures_util::future::{join_all, ready, Either};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};

use crate::builder::QueryClientBuilder;
use crate::connectivity::{FocusManager, OnlineManager};
use crate::deferred::DeferredFuture;
use crate::error::{CancelOptions, Result};
use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
use crate::infinite::InfiniteQueryBehavior;
use crate::key::{partial_match_key, MutationKey, QueryKey};
use crate::listener::Subscription;
use crate::mutation::{MutationCache, MutationOptions};
use crate::notify::NotifyManager;
use crate::observer::RefetchOptions;
use crate::query::{FetchOptions, FetchStatus, QueryOptions, QueryState, SetDataOptions};
use crate::query_cache::QueryCache;
use crate::retryer::Retry;
use crate::runtime::RuntimeContext;
use crate::value::Value;

/// Client-wide option defaults, the lowest layer below per-key defaults.
#[derive(Debug, Clone, Default)]
pub struct DefaultOptions {
  pub queries: QueryOptions,
  pub mutations: MutationOptions,
}

/// A new value for [`QueryClient::set_query_data`]: either the value itself
/// or a function of the current data. `None` leaves the cache untouched.
pub enum Updater {
  Value(Option<Value>),
  Fn(Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send>),
}

impl Updater {
  pub fn from_fn<F>(f: F) -> Self
  where
    F: FnOnce(Option<&Value>) -> Option<Value> + Send + 'static,
  {
    Updater::Fn(Box::new(f))
  }

  fn apply(self, current: Option<&Value>) -> Option<Value> {
    match self {
      Updater::Value(value) => value,
      Updater::Fn(f) => f(current),
    }
  }
}

impl From<Value> for Updater {
  fn from(value: Value) -> Self {
    Updater::Value(Some(value))
  }
}

impl From<Option<Value>> for Updater {
  fn from(value: Option<Value>) -> Self {
    Updater::Value(value)
  }
}

impl fmt::Debug for Updater {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Updater::Value(value) => f.debug_tuple("Value").field(value).finish(),
      Updater::Fn(_) => f.write_str("Fn(..)"),
    }
  }
}

/// Which queries an invalidation refetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchType {
  Active,
  Inactive,
  All,
  /// Only mark as invalid.
  None,
}

#[derive(Debug, Clone, Default)]
pub struct InvalidateOptions {
  /// Defaults to the filters' query type, then to `Active`.
  pub refetch_type: Option<RefetchType>,
  pub refetch: RefetchOptions,
}

impl InvalidateOptions {
  pub fn refetch_type(mut self, refetch_type: RefetchType) -> Self {
    self.refetch_type = Some(refetch_type);
    self
  }

  pub fn refetch(mut self, refetch: RefetchOptions) -> Self {
    self.refetch = refetch;
    self
  }
}

#[derive(Default)]
struct Mount {
  count: usize,
  subscriptions: Vec<Subscription>,
}

pub(crate) struct ClientInner {
  query_cache: QueryCache,
  mutation_cache: MutationCache,
  default_options: RwLock<DefaultOptions>,
  // Registration order matters for equally specific prefixes.
  query_defaults: RwLock<Vec<(QueryKey, QueryOptions)>>,
  mutation_defaults: RwLock<Vec<(MutationKey, MutationOptions)>>,
  mount: Mutex<Mount>,
  ctx: RuntimeContext,
}

/// The entry point: owns the caches and answers every data request.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct QueryClient {
  pub(crate) inner: Arc<ClientInner>,
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryClient {
  /// A client with default options and its own connectivity signals.
  pub fn new() -> Self {
    QueryClientBuilder::default().build()
  }

  pub fn builder() -> QueryClientBuilder {
    QueryClientBuilder::default()
  }

  pub(crate) fn from_parts(
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    default_options: DefaultOptions,
    ctx: RuntimeContext,
  ) -> Self {
    Self {
      inner: Arc::new(ClientInner {
        query_cache,
        mutation_cache,
        default_options: RwLock::new(default_options),
        query_defaults: RwLock::new(Vec::new()),
        mutation_defaults: RwLock::new(Vec::new()),
        mount: Mutex::new(Mount::default()),
        ctx,
      }),
    }
  }

  pub(crate) fn ctx(&self) -> &RuntimeContext {
    &self.inner.ctx
  }

  pub fn query_cache(&self) -> QueryCache {
    self.inner.query_cache.clone()
  }

  pub fn mutation_cache(&self) -> MutationCache {
    self.inner.mutation_cache.clone()
  }

  pub fn focus_manager(&self) -> &FocusManager {
    &self.inner.ctx.focus
  }

  pub fn online_manager(&self) -> &OnlineManager {
    &self.inner.ctx.online
  }

  pub fn notify_manager(&self) -> &NotifyManager {
    &self.inner.ctx.notify
  }

  /// Starts following focus and connectivity: regaining either resumes paused
  /// mutations and lets queries refetch. Calls nest; the last `unmount`
  /// detaches.
  pub fn mount(&self) {
    let mut mount = self.inner.mount.lock();
    mount.count += 1;
    if mount.count > 1 {
      return;
    }
    let weak = Arc::downgrade(&self.inner);
    let focus = self.inner.ctx.focus.subscribe({
      let weak = weak.clone();
      move |focused| {
        if let Some(client) = upgrade(&weak).filter(|_| focused) {
          drop(client.resume_paused_mutations());
          client.inner.query_cache.on_focus();
        }
      }
    });
    let online = self.inner.ctx.online.subscribe(move |online| {
      if let Some(client) = upgrade(&weak).filter(|_| online) {
        drop(client.resume_paused_mutations());
        client.inner.query_cache.on_online();
      }
    });
    mount.subscriptions = vec![focus, online];
    tracing::debug!("query client mounted");
  }

  pub fn unmount(&self) {
    let subscriptions = {
      let mut mount = self.inner.mount.lock();
      mount.count = mount.count.saturating_sub(1);
      if mount.count > 0 {
        return;
      }
      std::mem::take(&mut mount.subscriptions)
    };
    for subscription in subscriptions {
      subscription.unsubscribe();
    }
  }

  /// Number of queries matching `filters` that are fetching right now.
  pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
    let filters = filters.clone().fetch_status(FetchStatus::Fetching);
    self.inner.query_cache.find_all(&filters).len()
  }

  /// Number of mutations matching `filters` that are pending right now.
  pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
    let filters = filters.clone().fetching(true);
    self.inner.mutation_cache.find_all(&filters).len()
  }

  pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Value> {
    self
      .inner
      .query_cache
      .find(&QueryFilters::key(key))
      .and_then(|query| query.state().data)
  }

  pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
    self
      .inner
      .query_cache
      .find(&QueryFilters::key(key))
      .map(|query| query.state())
  }

  pub fn get_queries_data(&self, filters: &QueryFilters) -> Vec<(QueryKey, Option<Value>)> {
    self
      .inner
      .query_cache
      .find_all(filters)
      .into_iter()
      .map(|query| (query.key().clone(), query.state().data))
      .collect()
  }

  /// Writes data for `key`, creating the query if needed. Returns the stored
  /// value, or `None` (and changes nothing) when the updater yields `None`.
  pub fn set_query_data(&self, key: impl Into<QueryKey>, updater: impl Into<Updater>) -> Option<Value> {
    self.set_query_data_with(key, updater, SetDataOptions::default())
  }

  pub fn set_query_data_with(
    &self,
    key: impl Into<QueryKey>,
    updater: impl Into<Updater>,
    options: SetDataOptions,
  ) -> Option<Value> {
    let key = key.into();
    let current = self.get_query_data(key.clone());
    let data = updater.into().apply(current.as_ref())?;
    let query_options = self.default_query_options(QueryOptions::new(key));
    let query = self.inner.query_cache.build(self, query_options, None);
    Some(query.set_data(data, SetDataOptions { manual: true, ..options }))
  }

  /// Applies `updater` to every query matching `filters`.
  pub fn set_queries_data<F>(&self, filters: &QueryFilters, updater: F) -> Vec<(QueryKey, Option<Value>)>
  where
    F: Fn(Option<&Value>) -> Option<Value>,
  {
    self.inner.ctx.notify.batch(|| {
      self
        .inner
        .query_cache
        .find_all(filters)
        .into_iter()
        .map(|query| {
          let current = query.state().data;
          let stored = updater(current.as_ref()).map(|data| {
            query.set_data(
              data,
              SetDataOptions {
                manual: true,
                ..SetDataOptions::default()
              },
            )
          });
          (query.key().clone(), stored)
        })
        .collect()
    })
  }

  /// Fetches unless fresh data is cached, and returns the data. Not retried
  /// unless the options (or defaults) say so.
  pub fn fetch_query(&self, options: QueryOptions) -> impl Future<Output = Result<Value>> + Send + 'static {
    let mut options = self.default_query_options(options);
    if options.retry.is_none() {
      options.retry = Some(Retry::Disabled);
    }
    let query = self.inner.query_cache.build(self, options.clone(), None);
    let fresh = if query.is_stale_by_time(options.get_stale_time()) {
      None
    } else {
      query.state().data
    };
    match fresh {
      Some(data) => Either::Right(ready(Ok(data))),
      None => Either::Left(query.fetch(Some(options), FetchOptions::default())),
    }
  }

  /// Like [`fetch_query`](Self::fetch_query), but only warms the cache;
  /// failures stay in the query state.
  pub fn prefetch_query(&self, options: QueryOptions) -> impl Future<Output = ()> + Send + 'static {
    self.fetch_query(options).map(|_| ())
  }

  /// Cached data if there is any, stale or not; a fetch otherwise.
  pub fn ensure_query_data(&self, options: QueryOptions) -> impl Future<Output = Result<Value>> + Send + 'static {
    let options = self.default_query_options(options);
    let cached = self
      .inner
      .query_cache
      .get(&options.get_query_hash())
      .and_then(|query| query.state().data);
    match cached {
      Some(data) => Either::Left(ready(Ok(data))),
      None => Either::Right(self.fetch_query(options)),
    }
  }

  pub fn fetch_infinite_query(&self, options: QueryOptions) -> impl Future<Output = Result<Value>> + Send + 'static {
    self.fetch_query(options.behavior(Arc::new(InfiniteQueryBehavior)))
  }

  pub fn prefetch_infinite_query(&self, options: QueryOptions) -> impl Future<Output = ()> + Send + 'static {
    self.fetch_infinite_query(options).map(|_| ())
  }

  pub fn remove_queries(&self, filters: &QueryFilters) {
    let cache = &self.inner.query_cache;
    self.inner.ctx.notify.batch(|| {
      for query in cache.find_all(filters) {
        cache.remove(&query);
      }
    });
  }

  /// Puts matching queries back to their initial state, then refetches the
  /// active ones.
  pub fn reset_queries(
    &self,
    filters: &QueryFilters,
    options: RefetchOptions,
  ) -> impl Future<Output = Result<()>> + Send + 'static {
    self.inner.ctx.notify.batch(|| {
      for query in self.inner.query_cache.find_all(filters) {
        query.reset();
      }
      let refetch = filters.clone().query_type_if_unset(QueryTypeFilter::Active);
      self.refetch_queries(&refetch, options)
    })
  }

  /// Cancels the fetches of matching queries; resolves once they settled.
  pub fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) -> impl Future<Output = ()> + Send + 'static {
    let cancels: Vec<_> = self.inner.ctx.notify.batch(|| {
      self
        .inner
        .query_cache
        .find_all(filters)
        .iter()
        .map(|query| query.cancel(options))
        .collect()
    });
    join_all(cancels).map(|_| ())
  }

  /// Marks matching queries stale and refetches them per
  /// [`InvalidateOptions::refetch_type`].
  pub fn invalidate_queries(
    &self,
    filters: &QueryFilters,
    options: InvalidateOptions,
  ) -> impl Future<Output = Result<()>> + Send + 'static {
    self.inner.ctx.notify.batch(|| {
      for query in self.inner.query_cache.find_all(filters) {
        query.invalidate();
      }
      let refetch_type = options.refetch_type.unwrap_or(match filters.query_type {
        Some(QueryTypeFilter::All) => RefetchType::All,
        Some(QueryTypeFilter::Inactive) => RefetchType::Inactive,
        Some(QueryTypeFilter::Active) | None => RefetchType::Active,
      });
      let query_type = match refetch_type {
        RefetchType::None => return Either::Left(ready(Ok(()))),
        RefetchType::Active => QueryTypeFilter::Active,
        RefetchType::Inactive => QueryTypeFilter::Inactive,
        RefetchType::All => QueryTypeFilter::All,
      };
      let filters = filters.clone().query_type(query_type);
      Either::Right(self.refetch_queries(&filters, options.refetch))
    })
  }

  /// Refetches every matching, non-disabled query. Paused fetches do not
  /// hold up the returned future. Failures only surface with
  /// `throw_on_error`.
  pub fn refetch_queries(
    &self,
    filters: &QueryFilters,
    options: RefetchOptions,
  ) -> impl Future<Output = Result<()>> + Send + 'static {
    let fetch_options = options.fetch_options();
    let promises: Vec<_> = self.inner.ctx.notify.batch(|| {
      self
        .inner
        .query_cache
        .find_all(filters)
        .into_iter()
        .filter(|query| !query.is_disabled())
        .filter_map(|query| {
          let promise = query.fetch(None, fetch_options.clone());
          (query.state().fetch_status != FetchStatus::Paused).then_some(promise)
        })
        .collect()
    });
    let throw_on_error = options.throw_on_error;
    async move {
      let outcomes = join_all(promises).await;
      if throw_on_error {
        for outcome in outcomes {
          outcome?;
        }
      }
      Ok(())
    }
  }

  /// Runs a mutation that no observer follows.
  pub fn execute_mutation(&self, options: MutationOptions, variables: impl Into<Value>) -> DeferredFuture<Result<Value>> {
    self
      .inner
      .mutation_cache
      .build(self, options, Some(variables.into()), None)
      .execute()
  }

  pub fn resume_paused_mutations(&self) -> DeferredFuture<()> {
    self.inner.mutation_cache.resume_paused_mutations()
  }

  pub fn get_default_options(&self) -> DefaultOptions {
    self.inner.default_options.read().clone()
  }

  pub fn set_default_options(&self, options: DefaultOptions) {
    *self.inner.default_options.write() = options;
  }

  /// Registers defaults for every query whose key starts with `key`.
  /// Registering the same key again replaces its defaults.
  pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryOptions) {
    let key = key.into();
    let mut defaults = self.inner.query_defaults.write();
    match defaults.iter_mut().find(|(existing, _)| existing.hash() == key.hash()) {
      Some(entry) => entry.1 = options,
      None => defaults.push((key, options)),
    }
  }

  /// The defaults registered for the longest prefix of `key`.
  pub fn get_query_defaults(&self, key: &QueryKey) -> Option<QueryOptions> {
    let defaults = self.inner.query_defaults.read();
    most_specific(defaults.as_slice(), key).cloned()
  }

  pub fn set_mutation_defaults(&self, key: impl Into<MutationKey>, options: MutationOptions) {
    let key = key.into();
    let mut defaults = self.inner.mutation_defaults.write();
    match defaults.iter_mut().find(|(existing, _)| existing.hash() == key.hash()) {
      Some(entry) => entry.1 = options,
      None => defaults.push((key, options)),
    }
  }

  pub fn get_mutation_defaults(&self, key: &MutationKey) -> Option<MutationOptions> {
    let defaults = self.inner.mutation_defaults.read();
    most_specific(defaults.as_slice(), key).cloned()
  }

  /// Layers `options` over the key's defaults and the client-wide ones.
  pub fn default_query_options(&self, options: QueryOptions) -> QueryOptions {
    let options = match options.query_key.as_ref().and_then(|key| self.get_query_defaults(key)) {
      Some(defaults) => options.with_defaults(&defaults),
      None => options,
    };
    options.with_defaults(&self.inner.default_options.read().queries)
  }

  pub fn default_mutation_options(&self, options: MutationOptions) -> MutationOptions {
    let options = match options.mutation_key.as_ref().and_then(|key| self.get_mutation_defaults(key)) {
      Some(defaults) => options.with_defaults(&defaults),
      None => options,
    };
    options.with_defaults(&self.inner.default_options.read().mutations)
  }

  /// Empties both caches.
  pub fn clear(&self) {
    self.inner.query_cache.clear();
    self.inner.mutation_cache.clear();
  }
}

// Longest matching prefix wins; among equally long ones the first
// registered, with a warning since the choice depends on registration order.
fn most_specific<'a, T>(defaults: &'a [(QueryKey, T)], key: &QueryKey) -> Option<&'a T> {
  let mut best: Option<&(QueryKey, T)> = None;
  let mut tied = false;
  for entry in defaults.iter().filter(|(prefix, _)| partial_match_key(key, prefix)) {
    match best {
      Some((current, _)) if entry.0.len() < current.len() => {}
      Some((current, _)) if entry.0.len() == current.len() => tied = true,
      _ => {
        best = Some(entry);
        tied = false;
      }
    }
  }
  if tied {
    tracing::warn!(key = %key, "several equally specific defaults match this key; using the first registered");
  }
  best.map(|(_, options)| options)
}

fn upgrade(weak: &Weak<ClientInner>) -> Option<QueryClient> {
  weak.upgrade().map(|inner| QueryClient { inner })
}

impl fmt::Debug for QueryClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClient")
      .field("query_cache", &self.inner.query_cache)
      .field("mutation_cache", &self.inner.mutation_cache)
      .field("ctx", &self.inner.ctx)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn longest_prefix_wins() {
    let defaults = vec![
      (QueryKey::from(["todos"]), 1),
      (QueryKey::from(["todos", "list"]), 2),
      (QueryKey::from(["users"]), 3),
    ];
    assert_eq!(most_specific(&defaults, &QueryKey::from(["todos", "list", "7"])), Some(&2));
    assert_eq!(most_specific(&defaults, &QueryKey::from(["todos", "detail"])), Some(&1));
    assert_eq!(most_specific(&defaults, &QueryKey::from(["posts"])), None);
  }

  #[test]
  fn equally_specific_prefixes_use_registration_order() {
    let defaults = vec![
      (QueryKey::new(vec![serde_json::json!({ "a": 1 })]), "first"),
      (QueryKey::new(vec![serde_json::json!({ "b": 2 })]), "second"),
    ];
    let key = QueryKey::new(vec![serde_json::json!({ "a": 1, "b": 2 })]);
    assert_eq!(most_specific(&defaults, &key), Some(&"first"));
  }

  #[test]
  fn updater_none_is_a_no_op() {
    assert_eq!(Updater::from(None::<Value>).apply(Some(&Value::from(1))), None);
    let doubled = Updater::from_fn(|current| current.and_then(Value::as_i64).map(|n| Value::from(n * 2)));
    assert_eq!(doubled.apply(Some(&Value::from(2))), Some(Value::from(4)));
  }
}
