//! The registry of queries, keyed by hash.

use std::fmt;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::RwLock;

use crate::client::QueryClient;
use crate::error::Error;
use crate::filters::QueryFilters;
use crate::listener::{Listeners, Subscription};
use crate::query::{Query, QueryAction, QueryConfig, QueryOptions, QueryState};
use crate::runtime::RuntimeContext;
use crate::value::Value;

pub type QueryErrorHook = Arc<dyn Fn(&Error, &Query) + Send + Sync>;
pub type QuerySuccessHook = Arc<dyn Fn(&Value, &Query) + Send + Sync>;

/// Hooks that run for every query in the cache, before any observer hears
/// about the outcome.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
  pub on_error: Option<QueryErrorHook>,
  pub on_success: Option<QuerySuccessHook>,
}

impl QueryCacheConfig {
  pub fn on_error(mut self, f: impl Fn(&Error, &Query) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&Value, &Query) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }
}

impl fmt::Debug for QueryCacheConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCacheConfig")
      .field("on_error", &self.on_error.is_some())
      .field("on_success", &self.on_success.is_some())
      .finish()
  }
}

/// What happened in the cache.
#[derive(Debug, Clone)]
pub enum QueryCacheEvent {
  Added { query: Query },
  Removed { query: Query },
  Updated { query: Query, action: QueryAction },
  ObserverAdded { query: Query, observer_id: u64 },
  ObserverRemoved { query: Query, observer_id: u64 },
  ObserverResultsUpdated { query: Query },
  ObserverOptionsUpdated { query: Query, observer_id: u64 },
}

impl QueryCacheEvent {
  pub fn query(&self) -> &Query {
    match self {
      QueryCacheEvent::Added { query }
      | QueryCacheEvent::Removed { query }
      | QueryCacheEvent::Updated { query, .. }
      | QueryCacheEvent::ObserverAdded { query, .. }
      | QueryCacheEvent::ObserverRemoved { query, .. }
      | QueryCacheEvent::ObserverResultsUpdated { query }
      | QueryCacheEvent::ObserverOptionsUpdated { query, .. } => query,
    }
  }
}

type CacheListener = dyn Fn(&QueryCacheEvent) + Send + Sync;

#[derive(Default)]
struct Store {
  // Insertion order, for iteration.
  queries: Vec<Query>,
  by_hash: HashMap<String, Query>,
}

pub(crate) struct QueryCacheInner {
  store: RwLock<Store>,
  listeners: Listeners<CacheListener>,
  config: QueryCacheConfig,
  ctx: RuntimeContext,
}

/// Holds every query of a client. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<QueryCacheInner>,
}

impl QueryCache {
  pub(crate) fn new(config: QueryCacheConfig, ctx: RuntimeContext) -> Self {
    Self {
      inner: Arc::new(QueryCacheInner {
        store: RwLock::new(Store::default()),
        listeners: Listeners::new(),
        config,
        ctx,
      }),
    }
  }

  pub(crate) fn from_inner(inner: Arc<QueryCacheInner>) -> Self {
    Self { inner }
  }

  /// Returns the query for `options`' hash, creating it when missing.
  /// Options are resolved through the client's defaults first.
  pub fn build(&self, client: &QueryClient, options: QueryOptions, state: Option<QueryState>) -> Query {
    let options = client.default_query_options(options);
    let defaults = options
      .get_query_key()
      .and_then(|key| client.get_query_defaults(key));
    self.build_resolved(options, defaults, state)
  }

  pub(crate) fn build_resolved(
    &self,
    options: QueryOptions,
    default_options: Option<QueryOptions>,
    state: Option<QueryState>,
  ) -> Query {
    let query_hash = options.get_query_hash();
    let query = {
      let mut store = self.inner.store.write();
      if let Some(existing) = store.by_hash.get(&query_hash) {
        return existing.clone();
      }
      let query = Query::new(QueryConfig {
        cache: Arc::downgrade(&self.inner),
        options,
        default_options,
        state,
        ctx: self.inner.ctx.clone(),
      });
      store.by_hash.insert(query_hash.clone(), query.clone());
      store.queries.push(query.clone());
      query
    };
    tracing::trace!(query_hash = %query_hash, "query added");
    self.notify(QueryCacheEvent::Added { query: query.clone() });
    query
  }

  /// Adds a query built elsewhere. No-op when its hash is taken.
  pub fn add(&self, query: Query) {
    {
      let mut store = self.inner.store.write();
      if store.by_hash.contains_key(query.hash()) {
        return;
      }
      store.by_hash.insert(query.hash().to_owned(), query.clone());
      store.queries.push(query.clone());
    }
    self.notify(QueryCacheEvent::Added { query });
  }

  /// Removes exactly this query. No-op when the hash now belongs to a
  /// different entry.
  pub fn remove(&self, query: &Query) {
    let removed = {
      let mut store = self.inner.store.write();
      let owned = store
        .by_hash
        .get(query.hash())
        .is_some_and(|current| current.ptr_eq(query));
      if owned {
        store.by_hash.remove(query.hash());
        store.queries.retain(|q| !q.ptr_eq(query));
      }
      owned
    };
    if removed {
      query.destroy();
      tracing::trace!(query_hash = %query.hash(), "query removed");
      self.notify(QueryCacheEvent::Removed { query: query.clone() });
    }
  }

  pub fn clear(&self) {
    self.inner.ctx.notify.batch(|| {
      for query in self.get_all() {
        self.remove(&query);
      }
    });
  }

  pub fn get(&self, query_hash: &str) -> Option<Query> {
    self.inner.store.read().by_hash.get(query_hash).cloned()
  }

  pub fn get_all(&self) -> Vec<Query> {
    self.inner.store.read().queries.clone()
  }

  pub fn len(&self) -> usize {
    self.inner.store.read().queries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The first matching query. A key filter matches exactly unless the
  /// filter explicitly asks for prefix matching.
  pub fn find(&self, filters: &QueryFilters) -> Option<Query> {
    let filters = filters.clone().exact_if_unset(true);
    self.get_all().into_iter().find(|query| filters.matches(query))
  }

  pub fn find_all(&self, filters: &QueryFilters) -> Vec<Query> {
    self
      .get_all()
      .into_iter()
      .filter(|query| filters.matches(query))
      .collect()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&QueryCacheEvent) + Send + Sync + 'static,
  {
    let (id, _) = self.inner.listeners.add(Arc::new(listener));
    let weak = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = weak.upgrade() {
        inner.listeners.remove(id);
      }
    })
  }

  /// Schedules delivery of `event` to every listener.
  pub fn notify(&self, event: QueryCacheEvent) {
    let listeners = self.inner.listeners.snapshot();
    if listeners.is_empty() {
      return;
    }
    let notify = &self.inner.ctx.notify;
    notify.batch(|| {
      for listener in listeners {
        let event = event.clone();
        notify.schedule(move || listener(&event));
      }
    });
  }

  pub fn on_focus(&self) {
    self.inner.ctx.notify.batch(|| {
      for query in self.get_all() {
        query.on_focus();
      }
    });
  }

  pub fn on_online(&self) {
    self.inner.ctx.notify.batch(|| {
      for query in self.get_all() {
        query.on_online();
      }
    });
  }

  pub(crate) fn on_query_success(&self, data: &Value, query: &Query) {
    if let Some(hook) = &self.inner.config.on_success {
      hook(data, query);
    }
  }

  pub(crate) fn on_query_error(&self, error: &Error, query: &Query) {
    if let Some(hook) = &self.inner.config.on_error {
      hook(error, query);
    }
  }
}

impl fmt::Debug for QueryCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryCache")
      .field("len", &self.len())
      .field("config", &self.inner.config)
      .finish()
  }
}
