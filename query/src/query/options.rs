use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use super::state::{FetchDirection, QueryState};
use super::Query;
use crate::error::{Error, Result};
use crate::key::{hash_key_with, KeyHashFn, QueryKey};
use crate::retryer::{Attempt, NetworkMode, Retry, RetryDelay};
use crate::value::Value;

/// How long an unobserved query stays cached by default.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Retries a query gets by default.
pub const DEFAULT_QUERY_RETRY: u32 = 3;

pub type QueryFn = Arc<dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;
pub type SelectFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Computes the cursor for an adjacent page from
/// `(page, all_pages, page_param, all_page_params)`. `None` means there is
/// no such page.
pub type PageParamFn = Arc<dyn Fn(&Value, &[Value], &Value, &[Value]) -> Option<Value> + Send + Sync>;

/// Picks which pages of an infinite query a refetch re-requests, given
/// `(page, index, all_pages)`.
pub type RefetchPageFn = Arc<dyn Fn(&Value, usize, &[Value]) -> bool + Send + Sync>;

pub type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type SettledCallback = Arc<dyn Fn(Option<&Value>, Option<&Error>) + Send + Sync>;

/// The cancellation signal of one fetch. Tracks whether the query function
/// ever asked for it.
#[derive(Clone, Default)]
pub(crate) struct AbortSignal {
  token: CancellationToken,
  consumed: Arc<AtomicBool>,
}

impl AbortSignal {
  pub(crate) fn cancel(&self) {
    self.token.cancel();
  }

  pub(crate) fn is_consumed(&self) -> bool {
    self.consumed.load(Ordering::SeqCst)
  }
}

/// What a query function receives on every invocation.
#[derive(Clone)]
pub struct QueryFunctionContext {
  pub query_key: QueryKey,
  /// The cursor of the page being fetched, for infinite queries.
  pub page_param: Option<Value>,
  pub meta: Option<Value>,
  signal: AbortSignal,
}

impl QueryFunctionContext {
  /// The fetch's cancellation token.
  ///
  /// Asking for it marks the fetch as abortable: when its last observer
  /// leaves mid-flight, the fetch is cancelled and the query reverted instead
  /// of being left to finish in the background.
  pub fn signal(&self) -> CancellationToken {
    self.signal.consumed.store(true, Ordering::SeqCst);
    self.signal.token.clone()
  }
}

impl fmt::Debug for QueryFunctionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryFunctionContext")
      .field("query_key", &self.query_key)
      .field("page_param", &self.page_param)
      .field("meta", &self.meta)
      .finish_non_exhaustive()
  }
}

/// When a trigger (mount, focus, reconnect) refetches a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOn {
  Never,
  IfStale,
  Always,
}

#[derive(Clone)]
pub enum RefetchPolicy {
  Static(RefetchOn),
  Dynamic(Arc<dyn Fn(&Query) -> RefetchOn + Send + Sync>),
}

impl RefetchPolicy {
  pub fn dynamic<F>(f: F) -> Self
  where
    F: Fn(&Query) -> RefetchOn + Send + Sync + 'static,
  {
    RefetchPolicy::Dynamic(Arc::new(f))
  }

  pub(crate) fn resolve(&self, query: &Query) -> RefetchOn {
    match self {
      RefetchPolicy::Static(on) => *on,
      RefetchPolicy::Dynamic(f) => f(query),
    }
  }
}

impl From<RefetchOn> for RefetchPolicy {
  fn from(on: RefetchOn) -> Self {
    RefetchPolicy::Static(on)
  }
}

impl From<bool> for RefetchPolicy {
  fn from(enabled: bool) -> Self {
    RefetchPolicy::Static(if enabled { RefetchOn::IfStale } else { RefetchOn::Never })
  }
}

impl fmt::Debug for RefetchPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RefetchPolicy::Static(on) => f.debug_tuple("Static").field(on).finish(),
      RefetchPolicy::Dynamic(_) => f.write_str("Dynamic(..)"),
    }
  }
}

/// Periodic background refetching.
#[derive(Clone)]
pub enum RefetchInterval {
  Every(Duration),
  /// Recomputed from the latest data after every update; `None` stops.
  Dynamic(Arc<dyn Fn(Option<&Value>, &Query) -> Option<Duration> + Send + Sync>),
}

impl RefetchInterval {
  pub fn dynamic<F>(f: F) -> Self
  where
    F: Fn(Option<&Value>, &Query) -> Option<Duration> + Send + Sync + 'static,
  {
    RefetchInterval::Dynamic(Arc::new(f))
  }
}

/// Data shown while a query has nothing cached. Never written to the cache.
#[derive(Clone)]
pub enum PlaceholderData {
  Value(Value),
  Fn(Arc<dyn Fn() -> Option<Value> + Send + Sync>),
}

impl PlaceholderData {
  pub fn from_fn<F>(f: F) -> Self
  where
    F: Fn() -> Option<Value> + Send + Sync + 'static,
  {
    PlaceholderData::Fn(Arc::new(f))
  }

  pub(crate) fn resolve(&self) -> Option<Value> {
    match self {
      PlaceholderData::Value(value) => Some(value.clone()),
      PlaceholderData::Fn(f) => f(),
    }
  }

  pub(crate) fn same_as(&self, other: &PlaceholderData) -> bool {
    match (self, other) {
      (PlaceholderData::Value(a), PlaceholderData::Value(b)) => a.ptr_eq(b),
      (PlaceholderData::Fn(a), PlaceholderData::Fn(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}

/// Data a query starts out with. Unlike placeholder data it is cached.
#[derive(Clone)]
pub enum InitialData {
  Value(Value),
  Fn(Arc<dyn Fn() -> Option<Value> + Send + Sync>),
}

impl InitialData {
  pub fn from_fn<F>(f: F) -> Self
  where
    F: Fn() -> Option<Value> + Send + Sync + 'static,
  {
    InitialData::Fn(Arc::new(f))
  }

  pub(crate) fn resolve(&self) -> Option<Value> {
    match self {
      InitialData::Value(value) => Some(value.clone()),
      InitialData::Fn(f) => f(),
    }
  }
}

/// Whether an observer's `refetch` reports query errors as `Err`.
#[derive(Clone)]
pub enum ThrowOnError {
  Bool(bool),
  Predicate(Arc<dyn Fn(&Error, &Query) -> bool + Send + Sync>),
}

impl ThrowOnError {
  pub(crate) fn should_throw(&self, error: &Error, query: &Query) -> bool {
    match self {
      ThrowOnError::Bool(b) => *b,
      ThrowOnError::Predicate(f) => f(error, query),
    }
  }
}

/// Options of one fetch call.
#[derive(Clone, Default)]
pub struct FetchOptions {
  /// Cancel a fetch already in flight (when the query has data) and start
  /// over instead of joining it.
  pub cancel_refetch: bool,
  pub meta: FetchMeta,
}

/// Extra instructions for infinite queries.
#[derive(Clone, Default)]
pub struct FetchMeta {
  pub fetch_more: Option<FetchMore>,
  pub refetch_page: Option<RefetchPageFn>,
  pub rebuild_page_params: bool,
}

#[derive(Debug, Clone)]
pub struct FetchMore {
  pub direction: FetchDirection,
  /// An explicit cursor; when absent it is computed from the existing pages.
  pub page_param: Option<Value>,
}

impl FetchOptions {
  pub(crate) fn direction(&self) -> Option<FetchDirection> {
    self.meta.fetch_more.as_ref().map(|more| more.direction)
  }
}

impl fmt::Debug for FetchOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchOptions")
      .field("cancel_refetch", &self.cancel_refetch)
      .field("fetch_more", &self.meta.fetch_more)
      .field("refetch_page", &self.meta.refetch_page.is_some())
      .finish()
  }
}

/// Everything a fetch behavior needs to produce the attempt function.
#[derive(Clone)]
pub(crate) struct FetchContext {
  pub(crate) query_key: QueryKey,
  pub(crate) query_hash: String,
  pub(crate) options: QueryOptions,
  pub(crate) state: QueryState,
  pub(crate) fetch_options: FetchOptions,
  pub(crate) signal: AbortSignal,
}

impl FetchContext {
  pub(crate) fn function_context(&self, page_param: Option<Value>) -> QueryFunctionContext {
    QueryFunctionContext {
      query_key: self.query_key.clone(),
      page_param,
      meta: self.options.meta.clone(),
      signal: self.signal.clone(),
    }
  }

  pub(crate) fn missing_query_fn(&self) -> Error {
    Error::MissingQueryFn {
      query_hash: self.query_hash.clone(),
    }
  }
}

/// Replaces how a query turns its options into a fetch, e.g. to fetch a list
/// of pages instead of one value.
pub(crate) trait QueryBehavior: Send + Sync {
  fn attempt(&self, context: FetchContext) -> Attempt<Value>;
}

/// The plain single-value fetch.
pub(crate) fn default_attempt(context: FetchContext) -> Attempt<Value> {
  match context.options.query_fn.clone() {
    Some(query_fn) => Arc::new(move || query_fn(context.function_context(None))),
    None => {
      tracing::error!(query_hash = %context.query_hash, "missing query function");
      let error = context.missing_query_fn();
      Arc::new(move || futures_util::future::ready(Err(error.clone())).boxed())
    }
  }
}

/// Configuration of a query and of the observers watching it.
///
/// Every field is optional; unset fields fall back to per-key defaults, then
/// to client-wide defaults, then to the built-in defaults.
#[derive(Clone, Default)]
pub struct QueryOptions {
  pub(crate) query_key: Option<QueryKey>,
  pub(crate) query_hash: Option<String>,
  pub(crate) query_key_hash_fn: Option<KeyHashFn>,
  pub(crate) query_fn: Option<QueryFn>,
  pub(crate) enabled: Option<bool>,
  pub(crate) stale_time: Option<Duration>,
  pub(crate) cache_time: Option<Duration>,
  pub(crate) retry: Option<Retry>,
  pub(crate) retry_delay: Option<RetryDelay>,
  pub(crate) retry_on_mount: Option<bool>,
  pub(crate) network_mode: Option<NetworkMode>,
  pub(crate) refetch_on_mount: Option<RefetchPolicy>,
  pub(crate) refetch_on_window_focus: Option<RefetchPolicy>,
  pub(crate) refetch_on_reconnect: Option<RefetchPolicy>,
  pub(crate) refetch_interval: Option<RefetchInterval>,
  pub(crate) refetch_interval_in_background: Option<bool>,
  pub(crate) select: Option<SelectFn>,
  pub(crate) placeholder_data: Option<PlaceholderData>,
  pub(crate) keep_previous_data: Option<bool>,
  pub(crate) structural_sharing: Option<bool>,
  pub(crate) initial_data: Option<InitialData>,
  pub(crate) initial_data_updated_at: Option<u64>,
  pub(crate) meta: Option<Value>,
  pub(crate) throw_on_error: Option<ThrowOnError>,
  pub(crate) on_success: Option<DataCallback>,
  pub(crate) on_error: Option<ErrorCallback>,
  pub(crate) on_settled: Option<SettledCallback>,
  pub(crate) behavior: Option<Arc<dyn QueryBehavior>>,
  pub(crate) initial_page_param: Option<Value>,
  pub(crate) get_next_page_param: Option<PageParamFn>,
  pub(crate) get_previous_page_param: Option<PageParamFn>,
}

macro_rules! fill_unset {
  ($target:ident, $base:ident, $($field:ident),* $(,)?) => {
    $(
      if $target.$field.is_none() {
        $target.$field = $base.$field.clone();
      }
    )*
  };
}

impl QueryOptions {
  pub fn new(query_key: impl Into<QueryKey>) -> Self {
    Self {
      query_key: Some(query_key.into()),
      ..Self::default()
    }
  }

  /// Fills every unset field from `defaults`.
  pub fn with_defaults(mut self, defaults: &QueryOptions) -> Self {
    fill_unset!(
      self,
      defaults,
      query_key,
      query_hash,
      query_key_hash_fn,
      query_fn,
      enabled,
      stale_time,
      cache_time,
      retry,
      retry_delay,
      retry_on_mount,
      network_mode,
      refetch_on_mount,
      refetch_on_window_focus,
      refetch_on_reconnect,
      refetch_interval,
      refetch_interval_in_background,
      select,
      placeholder_data,
      keep_previous_data,
      structural_sharing,
      initial_data,
      initial_data_updated_at,
      meta,
      throw_on_error,
      on_success,
      on_error,
      on_settled,
      behavior,
      initial_page_param,
      get_next_page_param,
      get_previous_page_param,
    );
    self
  }

  // --- Builder-style setters ---

  pub fn query_key(mut self, query_key: impl Into<QueryKey>) -> Self {
    self.query_key = Some(query_key.into());
    self.query_hash = None;
    self
  }

  /// Uses a custom key hashing function for this query.
  pub fn query_key_hash_fn<F>(mut self, f: F) -> Self
  where
    F: Fn(&QueryKey) -> String + Send + Sync + 'static,
  {
    self.query_key_hash_fn = Some(Arc::new(f));
    self.query_hash = None;
    self
  }

  pub fn query_fn<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
  {
    self.query_fn = Some(Arc::new(move |ctx: QueryFunctionContext| f(ctx).boxed()));
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = Some(enabled);
    self
  }

  pub fn stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
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

  pub fn retry_on_mount(mut self, retry_on_mount: bool) -> Self {
    self.retry_on_mount = Some(retry_on_mount);
    self
  }

  pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
    self.network_mode = Some(network_mode);
    self
  }

  pub fn refetch_on_mount(mut self, policy: impl Into<RefetchPolicy>) -> Self {
    self.refetch_on_mount = Some(policy.into());
    self
  }

  pub fn refetch_on_window_focus(mut self, policy: impl Into<RefetchPolicy>) -> Self {
    self.refetch_on_window_focus = Some(policy.into());
    self
  }

  pub fn refetch_on_reconnect(mut self, policy: impl Into<RefetchPolicy>) -> Self {
    self.refetch_on_reconnect = Some(policy.into());
    self
  }

  pub fn refetch_interval(mut self, interval: RefetchInterval) -> Self {
    self.refetch_interval = Some(interval);
    self
  }

  pub fn refetch_interval_in_background(mut self, in_background: bool) -> Self {
    self.refetch_interval_in_background = Some(in_background);
    self
  }

  /// Transforms the data observers see. The cached data stays untouched.
  pub fn select<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
  {
    self.select = Some(Arc::new(f));
    self
  }

  /// Like [`QueryOptions::select`] but reuses an existing function, so its
  /// result stays memoized across option updates.
  pub fn select_fn(mut self, select: SelectFn) -> Self {
    self.select = Some(select);
    self
  }

  pub fn placeholder_data(mut self, placeholder: PlaceholderData) -> Self {
    self.placeholder_data = Some(placeholder);
    self
  }

  pub fn keep_previous_data(mut self, keep: bool) -> Self {
    self.keep_previous_data = Some(keep);
    self
  }

  pub fn structural_sharing(mut self, enabled: bool) -> Self {
    self.structural_sharing = Some(enabled);
    self
  }

  pub fn initial_data(mut self, initial: InitialData) -> Self {
    self.initial_data = Some(initial);
    self
  }

  pub fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
    self.initial_data_updated_at = Some(updated_at);
    self
  }

  pub fn meta(mut self, meta: impl Into<Value>) -> Self {
    self.meta = Some(meta.into());
    self
  }

  pub fn throw_on_error(mut self, throw: ThrowOnError) -> Self {
    self.throw_on_error = Some(throw);
    self
  }

  pub fn on_success(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(mut self, f: impl Fn(Option<&Value>, Option<&Error>) + Send + Sync + 'static) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }

  pub fn initial_page_param(mut self, param: impl Into<Value>) -> Self {
    self.initial_page_param = Some(param.into());
    self
  }

  pub fn get_next_page_param<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &[Value], &Value, &[Value]) -> Option<Value> + Send + Sync + 'static,
  {
    self.get_next_page_param = Some(Arc::new(f));
    self
  }

  pub fn get_previous_page_param<F>(mut self, f: F) -> Self
  where
    F: Fn(&Value, &[Value], &Value, &[Value]) -> Option<Value> + Send + Sync + 'static,
  {
    self.get_previous_page_param = Some(Arc::new(f));
    self
  }

  pub(crate) fn behavior(mut self, behavior: Arc<dyn QueryBehavior>) -> Self {
    self.behavior = Some(behavior);
    self
  }

  // --- Effective values ---

  pub fn get_query_key(&self) -> Option<&QueryKey> {
    self.query_key.as_ref()
  }

  /// The hash addressing this query's cache entry.
  pub fn get_query_hash(&self) -> String {
    match (&self.query_hash, &self.query_key) {
      (Some(hash), _) => hash.clone(),
      (None, Some(key)) => hash_key_with(key, self.query_key_hash_fn.as_ref()),
      (None, None) => QueryKey::default().hash(),
    }
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.unwrap_or(true)
  }

  pub fn get_stale_time(&self) -> Duration {
    self.stale_time.unwrap_or(Duration::ZERO)
  }

  pub fn get_cache_time(&self) -> Duration {
    self.cache_time.unwrap_or(DEFAULT_CACHE_TIME)
  }

  pub fn get_network_mode(&self) -> NetworkMode {
    self.network_mode.unwrap_or_default()
  }

  pub(crate) fn get_retry(&self) -> Retry {
    self.retry.clone().unwrap_or(Retry::Count(DEFAULT_QUERY_RETRY))
  }

  pub(crate) fn get_retry_delay(&self) -> RetryDelay {
    self.retry_delay.clone().unwrap_or_default()
  }

  pub(crate) fn get_retry_on_mount(&self) -> bool {
    self.retry_on_mount.unwrap_or(true)
  }

  pub(crate) fn get_refetch_on_mount(&self) -> RefetchPolicy {
    self.refetch_on_mount.clone().unwrap_or(RefetchPolicy::Static(RefetchOn::IfStale))
  }

  pub(crate) fn get_refetch_on_window_focus(&self) -> RefetchPolicy {
    self
      .refetch_on_window_focus
      .clone()
      .unwrap_or(RefetchPolicy::Static(RefetchOn::IfStale))
  }

  pub(crate) fn get_refetch_on_reconnect(&self) -> RefetchPolicy {
    self.refetch_on_reconnect.clone().unwrap_or_else(|| {
      // Queries that ignore connectivity have nothing to catch up on.
      if self.get_network_mode() == NetworkMode::Always {
        RefetchPolicy::Static(RefetchOn::Never)
      } else {
        RefetchPolicy::Static(RefetchOn::IfStale)
      }
    })
  }

  pub(crate) fn get_keep_previous_data(&self) -> bool {
    self.keep_previous_data.unwrap_or(false)
  }

  pub(crate) fn get_structural_sharing(&self) -> bool {
    self.structural_sharing.unwrap_or(true)
  }

  pub(crate) fn get_refetch_interval_in_background(&self) -> bool {
    self.refetch_interval_in_background.unwrap_or(false)
  }
}

impl fmt::Debug for QueryOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryOptions")
      .field("query_key", &self.query_key)
      .field("query_hash", &self.query_hash)
      .field("query_fn", &self.query_fn.is_some())
      .field("enabled", &self.enabled)
      .field("stale_time", &self.stale_time)
      .field("cache_time", &self.cache_time)
      .field("retry", &self.retry)
      .field("network_mode", &self.network_mode)
      .field("select", &self.select.is_some())
      .field("infinite", &self.behavior.is_some())
      .finish_non_exhaustive()
  }
}
