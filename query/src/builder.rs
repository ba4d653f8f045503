use std::fmt;
use std::sync::Arc;

use crate::client::{DefaultOptions, QueryClient};
use crate::connectivity::{FocusManager, OnlineManager};
use crate::mutation::{MutationCache, MutationCacheConfig, MutationOptions};
use crate::notify::NotifyManager;
use crate::query::QueryOptions;
use crate::query_cache::{QueryCache, QueryCacheConfig};
use crate::runtime::{RuntimeContext, TaskSpawner, TokioSpawner};

/// A builder for [`QueryClient`].
///
/// Every client gets its own focus, online and notify managers unless shared
/// ones are supplied, so several clients can follow the same signals.
#[derive(Default)]
pub struct QueryClientBuilder {
  default_options: DefaultOptions,
  query_cache_config: QueryCacheConfig,
  mutation_cache_config: MutationCacheConfig,
  focus_manager: Option<FocusManager>,
  online_manager: Option<OnlineManager>,
  notify_manager: Option<NotifyManager>,
  spawner: Option<Arc<dyn TaskSpawner>>,
}

impl fmt::Debug for QueryClientBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryClientBuilder")
      .field("default_options", &self.default_options)
      .field("query_cache_config", &self.query_cache_config)
      .field("mutation_cache_config", &self.mutation_cache_config)
      .field("has_focus_manager", &self.focus_manager.is_some())
      .field("has_online_manager", &self.online_manager.is_some())
      .field("has_notify_manager", &self.notify_manager.is_some())
      .field("has_spawner", &self.spawner.is_some())
      .finish()
  }
}

impl QueryClientBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn default_options(mut self, options: DefaultOptions) -> Self {
    self.default_options = options;
    self
  }

  /// Client-wide defaults for every query.
  pub fn default_query_options(mut self, options: QueryOptions) -> Self {
    self.default_options.queries = options;
    self
  }

  /// Client-wide defaults for every mutation.
  pub fn default_mutation_options(mut self, options: MutationOptions) -> Self {
    self.default_options.mutations = options;
    self
  }

  pub fn query_cache_config(mut self, config: QueryCacheConfig) -> Self {
    self.query_cache_config = config;
    self
  }

  pub fn mutation_cache_config(mut self, config: MutationCacheConfig) -> Self {
    self.mutation_cache_config = config;
    self
  }

  pub fn focus_manager(mut self, manager: FocusManager) -> Self {
    self.focus_manager = Some(manager);
    self
  }

  pub fn online_manager(mut self, manager: OnlineManager) -> Self {
    self.online_manager = Some(manager);
    self
  }

  pub fn notify_manager(mut self, manager: NotifyManager) -> Self {
    self.notify_manager = Some(manager);
    self
  }

  /// Sets where background work (fetches, timers, delayed notifications)
  /// runs. Defaults to the ambient Tokio runtime.
  pub fn spawner<S: TaskSpawner>(mut self, spawner: S) -> Self {
    self.spawner = Some(Arc::new(spawner));
    self
  }

  pub fn build(self) -> QueryClient {
    let spawner = self.spawner.unwrap_or_else(|| Arc::new(TokioSpawner::new()));
    let notify = self
      .notify_manager
      .unwrap_or_else(|| NotifyManager::with_spawner(spawner.clone()));
    let ctx = RuntimeContext {
      spawner,
      notify,
      focus: self.focus_manager.unwrap_or_default(),
      online: self.online_manager.unwrap_or_default(),
    };
    let query_cache = QueryCache::new(self.query_cache_config, ctx.clone());
    let mutation_cache = MutationCache::new(self.mutation_cache_config, ctx.clone());
    QueryClient::from_parts(query_cache, mutation_cache, self.default_options, ctx)
  }
}
