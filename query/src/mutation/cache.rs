use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Mutation, MutationAction, MutationConfig, MutationOptions, MutationState};
use crate::client::QueryClient;
use crate::deferred::{Deferred, DeferredFuture};
use crate::error::Error;
use crate::filters::MutationFilters;
use crate::listener::{Listeners, Subscription};
use crate::runtime::RuntimeContext;
use crate::value::Value;

/// `(variables, mutation)`.
pub type MutationMutateHook = Arc<dyn Fn(&Value, &Mutation) + Send + Sync>;
/// `(data, variables, context, mutation)`.
pub type MutationSuccessHook = Arc<dyn Fn(&Value, &Value, Option<&Value>, &Mutation) + Send + Sync>;
/// `(error, variables, context, mutation)`.
pub type MutationErrorHook = Arc<dyn Fn(&Error, &Value, Option<&Value>, &Mutation) + Send + Sync>;
/// `(data, error, variables, context, mutation)`.
pub type MutationSettledHook =
  Arc<dyn Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>, &Mutation) + Send + Sync>;

/// Hooks that run for every mutation, before the mutation's own callbacks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
  pub on_mutate: Option<MutationMutateHook>,
  pub on_success: Option<MutationSuccessHook>,
  pub on_error: Option<MutationErrorHook>,
  pub on_settled: Option<MutationSettledHook>,
}

impl MutationCacheConfig {
  pub fn on_mutate(mut self, f: impl Fn(&Value, &Mutation) + Send + Sync + 'static) -> Self {
    self.on_mutate = Some(Arc::new(f));
    self
  }

  pub fn on_success(mut self, f: impl Fn(&Value, &Value, Option<&Value>, &Mutation) + Send + Sync + 'static) -> Self {
    self.on_success = Some(Arc::new(f));
    self
  }

  pub fn on_error(mut self, f: impl Fn(&Error, &Value, Option<&Value>, &Mutation) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  pub fn on_settled(
    mut self,
    f: impl Fn(Option<&Value>, Option<&Error>, &Value, Option<&Value>, &Mutation) + Send + Sync + 'static,
  ) -> Self {
    self.on_settled = Some(Arc::new(f));
    self
  }
}

impl fmt::Debug for MutationCacheConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCacheConfig")
      .field("on_mutate", &self.on_mutate.is_some())
      .field("on_success", &self.on_success.is_some())
      .field("on_error", &self.on_error.is_some())
      .field("on_settled", &self.on_settled.is_some())
      .finish()
  }
}

#[derive(Debug, Clone)]
pub enum MutationCacheEvent {
  Added { mutation: Mutation },
  Removed { mutation: Mutation },
  Updated { mutation: Mutation, action: MutationAction },
  ObserverAdded { mutation: Mutation, observer_id: u64 },
  ObserverRemoved { mutation: Mutation, observer_id: u64 },
  ObserverOptionsUpdated { mutation: Mutation, observer_id: u64 },
}

impl MutationCacheEvent {
  pub fn mutation(&self) -> &Mutation {
    match self {
      MutationCacheEvent::Added { mutation }
      | MutationCacheEvent::Removed { mutation }
      | MutationCacheEvent::Updated { mutation, .. }
      | MutationCacheEvent::ObserverAdded { mutation, .. }
      | MutationCacheEvent::ObserverRemoved { mutation, .. }
      | MutationCacheEvent::ObserverOptionsUpdated { mutation, .. } => mutation,
    }
  }
}

type CacheListener = dyn Fn(&MutationCacheEvent) + Send + Sync;

pub(crate) struct MutationCacheInner {
  mutations: RwLock<Vec<Mutation>>,
  next_id: AtomicU64,
  listeners: Listeners<CacheListener>,
  config: MutationCacheConfig,
  // Serializes replays of paused mutations.
  resuming: Arc<tokio::sync::Mutex<()>>,
  ctx: RuntimeContext,
}

/// Holds every mutation of a client in creation order. Cheap to clone.
#[derive(Clone)]
pub struct MutationCache {
  inner: Arc<MutationCacheInner>,
}

impl MutationCache {
  pub(crate) fn new(config: MutationCacheConfig, ctx: RuntimeContext) -> Self {
    Self {
      inner: Arc::new(MutationCacheInner {
        mutations: RwLock::new(Vec::new()),
        next_id: AtomicU64::new(1),
        listeners: Listeners::new(),
        config,
        resuming: Arc::new(tokio::sync::Mutex::new(())),
        ctx,
      }),
    }
  }

  pub(crate) fn from_inner(inner: Arc<MutationCacheInner>) -> Self {
    Self { inner }
  }

  /// Creates and registers a new mutation. Mutations are never shared: every
  /// call produces a fresh entry.
  pub fn build(
    &self,
    client: &QueryClient,
    options: MutationOptions,
    variables: Option<Value>,
    state: Option<MutationState>,
  ) -> Mutation {
    let mutation = Mutation::new(MutationConfig {
      mutation_id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
      cache: Arc::downgrade(&self.inner),
      options: client.default_mutation_options(options),
      variables,
      state,
      ctx: self.inner.ctx.clone(),
    });
    self.add(mutation.clone());
    mutation
  }

  /// No-op when this exact mutation is already registered.
  pub fn add(&self, mutation: Mutation) {
    {
      let mut mutations = self.inner.mutations.write();
      if mutations.iter().any(|m| m.ptr_eq(&mutation)) {
        return;
      }
      mutations.push(mutation.clone());
    }
    self.notify(MutationCacheEvent::Added { mutation });
  }

  /// No-op when the mutation is not registered.
  pub fn remove(&self, mutation: &Mutation) {
    let removed = {
      let mut mutations = self.inner.mutations.write();
      let before = mutations.len();
      mutations.retain(|m| !m.ptr_eq(mutation));
      mutations.len() != before
    };
    if removed {
      mutation.destroy();
      self.notify(MutationCacheEvent::Removed {
        mutation: mutation.clone(),
      });
    }
  }

  pub fn clear(&self) {
    self.inner.ctx.notify.batch(|| {
      for mutation in self.get_all() {
        self.remove(&mutation);
      }
    });
  }

  pub fn get_all(&self) -> Vec<Mutation> {
    self.inner.mutations.read().clone()
  }

  pub fn len(&self) -> usize {
    self.inner.mutations.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The first matching mutation; keys match exactly unless asked otherwise.
  pub fn find(&self, filters: &MutationFilters) -> Option<Mutation> {
    let filters = filters.clone().exact_if_unset(true);
    self.get_all().into_iter().find(|mutation| filters.matches(mutation))
  }

  pub fn find_all(&self, filters: &MutationFilters) -> Vec<Mutation> {
    self
      .get_all()
      .into_iter()
      .filter(|mutation| filters.matches(mutation))
      .collect()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&MutationCacheEvent) + Send + Sync + 'static,
  {
    let (id, _) = self.inner.listeners.add(Arc::new(listener));
    let weak = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = weak.upgrade() {
        inner.listeners.remove(id);
      }
    })
  }

  pub fn notify(&self, event: MutationCacheEvent) {
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

  /// Replays every paused mutation, one at a time in creation order.
  /// Overlapping calls queue behind each other.
  pub fn resume_paused_mutations(&self) -> DeferredFuture<()> {
    let done = Deferred::new();
    let cache = self.clone();
    let gate = self.inner.resuming.clone();
    let finished = done.clone();
    self.inner.ctx.spawn(async move {
      let _guard = gate.lock().await;
      let paused: Vec<Mutation> = cache
        .get_all()
        .into_iter()
        .filter(|mutation| mutation.state().is_paused)
        .collect();
      if !paused.is_empty() {
        tracing::debug!(count = paused.len(), "resuming paused mutations");
      }
      for mutation in paused {
        let _ = mutation.resume().await;
      }
      finished.settle(());
    });
    done.wait()
  }

  pub(crate) fn on_mutate(&self, variables: &Value, mutation: &Mutation) {
    if let Some(hook) = &self.inner.config.on_mutate {
      hook(variables, mutation);
    }
  }

  pub(crate) fn on_success(&self, data: &Value, variables: &Value, context: Option<&Value>, mutation: &Mutation) {
    if let Some(hook) = &self.inner.config.on_success {
      hook(data, variables, context, mutation);
    }
  }

  pub(crate) fn on_error(&self, error: &Error, variables: &Value, context: Option<&Value>, mutation: &Mutation) {
    if let Some(hook) = &self.inner.config.on_error {
      hook(error, variables, context, mutation);
    }
  }

  pub(crate) fn on_settled(
    &self,
    data: Option<&Value>,
    error: Option<&Error>,
    variables: &Value,
    context: Option<&Value>,
    mutation: &Mutation,
  ) {
    if let Some(hook) = &self.inner.config.on_settled {
      hook(data, error, variables, context, mutation);
    }
  }
}

impl fmt::Debug for MutationCache {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationCache")
      .field("len", &self.len())
      .field("config", &self.inner.config)
      .finish()
  }
}
