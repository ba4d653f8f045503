use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MutateOptions, Mutation, MutationAction, MutationCacheEvent, MutationObserverResult, MutationOptions};
use crate::client::QueryClient;
use crate::deferred::DeferredFuture;
use crate::error::Result;
use crate::listener::{Listeners, Subscription};
use crate::observer::next_observer_id;
use crate::value::Value;

type ResultListener = dyn Fn(&MutationObserverResult) + Send + Sync;

struct ObserverState {
  options: MutationOptions,
  current_mutation: Option<Mutation>,
  mutate_options: Option<MutateOptions>,
  result: MutationObserverResult,
}

pub(crate) struct MutationObserverInner {
  id: u64,
  client: QueryClient,
  state: Mutex<ObserverState>,
  listeners: Listeners<ResultListener>,
}

impl Drop for MutationObserverInner {
  fn drop(&mut self) {
    if let Some(mutation) = self.state.get_mut().current_mutation.take() {
      mutation.remove_observer(self.id);
    }
  }
}

/// Runs mutations and follows the state of the latest one.
#[derive(Clone)]
pub struct MutationObserver {
  pub(crate) inner: Arc<MutationObserverInner>,
}

impl MutationObserver {
  pub fn new(client: &QueryClient, options: MutationOptions) -> Self {
    Self {
      inner: Arc::new(MutationObserverInner {
        id: next_observer_id(),
        client: client.clone(),
        state: Mutex::new(ObserverState {
          options: client.default_mutation_options(options),
          current_mutation: None,
          mutate_options: None,
          result: MutationObserverResult::default(),
        }),
        listeners: Listeners::new(),
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn options(&self) -> MutationOptions {
    self.inner.state.lock().options.clone()
  }

  pub fn set_options(&self, options: MutationOptions) {
    let options = self.inner.client.default_mutation_options(options);
    let mutation = {
      let mut state = self.inner.state.lock();
      state.options = options.clone();
      state.current_mutation.clone()
    };
    if let Some(mutation) = mutation {
      mutation.set_options(options);
      self
        .inner
        .client
        .mutation_cache()
        .notify(MutationCacheEvent::ObserverOptionsUpdated {
          mutation,
          observer_id: self.inner.id,
        });
    }
  }

  pub fn get_current_result(&self) -> MutationObserverResult {
    self.inner.state.lock().result.clone()
  }

  /// The mutation this observer started last, if it is still attached.
  pub fn get_current_mutation(&self) -> Option<Mutation> {
    self.inner.state.lock().current_mutation.clone()
  }

  pub fn has_listeners(&self) -> bool {
    !self.inner.listeners.is_empty()
  }

  /// Removing the last listener detaches the observer from its mutation so
  /// the mutation can be collected once settled.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&MutationObserverResult) + Send + Sync + 'static,
  {
    let (id, _) = self.inner.listeners.add(Arc::new(listener));
    let weak = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = weak.upgrade() {
        if inner.listeners.remove(id) == Some(0) {
          MutationObserver { inner }.detach();
        }
      }
    })
  }

  /// Starts a new mutation with `variables`. The per-call callbacks in
  /// `options` run after the mutation's own callbacks.
  pub fn mutate(&self, variables: impl Into<Value>, options: MutateOptions) -> DeferredFuture<Result<Value>> {
    let (previous, mutation_options) = {
      let mut state = self.inner.state.lock();
      state.mutate_options = Some(options);
      (state.current_mutation.take(), state.options.clone())
    };
    if let Some(previous) = previous {
      previous.remove_observer(self.inner.id);
    }

    let client = &self.inner.client;
    let mutation = client
      .mutation_cache()
      .build(client, mutation_options, Some(variables.into()), None);
    self.inner.state.lock().current_mutation = Some(mutation.clone());
    mutation.add_observer(self.inner.id, Arc::downgrade(&self.inner));
    mutation.execute()
  }

  /// Forgets the current mutation and goes back to idle.
  pub fn reset(&self) {
    self.detach();
    let result = {
      let mut state = self.inner.state.lock();
      state.result = MutationObserverResult::default();
      state.result.clone()
    };
    self.notify_listeners(result);
  }

  fn detach(&self) {
    let mutation = self.inner.state.lock().current_mutation.take();
    if let Some(mutation) = mutation {
      mutation.remove_observer(self.inner.id);
    }
  }

  pub(crate) fn on_mutation_update(&self, mutation: &Mutation, action: &MutationAction, run_callbacks: bool) {
    let (result, mutate_options) = {
      let mut state = self.inner.state.lock();
      let current = state.current_mutation.as_ref().is_some_and(|m| m.ptr_eq(mutation));
      if !current {
        return;
      }
      state.result = mutation.state();
      (state.result.clone(), state.mutate_options.clone())
    };

    if run_callbacks {
      if let Some(callbacks) = mutate_options {
        self.schedule_callbacks(callbacks, action, &result);
      }
    }
    self.notify_listeners(result);
  }

  fn schedule_callbacks(&self, callbacks: MutateOptions, action: &MutationAction, result: &MutationObserverResult) {
    let variables = result.variables.clone().unwrap_or_default();
    let context = result.context.clone();
    let notify = &self.inner.client.ctx().notify;
    match action {
      MutationAction::Success { data } => {
        let data = data.clone();
        notify.schedule(move || {
          if let Some(on_success) = &callbacks.on_success {
            on_success(&data, &variables, context.as_ref());
          }
          if let Some(on_settled) = &callbacks.on_settled {
            on_settled(Some(&data), None, &variables, context.as_ref());
          }
        });
      }
      MutationAction::Error { error } => {
        let error = error.clone();
        notify.schedule(move || {
          if let Some(on_error) = &callbacks.on_error {
            on_error(&error, &variables, context.as_ref());
          }
          if let Some(on_settled) = &callbacks.on_settled {
            on_settled(None, Some(&error), &variables, context.as_ref());
          }
        });
      }
      _ => {}
    }
  }

  fn notify_listeners(&self, result: MutationObserverResult) {
    for listener in self.inner.listeners.snapshot() {
      let result = result.clone();
      self.inner.client.ctx().notify.schedule(move || listener(&result));
    }
  }
}

impl fmt::Debug for MutationObserver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("MutationObserver")
      .field("id", &self.inner.id)
      .field("status", &state.result.status)
      .field("current_mutation", &state.current_mutation.is_some())
      .finish_non_exhaustive()
  }
}
