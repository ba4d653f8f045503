use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{QueryObserver, QueryObserverResult};
use crate::client::QueryClient;
use crate::listener::{Listeners, Subscription};
use crate::query::{Query, QueryOptions};

type ResultsListener = dyn Fn(&[QueryObserverResult]) + Send + Sync;

#[derive(Default)]
struct QueriesState {
  observers: Vec<QueryObserver>,
  results: Vec<QueryObserverResult>,
  subscriptions: Vec<(u64, Subscription)>,
}

struct QueriesInner {
  client: QueryClient,
  state: Mutex<QueriesState>,
  listeners: Listeners<ResultsListener>,
  notify_pending: AtomicBool,
}

/// Observes a dynamic list of queries and reports their results together.
///
/// Members are matched to the new list by query hash, so a query that stays
/// in the list keeps its observer (and its memoized result).
#[derive(Clone)]
pub struct QueriesObserver {
  inner: Arc<QueriesInner>,
}

impl QueriesObserver {
  pub fn new(client: &QueryClient, queries: Vec<QueryOptions>) -> Self {
    let observer = Self {
      inner: Arc::new(QueriesInner {
        client: client.clone(),
        state: Mutex::new(QueriesState::default()),
        listeners: Listeners::new(),
        notify_pending: AtomicBool::new(false),
      }),
    };
    observer.set_queries(queries);
    observer
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&[QueryObserverResult]) + Send + Sync + 'static,
  {
    let (id, count) = self.inner.listeners.add(Arc::new(listener));
    if count == 1 {
      let observers = self.get_observers();
      for observer in &observers {
        self.watch(observer);
      }
    }
    let weak = Arc::downgrade(&self.inner);
    Subscription::new(move || {
      if let Some(inner) = weak.upgrade() {
        if inner.listeners.remove(id) == Some(0) {
          QueriesObserver { inner }.destroy();
        }
      }
    })
  }

  pub fn has_listeners(&self) -> bool {
    !self.inner.listeners.is_empty()
  }

  pub fn destroy(&self) {
    self.inner.listeners.clear();
    let (observers, subscriptions) = {
      let mut state = self.inner.state.lock();
      (state.observers.clone(), std::mem::take(&mut state.subscriptions))
    };
    for (_, subscription) in subscriptions {
      subscription.unsubscribe();
    }
    for observer in observers {
      observer.destroy();
    }
  }

  /// Replaces the list of queries.
  pub fn set_queries(&self, queries: Vec<QueryOptions>) {
    let client = self.inner.client.clone();
    client.ctx().notify.batch(|| {
      let previous = self.get_observers();
      let matches = self.find_matching_observers(&client, queries);
      for (options, observer) in &matches {
        observer.set_options(options.clone());
      }
      let observers: Vec<QueryObserver> = matches.into_iter().map(|(_, observer)| observer).collect();

      let unchanged = previous.len() == observers.len()
        && previous
          .iter()
          .zip(&observers)
          .all(|(a, b)| Arc::ptr_eq(&a.inner, &b.inner));
      if unchanged {
        return;
      }

      {
        let mut state = self.inner.state.lock();
        state.results = observers.iter().map(QueryObserver::get_current_result).collect();
        state.observers = observers.clone();
      }

      if !self.has_listeners() {
        return;
      }
      for observer in previous.iter().filter(|old| !contains(&observers, old)) {
        self.unwatch(observer);
        observer.destroy();
      }
      for observer in observers.iter().filter(|new| !contains(&previous, new)) {
        self.watch(observer);
      }
      self.notify();
    });
  }

  pub fn get_current_result(&self) -> Vec<QueryObserverResult> {
    self.inner.state.lock().results.clone()
  }

  pub fn get_queries(&self) -> Vec<Query> {
    self
      .get_observers()
      .iter()
      .map(QueryObserver::get_current_query)
      .collect()
  }

  pub fn get_observers(&self) -> Vec<QueryObserver> {
    self.inner.state.lock().observers.clone()
  }

  /// The results `queries` would produce right now, without applying them.
  pub fn get_optimistic_result(&self, queries: Vec<QueryOptions>) -> Vec<QueryObserverResult> {
    self
      .find_matching_observers(&self.inner.client, queries)
      .into_iter()
      .map(|(options, observer)| observer.get_optimistic_result(options))
      .collect()
  }

  fn find_matching_observers(
    &self,
    client: &QueryClient,
    queries: Vec<QueryOptions>,
  ) -> Vec<(QueryOptions, QueryObserver)> {
    let previous = self.get_observers();
    let previous_hashes: Vec<String> = previous
      .iter()
      .map(|observer| observer.options().get_query_hash())
      .collect();
    let defaulted: Vec<QueryOptions> = queries
      .into_iter()
      .map(|options| client.default_query_options(options))
      .collect();

    let mut matched: Vec<Option<QueryObserver>> = Vec::with_capacity(defaulted.len());
    let mut used = vec![false; previous.len()];
    for options in &defaulted {
      let hash = options.get_query_hash();
      let found = previous_hashes.iter().position(|h| *h == hash);
      if let Some(index) = found {
        used[index] = true;
      }
      matched.push(found.map(|index| previous[index].clone()));
    }

    // Queries without a match may inherit a leftover observer (to show its
    // previous data) or get a fresh one.
    let leftovers: Vec<&QueryObserver> = previous
      .iter()
      .zip(&used)
      .filter(|(_, used)| !**used)
      .map(|(observer, _)| observer)
      .collect();
    let mut unmatched_index = 0;
    defaulted
      .into_iter()
      .zip(matched)
      .map(|(options, found)| {
        let observer = found.unwrap_or_else(|| {
          let leftover = leftovers
            .get(unmatched_index)
            .filter(|_| options.get_keep_previous_data())
            .map(|observer| (*observer).clone());
          unmatched_index += 1;
          leftover.unwrap_or_else(|| QueryObserver::new(client, options.clone()))
        });
        (options, observer)
      })
      .collect()
  }

  fn watch(&self, observer: &QueryObserver) {
    let weak = Arc::downgrade(&self.inner);
    let member = observer.id();
    let subscription = observer.subscribe(move |result| {
      if let Some(inner) = weak.upgrade() {
        QueriesObserver { inner }.on_update(member, result);
      }
    });
    self.inner.state.lock().subscriptions.push((member, subscription));
  }

  fn unwatch(&self, observer: &QueryObserver) {
    let subscription = {
      let mut state = self.inner.state.lock();
      let index = state.subscriptions.iter().position(|(id, _)| *id == observer.id());
      index.map(|index| state.subscriptions.remove(index).1)
    };
    if let Some(subscription) = subscription {
      subscription.unsubscribe();
    }
  }

  fn on_update(&self, member: u64, result: &QueryObserverResult) {
    {
      let mut state = self.inner.state.lock();
      let Some(index) = state.observers.iter().position(|observer| observer.id() == member) else {
        return;
      };
      state.results[index] = result.clone();
    }
    self.notify();
  }

  // Member updates delivered in one flush coalesce into one notification.
  fn notify(&self) {
    if self.inner.notify_pending.swap(true, Ordering::AcqRel) {
      return;
    }
    let weak: Weak<QueriesInner> = Arc::downgrade(&self.inner);
    self.inner.client.ctx().notify.schedule(move || {
      if let Some(inner) = weak.upgrade() {
        inner.notify_pending.store(false, Ordering::Release);
        let results = inner.state.lock().results.clone();
        for listener in inner.listeners.snapshot() {
          listener(&results);
        }
      }
    });
  }
}

fn contains(observers: &[QueryObserver], observer: &QueryObserver) -> bool {
  observers.iter().any(|o| Arc::ptr_eq(&o.inner, &observer.inner))
}

impl fmt::Debug for QueriesObserver {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.inner.state.lock();
    f.debug_struct("QueriesObserver")
      .field("observers", &state.observers.len())
      .field("listeners", &!self.inner.listeners.is_empty())
      .finish()
  }
}
