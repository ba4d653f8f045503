use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use super::{upgrade, QueryObserver, QueryObserverResult, RefetchOptions};
use crate::client::QueryClient;
use crate::error::Result;
use crate::infinite::{has_next_page, has_previous_page, InfiniteData, InfiniteQueryBehavior};
use crate::listener::Subscription;
use crate::query::{FetchDirection, FetchMeta, FetchMore, FetchOptions, QueryOptions};
use crate::value::Value;

/// A [`QueryObserverResult`] plus the paging state of an infinite query.
#[derive(Debug, Clone)]
pub struct InfiniteQueryObserverResult {
  pub result: QueryObserverResult,
  pub has_next_page: bool,
  pub has_previous_page: bool,
  pub is_fetching_next_page: bool,
  pub is_fetching_previous_page: bool,
}

impl InfiniteQueryObserverResult {
  fn new(result: QueryObserverResult, options: &QueryOptions) -> Self {
    // Paging is decided on the cached pages, never on the selected view.
    let raw = result
      .raw_data
      .as_ref()
      .and_then(|data| InfiniteData::from_value(data).ok());
    let fetching = result.is_fetching();
    Self {
      has_next_page: raw.as_ref().is_some_and(|data| has_next_page(options, data)),
      has_previous_page: raw.as_ref().is_some_and(|data| has_previous_page(options, data)),
      is_fetching_next_page: fetching && result.fetch_direction == Some(FetchDirection::Forward),
      is_fetching_previous_page: fetching && result.fetch_direction == Some(FetchDirection::Backward),
      result,
    }
  }

  /// The pages as shown, when `data` still has the paged shape.
  pub fn pages(&self) -> Option<InfiniteData> {
    self
      .result
      .data
      .as_ref()
      .and_then(|data| InfiniteData::from_value(data).ok())
  }
}

impl Deref for InfiniteQueryObserverResult {
  type Target = QueryObserverResult;

  fn deref(&self) -> &QueryObserverResult {
    &self.result
  }
}

/// Observes a paginated query and fetches further pages on demand.
#[derive(Clone, Debug)]
pub struct InfiniteQueryObserver {
  observer: QueryObserver,
}

impl InfiniteQueryObserver {
  pub fn new(client: &QueryClient, options: QueryOptions) -> Self {
    Self {
      observer: QueryObserver::new(client, paged(options)),
    }
  }

  pub fn set_options(&self, options: QueryOptions) {
    self.observer.set_options(paged(options));
  }

  /// The underlying single-query observer.
  pub fn observer(&self) -> &QueryObserver {
    &self.observer
  }

  pub fn get_current_result(&self) -> InfiniteQueryObserverResult {
    InfiniteQueryObserverResult::new(self.observer.get_current_result(), &self.observer.options())
  }

  pub fn get_optimistic_result(&self, options: QueryOptions) -> InfiniteQueryObserverResult {
    let options = paged(options);
    let result = self.observer.get_optimistic_result(options.clone());
    InfiniteQueryObserverResult::new(result, &options)
  }

  pub fn has_listeners(&self) -> bool {
    self.observer.has_listeners()
  }

  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&InfiniteQueryObserverResult) + Send + Sync + 'static,
  {
    let weak = Arc::downgrade(&self.observer.inner);
    self.observer.subscribe(move |result| {
      if let Some(observer) = upgrade(&weak) {
        listener(&InfiniteQueryObserverResult::new(result.clone(), &observer.options()));
      }
    })
  }

  pub fn destroy(&self) {
    self.observer.destroy();
  }

  /// Appends the next page. `page_param` overrides the computed cursor.
  pub fn fetch_next_page(
    &self,
    page_param: Option<Value>,
  ) -> impl Future<Output = Result<InfiniteQueryObserverResult>> + Send + 'static {
    self.fetch_more(FetchDirection::Forward, page_param)
  }

  /// Prepends the previous page. `page_param` overrides the computed cursor.
  pub fn fetch_previous_page(
    &self,
    page_param: Option<Value>,
  ) -> impl Future<Output = Result<InfiniteQueryObserverResult>> + Send + 'static {
    self.fetch_more(FetchDirection::Backward, page_param)
  }

  pub fn refetch(
    &self,
    options: RefetchOptions,
  ) -> impl Future<Output = Result<InfiniteQueryObserverResult>> + Send + 'static {
    let fetch = self.observer.refetch(options);
    self.wrap(fetch)
  }

  fn fetch_more(
    &self,
    direction: FetchDirection,
    page_param: Option<Value>,
  ) -> impl Future<Output = Result<InfiniteQueryObserverResult>> + Send + 'static {
    let fetch_options = FetchOptions {
      cancel_refetch: true,
      meta: FetchMeta {
        fetch_more: Some(FetchMore { direction, page_param }),
        ..FetchMeta::default()
      },
    };
    let fetch = self.observer.fetch(fetch_options, false);
    self.wrap(fetch)
  }

  fn wrap(
    &self,
    fetch: impl Future<Output = Result<QueryObserverResult>> + Send + 'static,
  ) -> impl Future<Output = Result<InfiniteQueryObserverResult>> + Send + 'static {
    let observer = self.observer.clone();
    async move {
      let result = fetch.await?;
      Ok(InfiniteQueryObserverResult::new(result, &observer.options()))
    }
  }
}

fn paged(options: QueryOptions) -> QueryOptions {
  options.behavior(Arc::new(InfiniteQueryBehavior))
}
