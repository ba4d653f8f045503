//! An asynchronous query cache: deduplicated fetching, staleness tracking,
//! retries that pause while offline or unfocused, garbage collection of
//! unused entries, and batched change notifications to observers.
//!
//! # Features
//! - **Deduplication**: concurrent fetches of one key share a single run.
//! - **Observers**: live, structurally shared results that refetch on mount,
//!   focus, reconnect and interval.
//! - **Mutations**: optimistic `on_mutate`, ordered callbacks and replay of
//!   mutations paused while offline.
//! - **Infinite queries**: page lists with cursor-driven next/previous pages.
//! - **Persistence**: `dehydrate`/`hydrate` to move cached data across
//!   processes with any `serde` format.

// Public modules that form the API
pub mod builder;
pub mod client;
pub mod connectivity;
pub mod error;
pub mod filters;
pub mod infinite;
pub mod key;
pub mod mutation;
pub mod notify;
pub mod observer;
pub mod query;
pub mod query_cache;
pub mod retryer;
pub mod runtime;
pub mod snapshot;
pub mod structural;
pub mod value;

// Internal, crate-only modules
mod deferred;
mod listener;
mod task;
mod time;

pub use builder::QueryClientBuilder;
pub use client::{DefaultOptions, InvalidateOptions, QueryClient, RefetchType, Updater};
pub use connectivity::{FocusManager, OnlineManager};
pub use deferred::DeferredFuture;
pub use error::{CancelOptions, Error, Result};
pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use infinite::InfiniteData;
pub use key::{MutationKey, QueryKey};
pub use listener::Subscription;
pub use mutation::{
  MutateOptions, Mutation, MutationCache, MutationCacheConfig, MutationCacheEvent, MutationObserver,
  MutationObserverResult, MutationOptions, MutationState, MutationStatus,
};
pub use notify::{NotifyManager, NotifyScheduler};
pub use observer::{
  InfiniteQueryObserver, InfiniteQueryObserverResult, NotifyOptions, QueriesObserver, QueryObserver,
  QueryObserverResult, RefetchOptions,
};
pub use query::{
  FetchStatus, InitialData, PlaceholderData, Query, QueryFunctionContext, QueryOptions, QueryState, QueryStatus,
  RefetchInterval, RefetchOn, RefetchPolicy, SetDataOptions, ThrowOnError,
};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};
pub use retryer::{NetworkMode, Retry, RetryDelay};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use snapshot::DehydratedState;
pub use time::{now_millis, INFINITE};
pub use value::Value;

#[doc(hidden)]
pub mod __private {
  pub use serde_json::json;
}
