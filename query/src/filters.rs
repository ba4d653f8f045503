//! Predicates selecting queries and mutations for bulk operations.

use std::fmt;
use std::sync::Arc;

use crate::key::{hash_key_with, partial_match_key, MutationKey, QueryKey};
use crate::mutation::{Mutation, MutationStatus};
use crate::query::{FetchStatus, Query, QueryStatus};

/// Which queries, by observation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTypeFilter {
  #[default]
  All,
  /// Observed by at least one enabled observer.
  Active,
  Inactive,
}

/// Selects queries. Every set criterion must hold.
#[derive(Clone, Default)]
pub struct QueryFilters {
  pub query_key: Option<QueryKey>,
  /// Match the key exactly instead of as a prefix. `None` lets the
  /// operation decide.
  pub exact: Option<bool>,
  pub query_type: Option<QueryTypeFilter>,
  pub stale: Option<bool>,
  pub status: Option<QueryStatus>,
  pub fetch_status: Option<FetchStatus>,
  pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl QueryFilters {
  pub fn new() -> Self {
    Self::default()
  }

  /// Matches queries whose key starts with `key`.
  pub fn key(key: impl Into<QueryKey>) -> Self {
    Self {
      query_key: Some(key.into()),
      ..Self::default()
    }
  }

  pub fn exact(mut self, exact: bool) -> Self {
    self.exact = Some(exact);
    self
  }

  pub fn query_type(mut self, query_type: QueryTypeFilter) -> Self {
    self.query_type = Some(query_type);
    self
  }

  pub fn stale(mut self, stale: bool) -> Self {
    self.stale = Some(stale);
    self
  }

  pub fn status(mut self, status: QueryStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
    self.fetch_status = Some(fetch_status);
    self
  }

  pub fn predicate(mut self, f: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(f));
    self
  }

  pub(crate) fn exact_if_unset(mut self, exact: bool) -> Self {
    self.exact.get_or_insert(exact);
    self
  }

  pub(crate) fn query_type_if_unset(mut self, query_type: QueryTypeFilter) -> Self {
    self.query_type.get_or_insert(query_type);
    self
  }

  pub fn matches(&self, query: &Query) -> bool {
    if let Some(key) = &self.query_key {
      if self.exact.unwrap_or(false) {
        let options = query.options();
        if query.hash() != hash_key_with(key, options.query_key_hash_fn.as_ref()) {
          return false;
        }
      } else if !partial_match_key(query.key(), key) {
        return false;
      }
    }

    match self.query_type.unwrap_or_default() {
      QueryTypeFilter::All => {}
      QueryTypeFilter::Active if !query.is_active() => return false,
      QueryTypeFilter::Inactive if query.is_active() => return false,
      _ => {}
    }

    if let Some(stale) = self.stale {
      if query.is_stale() != stale {
        return false;
      }
    }

    let state = query.state();
    if self.status.is_some_and(|status| status != state.status) {
      return false;
    }
    if self.fetch_status.is_some_and(|fetch_status| fetch_status != state.fetch_status) {
      return false;
    }

    self.predicate.as_ref().map_or(true, |predicate| predicate(query))
  }
}

impl fmt::Debug for QueryFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueryFilters")
      .field("query_key", &self.query_key)
      .field("exact", &self.exact)
      .field("query_type", &self.query_type)
      .field("stale", &self.stale)
      .field("status", &self.status)
      .field("fetch_status", &self.fetch_status)
      .field("predicate", &self.predicate.is_some())
      .finish()
  }
}

/// Selects mutations. Every set criterion must hold.
#[derive(Clone, Default)]
pub struct MutationFilters {
  pub mutation_key: Option<MutationKey>,
  pub exact: Option<bool>,
  /// Only mutations that are (or are not) currently pending.
  pub fetching: Option<bool>,
  pub status: Option<MutationStatus>,
  pub predicate: Option<Arc<dyn Fn(&Mutation) -> bool + Send + Sync>>,
}

impl MutationFilters {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn key(key: impl Into<MutationKey>) -> Self {
    Self {
      mutation_key: Some(key.into()),
      ..Self::default()
    }
  }

  pub fn exact(mut self, exact: bool) -> Self {
    self.exact = Some(exact);
    self
  }

  pub fn fetching(mut self, fetching: bool) -> Self {
    self.fetching = Some(fetching);
    self
  }

  pub fn status(mut self, status: MutationStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn predicate(mut self, f: impl Fn(&Mutation) -> bool + Send + Sync + 'static) -> Self {
    self.predicate = Some(Arc::new(f));
    self
  }

  pub(crate) fn exact_if_unset(mut self, exact: bool) -> Self {
    self.exact.get_or_insert(exact);
    self
  }

  pub fn matches(&self, mutation: &Mutation) -> bool {
    if let Some(key) = &self.mutation_key {
      let Some(mutation_key) = mutation.key() else {
        return false;
      };
      if self.exact.unwrap_or(false) {
        if mutation_key.hash() != key.hash() {
          return false;
        }
      } else if !partial_match_key(&mutation_key, key) {
        return false;
      }
    }

    let state = mutation.state();
    if self
      .fetching
      .is_some_and(|fetching| fetching != (state.status == MutationStatus::Pending))
    {
      return false;
    }
    if self.status.is_some_and(|status| status != state.status) {
      return false;
    }

    self.predicate.as_ref().map_or(true, |predicate| predicate(mutation))
  }
}

impl fmt::Debug for MutationFilters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationFilters")
      .field("mutation_key", &self.mutation_key)
      .field("exact", &self.exact)
      .field("fetching", &self.fetching)
      .field("status", &self.status)
      .field("predicate", &self.predicate.is_some())
      .finish()
  }
}
