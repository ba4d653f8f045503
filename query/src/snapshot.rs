//! Serializable snapshots of a client's cached data, for carrying state
//! across processes (e.g. server-rendered data handed to a client).

use serde::{Deserialize, Serialize};

use crate::client::QueryClient;
use crate::key::{MutationKey, QueryKey};
use crate::mutation::{MutationOptions, MutationState, MutationStatus};
use crate::query::{FetchStatus, QueryOptions, QueryState, QueryStatus};
use crate::value::Value;

/// The persisted part of a query's state. Only successful data is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQueryState {
  pub data: serde_json::Value,
  pub data_updated_at: u64,
  pub data_update_count: u32,
  pub status: QueryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
  pub query_key: QueryKey,
  pub query_hash: String,
  pub state: DehydratedQueryState,
}

/// A paused mutation waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
  pub mutation_key: Option<MutationKey>,
  pub variables: Option<serde_json::Value>,
  pub context: Option<serde_json::Value>,
  pub failure_count: u32,
  pub status: MutationStatus,
  pub submitted_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedState {
  pub queries: Vec<DehydratedQuery>,
  pub mutations: Vec<DehydratedMutation>,
}

impl QueryClient {
  /// Snapshots successful queries and paused mutations. Entries whose values
  /// have no JSON form (opaque values) are left out.
  pub fn dehydrate(&self) -> DehydratedState {
    let queries = self
      .query_cache()
      .get_all()
      .into_iter()
      .filter_map(|query| {
        let state = query.state();
        if state.status != QueryStatus::Success {
          return None;
        }
        let data = state.data.as_ref()?.to_json().ok()?;
        Some(DehydratedQuery {
          query_key: query.key().clone(),
          query_hash: query.hash().to_owned(),
          state: DehydratedQueryState {
            data,
            data_updated_at: state.data_updated_at,
            data_update_count: state.data_update_count,
            status: state.status,
          },
        })
      })
      .collect();

    let mutations = self
      .mutation_cache()
      .get_all()
      .into_iter()
      .filter_map(|mutation| {
        let state = mutation.state();
        if !state.is_paused {
          return None;
        }
        Some(DehydratedMutation {
          mutation_key: mutation.key(),
          variables: to_json(state.variables.as_ref())?,
          context: to_json(state.context.as_ref())?,
          failure_count: state.failure_count,
          status: state.status,
          submitted_at: state.submitted_at,
        })
      })
      .collect();

    DehydratedState { queries, mutations }
  }

  /// Seeds the caches from a snapshot without fetching. A query that already
  /// holds data at least as new as the snapshot's keeps it.
  pub fn hydrate(&self, snapshot: &DehydratedState) {
    let query_cache = self.query_cache();
    self.ctx().notify.batch(|| {
      for dehydrated in &snapshot.queries {
        let state = QueryState {
          data: Some(Value::from(dehydrated.state.data.clone())),
          data_updated_at: dehydrated.state.data_updated_at,
          data_update_count: dehydrated.state.data_update_count,
          status: dehydrated.state.status,
          ..QueryState::default()
        };
        match query_cache.get(&dehydrated.query_hash) {
          Some(query) => {
            let current = query.state();
            if current.data_updated_at < state.data_updated_at {
              query.set_state(QueryState {
                fetch_status: current.fetch_status,
                ..state
              });
            }
          }
          None => {
            let mut options = QueryOptions::new(dehydrated.query_key.clone());
            options.query_hash = Some(dehydrated.query_hash.clone());
            query_cache.build(
              self,
              options,
              Some(QueryState {
                fetch_status: FetchStatus::Idle,
                ..state
              }),
            );
          }
        }
      }

      let mutation_cache = self.mutation_cache();
      for dehydrated in &snapshot.mutations {
        let mut options = MutationOptions::new();
        options.mutation_key = dehydrated.mutation_key.clone();
        let state = MutationState {
          variables: dehydrated.variables.clone().map(Value::from),
          context: dehydrated.context.clone().map(Value::from),
          failure_count: dehydrated.failure_count,
          status: dehydrated.status,
          submitted_at: dehydrated.submitted_at,
          is_paused: true,
          ..MutationState::default()
        };
        mutation_cache.build(self, options, None, Some(state));
      }
    });
  }
}

// `None` when the value has no JSON form; `Some(None)` when there is no value.
fn to_json(value: Option<&Value>) -> Option<Option<serde_json::Value>> {
  match value {
    Some(value) => value.to_json().ok().map(Some),
    None => Some(None),
  }
}
