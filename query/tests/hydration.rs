mod common;

use std::time::Duration;

use common::{build_test_client, flaky_query, sleep_ms, Counter};
use fibre_query::{DehydratedState, FetchStatus, MutationOptions, MutationStatus, QueryStatus, Value};

#[tokio::test(start_paused = true)]
async fn test_snapshot_round_trips_through_json() {
  let source = build_test_client();
  source.set_query_data(["todos", "1"], Value::from_serialize(&serde_json::json!({"title": "write docs"})).unwrap());
  let calls = Counter::new();
  let _ = source.fetch_query(flaky_query("broken", &calls, 1)).await;

  let snapshot = source.dehydrate();
  assert_eq!(snapshot.queries.len(), 1, "only successful queries are kept");
  let json = serde_json::to_string(&snapshot).unwrap();
  let restored: DehydratedState = serde_json::from_str(&json).unwrap();
  assert_eq!(restored, snapshot);

  let target = build_test_client();
  target.hydrate(&restored);

  let state = target.get_query_state(["todos", "1"]).unwrap();
  assert_eq!(state.status, QueryStatus::Success);
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(state.data_updated_at, snapshot.queries[0].state.data_updated_at);
  let title = state.data.as_ref().and_then(|data| data.get("title")).and_then(Value::as_str);
  assert_eq!(title, Some("write docs"));
  assert!(target.get_query_state("broken").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hydrate_keeps_newer_local_data() {
  let source = build_test_client();
  source.set_query_data("shared", Value::from("old"));
  let snapshot = source.dehydrate();

  sleep_ms(10).await;
  let target = build_test_client();
  target.set_query_data("shared", Value::from("new"));
  target.hydrate(&snapshot);

  assert_eq!(target.get_query_data("shared"), Some(Value::from("new")));
}

#[tokio::test(start_paused = true)]
async fn test_hydrate_replaces_older_local_data() {
  let target = build_test_client();
  target.set_query_data("shared", Value::from("old"));

  sleep_ms(10).await;
  let source = build_test_client();
  source.set_query_data("shared", Value::from("new"));
  target.hydrate(&source.dehydrate());

  assert_eq!(target.get_query_data("shared"), Some(Value::from("new")));
}

#[tokio::test(start_paused = true)]
async fn test_opaque_values_are_not_dehydrated() {
  let client = build_test_client();
  client.set_query_data("opaque", Value::opaque(42u8));
  client.set_query_data("plain", Value::from(42));

  let snapshot = client.dehydrate();

  assert_eq!(snapshot.queries.len(), 1);
  assert_eq!(snapshot.queries[0].query_hash, client.query_cache().get_all()[1].hash());
}

#[tokio::test(start_paused = true)]
async fn test_paused_mutations_resume_after_hydration() {
  let source = build_test_client();
  source.online_manager().set_online(Some(false));
  let write = |variables: Value| async move { Ok(variables) };
  let pending = source.execute_mutation(MutationOptions::new().mutation_key("save").mutation_fn(write), "payload");
  sleep_ms(5).await;

  let snapshot = source.dehydrate();
  assert_eq!(snapshot.mutations.len(), 1);
  assert_eq!(snapshot.mutations[0].status, MutationStatus::Pending);
  drop(pending);

  let target = build_test_client();
  target.set_mutation_defaults("save", MutationOptions::new().mutation_fn(write));
  target.hydrate(&snapshot);
  let mutation = target.mutation_cache().get_all().remove(0);
  assert!(mutation.state().is_paused);

  target.resume_paused_mutations().await;

  let state = mutation.state();
  assert_eq!(state.status, MutationStatus::Success);
  assert_eq!(state.data, Some(Value::from("payload")));
  assert!(!state.is_paused);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_carries_fetched_data() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = flaky_query("later", &calls, 0).stale_time(Duration::from_secs(60));
  client.fetch_query(options).await.unwrap();

  let snapshot = client.dehydrate();

  assert_eq!(snapshot.queries[0].state.data, serde_json::json!("data1"));
  assert_eq!(snapshot.queries[0].state.data_update_count, 1);
}
