mod common;

use std::sync::{
  atomic::{AtomicBool, AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;

use common::{build_test_client, counted_query, flaky_query, sleep_ms, Counter};
use fibre_query::query::FetchOptions;
use fibre_query::{
  CancelOptions, Error, FetchStatus, NetworkMode, QueryFilters, QueryFunctionContext, QueryObserver, QueryOptions,
  QueryStatus, RefetchOptions, RetryDelay, Value,
};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_run() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = counted_query("todos", &calls, Duration::from_millis(10), "done");

  let (first, second) = tokio::join!(
    client.fetch_query(options.clone()),
    client.fetch_query(options)
  );

  assert_eq!(first.unwrap(), Value::from("done"));
  assert_eq!(second.unwrap(), Value::from("done"));
  assert_eq!(calls.get(), 1, "the query function should run once");
}

#[tokio::test(start_paused = true)]
async fn test_fresh_data_is_served_from_cache() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = counted_query("todos", &calls, Duration::ZERO, "done").stale_time(Duration::from_secs(60));

  client.fetch_query(options.clone()).await.unwrap();
  let value = client.fetch_query(options).await.unwrap();

  assert_eq!(value, Value::from("done"));
  assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = flaky_query("flaky", &calls, 3)
    .retry(3u32)
    .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)));

  let value = client.fetch_query(options).await.unwrap();

  assert_eq!(value, Value::from("data4"));
  assert_eq!(calls.get(), 4);
  let state = client.get_query_state("flaky").unwrap();
  assert_eq!(state.status, QueryStatus::Success);
  assert_eq!(state.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_report_the_last_error() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = flaky_query("broken", &calls, 10)
    .retry(2u32)
    .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)));

  let outcome = client.fetch_query(options).await;

  assert!(outcome.is_err());
  assert_eq!(calls.get(), 3);
  let state = client.get_query_state("broken").unwrap();
  assert_eq!(state.status, QueryStatus::Error);
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert!(state.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_query_does_not_retry_by_default() {
  let client = build_test_client();
  let calls = Counter::new();

  let outcome = client.fetch_query(flaky_query("once", &calls, 1)).await;

  assert!(outcome.is_err());
  assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_pauses_while_unfocused() {
  let client = build_test_client();
  client.mount();
  client.focus_manager().set_focused(Some(false));

  let calls = Counter::new();
  let options = flaky_query("focus", &calls, 2)
    .retry(3u32)
    .retry_delay(RetryDelay::Fixed(Duration::from_millis(1)));
  let handle = tokio::spawn(client.fetch_query(options));

  sleep_ms(50).await;
  assert!(!handle.is_finished(), "the fetch should wait for focus");
  assert_eq!(calls.get(), 1);
  assert_eq!(client.get_query_state("focus").unwrap().fetch_status, FetchStatus::Paused);

  client.focus_manager().set_focused(Some(true));
  let value = handle.await.unwrap().unwrap();

  assert_eq!(value, Value::from("data3"));
  assert_eq!(calls.get(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_offline_fetch_waits_for_connectivity() {
  let client = build_test_client();
  client.mount();
  client.online_manager().set_online(Some(false));

  let calls = Counter::new();
  let handle = tokio::spawn(client.fetch_query(counted_query("offline", &calls, Duration::ZERO, "back")));

  sleep_ms(10).await;
  assert_eq!(calls.get(), 0);
  assert_eq!(client.get_query_state("offline").unwrap().fetch_status, FetchStatus::Paused);

  client.online_manager().set_online(Some(true));
  let value = handle.await.unwrap().unwrap();

  assert_eq!(value, Value::from("back"));
  assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_always_network_mode_ignores_connectivity() {
  let client = build_test_client();
  client.online_manager().set_online(Some(false));

  let calls = Counter::new();
  let options = counted_query("always", &calls, Duration::ZERO, "anyway").network_mode(NetworkMode::Always);
  let value = client.fetch_query(options).await.unwrap();

  assert_eq!(value, Value::from("anyway"));
  assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unused_query_is_collected_after_cache_time() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = counted_query("gc", &calls, Duration::from_millis(5), "soon gone").cache_time(Duration::ZERO);

  client.fetch_query(options).await.unwrap();
  sleep_ms(10).await;

  assert!(client.query_cache().is_empty());
  assert!(client.get_query_data("gc").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_set_query_data_creates_and_ignores_none() {
  let client = build_test_client();

  let stored = client.set_query_data("greeting", Value::from("bar"));
  assert_eq!(stored, Some(Value::from("bar")));
  let state = client.get_query_state("greeting").unwrap();
  assert_eq!(state.status, QueryStatus::Success);
  assert_eq!(state.data, Some(Value::from("bar")));

  let stored = client.set_query_data("greeting", None::<Value>);
  assert!(stored.is_none());
  assert_eq!(client.get_query_data("greeting"), Some(Value::from("bar")));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_to_the_state_before_the_fetch() {
  let client = build_test_client();
  client.set_query_data("slow", Value::from("old"));

  let calls = Counter::new();
  let options = counted_query("slow", &calls, Duration::from_millis(100), "new");
  let fetch = client.query_cache().find(&QueryFilters::key("slow")).unwrap().fetch(Some(options), Default::default());
  let handle = tokio::spawn(fetch);

  sleep_ms(10).await;
  client.cancel_queries(&QueryFilters::key("slow"), CancelOptions::default()).await;

  let outcome = handle.await.unwrap();
  assert!(outcome.unwrap_err().is_cancelled());
  let state = client.get_query_state("slow").unwrap();
  assert_eq!(state.data, Some(Value::from("old")));
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(state.status, QueryStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_started_from_a_listener_never_runs_twice() {
  let client = build_test_client();
  let calls = Counter::new();
  let in_flight = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let options = QueryOptions::new("reentrant").query_fn({
    let (calls, in_flight, peak) = (calls.clone(), in_flight.clone(), peak.clone());
    move |_: QueryFunctionContext| {
      calls.incr();
      let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(running, Ordering::SeqCst);
      let in_flight = in_flight.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::from("v"))
      }
    }
  });
  let observer = QueryObserver::new(&client, options);
  let _subscription = observer.subscribe(|_| {});
  sleep_ms(20).await;
  assert_eq!(calls.get(), 1);

  let fired = Arc::new(AtomicBool::new(false));
  let _refetcher = observer.subscribe({
    let (observer, fired) = (observer.clone(), fired.clone());
    move |result| {
      if result.fetch_status == FetchStatus::Fetching && !fired.swap(true, Ordering::SeqCst) {
        drop(observer.refetch(RefetchOptions::default()));
      }
    }
  });
  let query = observer.get_current_query();
  drop(query.fetch(None, FetchOptions::default()));
  sleep_ms(30).await;

  assert!(fired.load(Ordering::SeqCst));
  assert_eq!(peak.load(Ordering::SeqCst), 1, "one run at a time per query");
  assert_eq!(calls.get(), 2);
  let state = query.state();
  assert_eq!(state.fetch_status, FetchStatus::Idle);
  assert_eq!(state.data, Some(Value::from("v")));
  observer.destroy();
}

#[tokio::test(start_paused = true)]
async fn test_query_is_not_collected_while_fetching() {
  let client = build_test_client();
  let calls = Counter::new();
  let options = counted_query("busy", &calls, Duration::from_millis(30), "late").cache_time(Duration::from_millis(7));

  let handle = tokio::spawn(client.fetch_query(options));
  sleep_ms(20).await;

  assert_eq!(client.query_cache().len(), 1, "cache time elapsed but the fetch is running");
  assert_eq!(client.get_query_state("busy").unwrap().fetch_status, FetchStatus::Fetching);

  assert_eq!(handle.await.unwrap().unwrap(), Value::from("late"));
  assert_eq!(client.query_cache().len(), 1);
  sleep_ms(10).await;
  assert!(client.query_cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_query_fn_is_reported() {
  let client = build_test_client();

  let outcome = client.fetch_query(QueryOptions::new("nofn")).await;

  let error = outcome.unwrap_err();
  assert!(matches!(&error, Error::MissingQueryFn { query_hash } if query_hash.contains("nofn")));
  assert!(error.to_string().starts_with("missing query function"));
  let state = client.get_query_state("nofn").unwrap();
  assert_eq!(state.status, QueryStatus::Error);
  assert!(matches!(state.error, Some(Error::MissingQueryFn { .. })));
}
