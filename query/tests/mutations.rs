mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{build_test_client, sleep_ms, Counter};
use fibre_query::{
  Error, MutateOptions, Mutation, MutationCacheConfig, MutationFilters, MutationObserver, MutationOptions, MutationStatus,
  QueryClient, Value,
};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) {
  log.lock().push(entry.into());
}

fn echo_after(delay: Duration) -> MutationOptions {
  MutationOptions::new().mutation_fn(move |variables: Value| async move {
    tokio::time::sleep(delay).await;
    Ok(variables)
  })
}

#[tokio::test(start_paused = true)]
async fn test_settled_mutation_is_collected_after_cache_time() {
  let client = build_test_client();
  let successes = Counter::new();
  let options = echo_after(Duration::from_millis(20))
    .cache_time(Duration::from_millis(10))
    .on_success({
      let successes = successes.clone();
      move |_: &Value, _: &Value, _: Option<&Value>| {
        successes.incr();
        Ok(())
      }
    });

  let outcome = client.execute_mutation(options, "todo");
  assert_eq!(client.mutation_cache().len(), 1);

  sleep_ms(10).await;
  assert_eq!(client.mutation_cache().len(), 1, "pending mutations are kept");

  assert_eq!(outcome.await.unwrap(), Value::from("todo"));
  sleep_ms(2).await;

  assert!(client.mutation_cache().is_empty(), "cache time ran out while pending");
  assert_eq!(successes.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_settling_keeps_the_running_gc_timer() {
  let client = build_test_client();
  let options = echo_after(Duration::from_millis(20)).cache_time(Duration::from_millis(50));

  assert_eq!(client.execute_mutation(options, "todo").await.unwrap(), Value::from("todo"));
  sleep_ms(25).await;
  assert_eq!(client.mutation_cache().len(), 1, "cache time has not run out yet");

  sleep_ms(10).await;
  assert!(client.mutation_cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_run_in_order() {
  let log: Log = Arc::default();
  let cache_config = MutationCacheConfig::default()
    .on_mutate({
      let log = log.clone();
      move |_: &Value, _: &Mutation| record(&log, "cache:on_mutate")
    })
    .on_success({
      let log = log.clone();
      move |_: &Value, _: &Value, _: Option<&Value>, _: &Mutation| record(&log, "cache:on_success")
    })
    .on_settled({
      let log = log.clone();
      move |_: Option<&Value>, _: Option<&Error>, _: &Value, _: Option<&Value>, _: &Mutation| {
        record(&log, "cache:on_settled")
      }
    });
  let client = QueryClient::builder().mutation_cache_config(cache_config).build();

  let options = echo_after(Duration::from_millis(5))
    .on_mutate({
      let log = log.clone();
      move |_: &Value| {
        record(&log, "on_mutate");
        Ok(Some(Value::from("ctx")))
      }
    })
    .on_success({
      let log = log.clone();
      move |_: &Value, _: &Value, context: Option<&Value>| {
        assert_eq!(context, Some(&Value::from("ctx")));
        record(&log, "on_success");
        Ok(())
      }
    })
    .on_settled({
      let log = log.clone();
      move |_: Option<&Value>, _: Option<&Error>, _: &Value, _: Option<&Value>| {
        record(&log, "on_settled");
        Ok(())
      }
    });
  let observer = MutationObserver::new(&client, options);
  let call = MutateOptions::new()
    .on_success({
      let log = log.clone();
      move |_: &Value, _: &Value, _: Option<&Value>| record(&log, "mutate:on_success")
    })
    .on_settled({
      let log = log.clone();
      move |_: Option<&Value>, _: Option<&Error>, _: &Value, _: Option<&Value>| record(&log, "mutate:on_settled")
    });

  let outcome = observer.mutate("x", call);
  assert_eq!(*log.lock(), vec!["cache:on_mutate", "on_mutate"], "the prelude runs before mutate returns");

  outcome.await.unwrap();
  assert_eq!(
    *log.lock(),
    vec![
      "cache:on_mutate",
      "on_mutate",
      "cache:on_success",
      "on_success",
      "cache:on_settled",
      "on_settled",
      "mutate:on_success",
      "mutate:on_settled",
    ]
  );
  let result = observer.get_current_result();
  assert_eq!(result.status, MutationStatus::Success);
  assert_eq!(result.data, Some(Value::from("x")));
  assert_eq!(result.context, Some(Value::from("ctx")));
}

#[tokio::test(start_paused = true)]
async fn test_failing_callback_fails_the_mutation() {
  let client = build_test_client();
  let options = echo_after(Duration::ZERO).on_success(|_: &Value, _: &Value, _: Option<&Value>| Err(Error::msg("rejected")));

  let outcome = client.execute_mutation(options, 1).await;

  assert!(outcome.is_err());
  let mutation = client.mutation_cache().find(&MutationFilters::new()).unwrap();
  assert_eq!(mutation.state().status, MutationStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_reports_error_to_the_observer() {
  let client = build_test_client();
  let errors = Counter::new();
  let options = MutationOptions::new().mutation_fn(|_: Value| async { Err::<Value, _>(Error::msg("nope")) });
  let observer = MutationObserver::new(&client, options);

  let call = MutateOptions::new().on_error({
    let errors = errors.clone();
    move |_: &Error, _: &Value, _: Option<&Value>| {
      errors.incr();
    }
  });
  let outcome = observer.mutate("x", call).await;

  assert!(outcome.is_err());
  assert_eq!(errors.get(), 1);
  let result = observer.get_current_result();
  assert!(result.is_error());
  assert!(result.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_missing_mutation_fn_is_an_error() {
  let client = build_test_client();

  let outcome = client.execute_mutation(MutationOptions::new(), "x").await;

  assert!(matches!(outcome, Err(Error::MissingMutationFn)));
}

#[tokio::test(start_paused = true)]
async fn test_offline_mutation_pauses_after_its_prelude() {
  let client = build_test_client();
  client.mount();
  client.online_manager().set_online(Some(false));

  let calls = Counter::new();
  let options = MutationOptions::new()
    .mutation_fn({
      let calls = calls.clone();
      move |variables: Value| {
        calls.incr();
        async move { Ok(variables) }
      }
    })
    .on_mutate(|_: &Value| Ok(Some(Value::from("optimistic"))));
  let observer = MutationObserver::new(&client, options);
  let handle = tokio::spawn(observer.mutate("offline", MutateOptions::new()));

  sleep_ms(10).await;
  let result = observer.get_current_result();
  assert_eq!(result.status, MutationStatus::Pending);
  assert!(result.is_paused);
  assert_eq!(result.context, Some(Value::from("optimistic")));
  assert_eq!(calls.get(), 0);

  client.online_manager().set_online(Some(true));
  let value = handle.await.unwrap().unwrap();

  assert_eq!(value, Value::from("offline"));
  assert_eq!(calls.get(), 1);
  assert!(!observer.get_current_result().is_paused);
}

#[tokio::test(start_paused = true)]
async fn test_is_mutating_counts_pending_mutations() {
  let client = build_test_client();
  let options = echo_after(Duration::from_millis(10)).mutation_key("save");

  let first = client.execute_mutation(options.clone(), 1);
  let second = client.execute_mutation(options, 2);
  assert_eq!(client.is_mutating(&MutationFilters::new()), 2);
  assert_eq!(client.is_mutating(&MutationFilters::key("other")), 0);

  first.await.unwrap();
  second.await.unwrap();
  assert_eq!(client.is_mutating(&MutationFilters::new()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_mutation_defaults_apply_by_key() {
  let client = build_test_client();
  client.set_mutation_defaults("save", echo_after(Duration::ZERO));

  let outcome = client.execute_mutation(MutationOptions::new().mutation_key("save"), "stored").await;

  assert_eq!(outcome.unwrap(), Value::from("stored"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_returns_the_observer_to_idle() {
  let client = build_test_client();
  let observer = MutationObserver::new(&client, echo_after(Duration::ZERO));

  observer.mutate("x", MutateOptions::new()).await.unwrap();
  assert!(observer.get_current_result().is_success());

  observer.reset();
  assert!(observer.get_current_result().is_idle());
  assert!(observer.get_current_mutation().is_none());
}
