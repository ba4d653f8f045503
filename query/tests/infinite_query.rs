mod common;

use std::sync::{
  atomic::{AtomicI64, Ordering},
  Arc,
};

use common::{build_test_client, sleep_ms};
use fibre_query::{
  InfiniteData, InfiniteQueryObserver, InvalidateOptions, QueryFilters, QueryFunctionContext, QueryOptions,
  RefetchOptions, Value,
};

// Pages are `multiplier * (100 + cursor)`, cursors count up from 0.
fn paged_query(key: &str, multiplier: &Arc<AtomicI64>) -> QueryOptions {
  let multiplier = multiplier.clone();
  QueryOptions::new(key)
    .initial_page_param(0)
    .query_fn(move |ctx: QueryFunctionContext| {
      let factor = multiplier.load(Ordering::SeqCst);
      let cursor = ctx.page_param.as_ref().and_then(Value::as_i64).unwrap_or(0);
      async move { Ok(Value::from(factor * (100 + cursor))) }
    })
    .get_next_page_param(|_: &Value, _: &[Value], cursor: &Value, _: &[Value]| {
      cursor.as_i64().map(|cursor| Value::from(cursor + 1))
    })
}

fn values(items: &[i64]) -> Vec<Value> {
  items.iter().copied().map(Value::from).collect()
}

async fn two_pages(observer: &InfiniteQueryObserver) {
  sleep_ms(5).await;
  let result = observer.fetch_next_page(None).await.unwrap();
  let pages = result.pages().unwrap();
  assert_eq!(pages.pages, values(&[100, 101]));
  assert_eq!(pages.page_params, values(&[0, 1]));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_next_page_appends() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));
  let observer = InfiniteQueryObserver::new(&client, paged_query("pages", &multiplier));
  let _subscription = observer.subscribe(|_| {});

  sleep_ms(5).await;
  let result = observer.get_current_result();
  assert_eq!(result.pages().unwrap().pages, values(&[100]));
  assert!(result.has_next_page);
  assert!(!result.has_previous_page);

  two_pages(&observer).await;
  assert!(!observer.get_current_result().is_fetching_next_page);
}

#[tokio::test(start_paused = true)]
async fn test_page_selective_refetch() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));
  let observer = InfiniteQueryObserver::new(&client, paged_query("pages", &multiplier));
  let _subscription = observer.subscribe(|_| {});
  two_pages(&observer).await;

  multiplier.store(2, Ordering::SeqCst);
  let refetch = RefetchOptions::default().refetch_page(|_: &Value, index: usize, _: &[Value]| index == 0);
  client
    .invalidate_queries(&QueryFilters::key("pages"), InvalidateOptions::default().refetch(refetch))
    .await
    .unwrap();

  let pages = observer.get_current_result().pages().unwrap();
  assert_eq!(pages.pages, values(&[200, 101]));
  assert_eq!(pages.page_params, values(&[0, 1]));
}

#[tokio::test(start_paused = true)]
async fn test_full_refetch_reuses_recorded_cursors() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));
  let observer = InfiniteQueryObserver::new(&client, paged_query("pages", &multiplier));
  let _subscription = observer.subscribe(|_| {});
  two_pages(&observer).await;

  multiplier.store(3, Ordering::SeqCst);
  let result = observer.refetch(RefetchOptions::default()).await.unwrap();

  let pages = result.pages().unwrap();
  assert_eq!(pages.pages, values(&[300, 303]));
  assert_eq!(pages.page_params, values(&[0, 1]));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_previous_page_prepends() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));
  let options = paged_query("backwards", &multiplier)
    .initial_page_param(5)
    .get_previous_page_param(|_: &Value, _: &[Value], cursor: &Value, _: &[Value]| {
      cursor.as_i64().filter(|cursor| *cursor > 0).map(|cursor| Value::from(cursor - 1))
    });
  let observer = InfiniteQueryObserver::new(&client, options);
  let _subscription = observer.subscribe(|_| {});
  sleep_ms(5).await;
  assert!(observer.get_current_result().has_previous_page);

  let result = observer.fetch_previous_page(None).await.unwrap();

  let pages = result.pages().unwrap();
  assert_eq!(pages.pages, values(&[104, 105]));
  assert_eq!(pages.page_params, values(&[4, 5]));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cursor_overrides_the_computed_one() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));
  let observer = InfiniteQueryObserver::new(&client, paged_query("jump", &multiplier));
  let _subscription = observer.subscribe(|_| {});
  sleep_ms(5).await;

  let result = observer.fetch_next_page(Some(Value::from(10))).await.unwrap();

  let pages = result.pages().unwrap();
  assert_eq!(pages.pages, values(&[100, 110]));
  assert_eq!(pages.page_params, values(&[0, 10]));
}

#[tokio::test(start_paused = true)]
async fn test_client_fetches_the_first_page() {
  let client = build_test_client();
  let multiplier = Arc::new(AtomicI64::new(1));

  let data = client.fetch_infinite_query(paged_query("direct", &multiplier)).await.unwrap();

  let pages = InfiniteData::from_value(&data).unwrap();
  assert_eq!(pages.pages, values(&[100]));
  assert_eq!(pages.page_params, values(&[0]));
}
