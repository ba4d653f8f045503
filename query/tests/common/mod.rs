#![allow(dead_code)]

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration;

use fibre_query::{Error, QueryClient, QueryFunctionContext, QueryKey, QueryOptions, Value};

// A fresh client with its own focus/online managers, so tests can flip
// connectivity without touching each other.
pub fn build_test_client() -> QueryClient {
  QueryClient::builder().build()
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn incr(&self) -> usize {
    self.0.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

/// Options for `key` whose query function counts calls, waits `delay` and
/// returns `value`.
pub fn counted_query(key: impl Into<QueryKey>, calls: &Counter, delay: Duration, value: &'static str) -> QueryOptions {
  let calls = calls.clone();
  QueryOptions::new(key).query_fn(move |_: QueryFunctionContext| {
    calls.incr();
    async move {
      if !delay.is_zero() {
        tokio::time::sleep(delay).await;
      }
      Ok(Value::from(value))
    }
  })
}

/// Options for `key` whose query function fails on the first `failures`
/// calls and then returns `"data{n}"` where `n` is the call number.
pub fn flaky_query(key: impl Into<QueryKey>, calls: &Counter, failures: usize) -> QueryOptions {
  let calls = calls.clone();
  QueryOptions::new(key).query_fn(move |_: QueryFunctionContext| {
    let call = calls.incr();
    async move {
      if call <= failures {
        Err(Error::msg(format!("failure {call}")))
      } else {
        Ok(Value::from(format!("data{call}")))
      }
    }
  })
}

pub async fn sleep_ms(ms: u64) {
  tokio::time::sleep(Duration::from_millis(ms)).await;
}
