use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// The internal state of a pending outcome.
enum State<T> {
  Pending,
  Settled(T),
}

struct Inner<T> {
  state: State<T>,
  waiters: Vec<Waker>,
}

/// A write-once outcome that any number of tasks can await.
///
/// Every fetch of a query hands out a future backed by the same `Deferred`,
/// so concurrent callers share one execution and observe the same result.
pub(crate) struct Deferred<T> {
  inner: Mutex<Inner<T>>,
}

impl<T: Clone> Deferred<T> {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      inner: Mutex::new(Inner {
        state: State::Pending,
        waiters: Vec::new(),
      }),
    })
  }

  /// Settles the outcome and wakes all waiters. Later calls are ignored.
  /// Returns whether this call settled it.
  pub(crate) fn settle(&self, value: T) -> bool {
    let waiters = {
      let mut inner = self.inner.lock();
      if matches!(inner.state, State::Settled(_)) {
        return false;
      }
      inner.state = State::Settled(value);
      std::mem::take(&mut inner.waiters)
    };
    for waker in waiters {
      waker.wake();
    }
    true
  }

  pub(crate) fn is_settled(&self) -> bool {
    matches!(self.inner.lock().state, State::Settled(_))
  }

  pub(crate) fn wait(self: &Arc<Self>) -> DeferredFuture<T> {
    DeferredFuture {
      deferred: self.clone(),
    }
  }
}

/// A future resolving to the settled value of a [`Deferred`].
///
/// Dropping it never cancels the underlying work.
pub struct DeferredFuture<T> {
  deferred: Arc<Deferred<T>>,
}

impl<T: Clone> Future for DeferredFuture<T> {
  type Output = T;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.deferred.inner.lock();
    match &inner.state {
      State::Settled(value) => Poll::Ready(value.clone()),
      State::Pending => {
        let waker = cx.waker();
        if !inner.waiters.iter().any(|w| w.will_wake(waker)) {
          inner.waiters.push(waker.clone());
        }
        Poll::Pending
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn all_waiters_see_the_first_settlement() {
    let deferred = Deferred::<u32>::new();
    let a = deferred.wait();
    let b = deferred.wait();

    assert!(deferred.settle(1));
    assert!(!deferred.settle(2));
    assert_eq!(a.await, 1);
    assert_eq!(b.await, 1);
    assert!(deferred.is_settled());
  }

  #[tokio::test]
  async fn waiters_are_woken_across_tasks() {
    let deferred = Deferred::<&'static str>::new();
    let waiter = tokio::spawn(deferred.wait());
    tokio::task::yield_now().await;
    deferred.settle("done");
    assert_eq!(waiter.await.unwrap(), "done");
  }
}
