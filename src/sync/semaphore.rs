//! Counting semaphore with strict FIFO hand-off.
//!
//! Permits are handed directly from `release()` to the head of the queue, so a
//! caller arriving later can never overtake one that is already waiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

struct Waiter {
  id: u64,
  tx: oneshot::Sender<Result<()>>,
}

struct State {
  /// Permits currently held
  counter: usize,
  max: usize,
  waiting: VecDeque<Waiter>,
  next_id: u64,
}

impl State {
  /// Hand free capacity to queued waiters, oldest first.
  fn dispatch(&mut self) {
    while self.counter < self.max {
      let Some(waiter) = self.waiting.pop_front() else {
        break;
      };
      if waiter.tx.send(Ok(())).is_ok() {
        self.counter += 1;
      }
    }
  }
}

/// Async counting mutex shared by cloning.
#[derive(Clone)]
pub struct AsyncSemaphore {
  state: Arc<Mutex<State>>,
}

impl AsyncSemaphore {
  /// Create a semaphore allowing `max` concurrent holders.
  pub fn new(max: usize) -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        counter: 0,
        max,
        waiting: VecDeque::new(),
        next_id: 0,
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Wait for a permit.
  ///
  /// Fails with [`CacheError::Purged`] if [`purge`](Self::purge) runs while
  /// this caller is queued. Dropping the returned future gives up the place in
  /// the queue, and returns the permit if one had already been handed over.
  pub async fn acquire(&self) -> Result<()> {
    let (id, rx) = {
      let mut state = self.lock();
      if state.waiting.is_empty() && state.counter < state.max {
        state.counter += 1;
        return Ok(());
      }

      let (tx, rx) = oneshot::channel();
      let id = state.next_id;
      state.next_id += 1;
      state.waiting.push_back(Waiter { id, tx });
      (id, rx)
    };

    let mut pending = PendingAcquire {
      semaphore: self,
      id,
      rx,
      done: false,
    };
    let outcome = (&mut pending.rx).await;
    pending.done = true;

    match outcome {
      Ok(result) => result,
      // The sender only disappears without a value when the queue is torn down
      Err(_) => Err(CacheError::Purged),
    }
  }

  /// Return a permit. Does nothing when no permit is held.
  pub fn release(&self) {
    let mut state = self.lock();
    if state.counter == 0 {
      debug!("release() on a semaphore with no outstanding permits");
      return;
    }
    state.counter -= 1;
    state.dispatch();
  }

  /// Number of permits currently held.
  pub fn count(&self) -> usize {
    self.lock().counter
  }

  pub fn max(&self) -> usize {
    self.lock().max
  }

  /// Number of callers queued for a permit.
  pub fn waiting(&self) -> usize {
    self.lock().waiting.len()
  }

  /// Change capacity. Raising it wakes queued callers into the new headroom;
  /// lowering it never takes permits away from current holders.
  pub fn set_max(&self, max: usize) {
    let mut state = self.lock();
    state.max = max;
    state.dispatch();
  }

  /// Reject every queued caller and reset the permit count.
  ///
  /// Returns how many waiters were discarded.
  pub fn purge(&self) -> usize {
    let mut state = self.lock();
    let waiters: Vec<Waiter> = state.waiting.drain(..).collect();
    state.counter = 0;
    drop(state);

    let discarded = waiters.len();
    for waiter in waiters {
      let _ = waiter.tx.send(Err(CacheError::Purged));
    }
    if discarded > 0 {
      warn!(discarded, "Purged semaphore waiters");
    }
    discarded
  }
}

impl std::fmt::Debug for AsyncSemaphore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.lock();
    f.debug_struct("AsyncSemaphore")
      .field("counter", &state.counter)
      .field("max", &state.max)
      .field("waiting", &state.waiting.len())
      .finish()
  }
}

/// Queue membership of an in-progress `acquire()`.
struct PendingAcquire<'a> {
  semaphore: &'a AsyncSemaphore,
  id: u64,
  rx: oneshot::Receiver<Result<()>>,
  done: bool,
}

impl Drop for PendingAcquire<'_> {
  fn drop(&mut self) {
    if self.done {
      return;
    }

    let mut state = self.semaphore.lock();
    if let Some(pos) = state.waiting.iter().position(|w| w.id == self.id) {
      state.waiting.remove(pos);
      return;
    }
    drop(state);

    // Already dequeued: either purged or granted a permit we will never use
    self.rx.close();
    if let Ok(Ok(())) = self.rx.try_recv() {
      self.semaphore.release();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  async fn wait_for_waiters(sem: &AsyncSemaphore, n: usize) {
    while sem.waiting() < n {
      tokio::task::yield_now().await;
    }
  }

  #[tokio::test]
  async fn test_permits_stay_within_capacity() {
    let sem = AsyncSemaphore::new(2);
    sem.acquire().await.unwrap();
    sem.acquire().await.unwrap();
    assert_eq!(sem.count(), 2);

    let third = tokio::time::timeout(Duration::from_millis(20), sem.acquire()).await;
    assert!(third.is_err(), "third acquire should still be waiting");
    assert_eq!(sem.count(), 2);

    sem.release();
    sem.release();
    assert_eq!(sem.count(), 0);
    sem.release();
    assert_eq!(sem.count(), 0);
  }

  #[tokio::test]
  async fn test_release_hands_permit_to_waiter() {
    let sem = AsyncSemaphore::new(1);
    sem.acquire().await.unwrap();
    assert_eq!(sem.count(), 1);

    let waiter = tokio::spawn({
      let sem = sem.clone();
      async move { sem.acquire().await }
    });
    wait_for_waiters(&sem, 1).await;

    sem.release();
    waiter.await.unwrap().unwrap();
    assert_eq!(sem.count(), 1);
    assert_eq!(sem.waiting(), 0);
  }

  #[tokio::test]
  async fn test_waiters_resolve_in_arrival_order() {
    let sem = AsyncSemaphore::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));
    sem.acquire().await.unwrap();

    let mut handles = Vec::new();
    for name in ["a", "b", "c"] {
      let waiter = sem.clone();
      let order = order.clone();
      handles.push(tokio::spawn(async move {
        waiter.acquire().await.unwrap();
        order.lock().unwrap().push(name);
        waiter.release();
      }));
      wait_for_waiters(&sem, handles.len()).await;
    }

    sem.release();
    for handle in handles {
      handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(sem.count(), 0);
  }

  #[tokio::test]
  async fn test_new_caller_does_not_overtake_queue() {
    let sem = AsyncSemaphore::new(1);
    sem.acquire().await.unwrap();

    let first = tokio::spawn({
      let sem = sem.clone();
      async move { sem.acquire().await }
    });
    wait_for_waiters(&sem, 1).await;

    // Capacity frees up and goes straight to the queued caller
    sem.release();
    let late = tokio::time::timeout(Duration::from_millis(20), sem.acquire()).await;
    assert!(late.is_err());
    first.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_purge_rejects_waiters_and_resets() {
    let sem = AsyncSemaphore::new(1);
    sem.acquire().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
      let sem = sem.clone();
      handles.push(tokio::spawn(async move { sem.acquire().await }));
    }
    wait_for_waiters(&sem, 3).await;

    assert_eq!(sem.purge(), 3);
    assert_eq!(sem.count(), 0);
    for handle in handles {
      assert_eq!(handle.await.unwrap(), Err(CacheError::Purged));
    }

    sem.acquire().await.unwrap();
    assert_eq!(sem.count(), 1);
  }

  #[tokio::test]
  async fn test_set_max_wakes_waiters() {
    let sem = AsyncSemaphore::new(1);
    sem.acquire().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
      let sem = sem.clone();
      handles.push(tokio::spawn(async move { sem.acquire().await }));
    }
    wait_for_waiters(&sem, 2).await;

    sem.set_max(3);
    for handle in handles {
      handle.await.unwrap().unwrap();
    }
    assert_eq!(sem.count(), 3);

    // Lowering capacity keeps existing holders
    sem.set_max(1);
    assert_eq!(sem.count(), 3);
    sem.release();
    sem.release();
    assert_eq!(sem.count(), 1);
    let blocked = tokio::time::timeout(Duration::from_millis(20), sem.acquire()).await;
    assert!(blocked.is_err());
  }

  #[tokio::test]
  async fn test_dropped_acquire_leaves_queue() {
    let sem = AsyncSemaphore::new(1);
    sem.acquire().await.unwrap();

    let timed_out = tokio::time::timeout(Duration::from_millis(10), sem.acquire()).await;
    assert!(timed_out.is_err());
    assert_eq!(sem.waiting(), 0);

    sem.release();
    assert_eq!(sem.count(), 0);
  }
}
