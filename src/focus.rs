//! Application focus tracking and focus-driven refetching.
//!
//! The host runtime reports foreground transitions as [`FocusEvent`]s. Queries
//! subscribe to be refetched when the application regains focus, and
//! observers consult [`FocusCoordinator::is_focused`] to skip re-render work
//! while in the background.

use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Foreground transition reported by the host runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
  Gained,
  Lost,
}

struct Subscriber {
  id: u64,
  active: AtomicBool,
  /// Set once the first focus gain since mounting has been swallowed
  primed: AtomicBool,
  callback: Box<dyn Fn() + Send + Sync>,
}

struct Inner {
  focused: AtomicBool,
  next_id: AtomicU64,
  subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

/// Fans focus-gain edges out to subscribers.
#[derive(Clone)]
pub struct FocusCoordinator {
  inner: Arc<Inner>,
}

impl FocusCoordinator {
  pub fn new(focused: bool) -> Self {
    Self {
      inner: Arc::new(Inner {
        focused: AtomicBool::new(focused),
        next_id: AtomicU64::new(0),
        subscribers: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn is_focused(&self) -> bool {
    self.inner.focused.load(Ordering::SeqCst)
  }

  /// Record a focus transition. Only a change from unfocused to focused
  /// reaches subscribers; repeated events of the same kind are ignored.
  ///
  /// Query refetches are spawned onto the current tokio runtime.
  pub fn notify(&self, event: FocusEvent) {
    let focused = event == FocusEvent::Gained;
    let was_focused = self.inner.focused.swap(focused, Ordering::SeqCst);
    trace!(?event, was_focused, "Focus event");

    if focused && !was_focused {
      self.dispatch_gain();
    }
  }

  fn dispatch_gain(&self) {
    // Snapshot so callbacks can subscribe or unsubscribe without deadlocking
    let subscribers: Vec<Arc<Subscriber>> = self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();

    for subscriber in subscribers {
      if !subscriber.active.load(Ordering::SeqCst) {
        continue;
      }
      if !subscriber.primed.swap(true, Ordering::SeqCst) {
        debug!(id = subscriber.id, "Ignoring first focus gain since mount");
        continue;
      }
      (subscriber.callback)();
    }
  }

  /// Register a callback for focus gains after the first one.
  ///
  /// The callback stops firing once the returned subscription is dropped.
  pub fn subscribe<F>(&self, callback: F) -> FocusSubscription
  where
    F: Fn() + Send + Sync + 'static,
  {
    let subscriber = Arc::new(Subscriber {
      id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
      active: AtomicBool::new(true),
      primed: AtomicBool::new(false),
      callback: Box::new(callback),
    });

    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(subscriber.clone());

    FocusSubscription {
      coordinator: Arc::downgrade(&self.inner),
      subscriber,
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  /// Forward events from a host event stream until it ends.
  pub fn attach<S>(&self, events: S) -> JoinHandle<()>
  where
    S: Stream<Item = FocusEvent> + Send + 'static,
  {
    let coordinator = self.clone();
    tokio::spawn(async move {
      let mut events = std::pin::pin!(events);
      while let Some(event) = events.next().await {
        coordinator.notify(event);
      }
      debug!("Focus event stream ended");
    })
  }
}

impl Default for FocusCoordinator {
  fn default() -> Self {
    Self::new(true)
  }
}

/// Registration returned by [`FocusCoordinator::subscribe`].
pub struct FocusSubscription {
  coordinator: Weak<Inner>,
  subscriber: Arc<Subscriber>,
}

impl FocusSubscription {
  pub fn is_active(&self) -> bool {
    self.subscriber.active.load(Ordering::SeqCst)
  }
}

impl Drop for FocusSubscription {
  fn drop(&mut self) {
    self.subscriber.active.store(false, Ordering::SeqCst);
    if let Some(inner) = self.coordinator.upgrade() {
      let id = self.subscriber.id;
      inner
        .subscribers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|s| s.id != id);
    }
  }
}
