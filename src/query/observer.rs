//! Per-surface query handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::cache::{Fetcher, Interest, QueryCache, QueryData};
use super::key::QueryKey;
use super::state::{QueryOptions, QueryState, QueryStatus};
use crate::error::CacheError;
use crate::focus::FocusSubscription;

/// A mounted query, owned by the UI surface that displays it.
///
/// Dropping the observer unmounts it: its focus subscription ends and, if it
/// was the last party waiting on an in-flight fetch, that fetch is cancelled.
pub struct QueryObserver<T: QueryData> {
  cache: QueryCache,
  key: QueryKey,
  fetcher: Fetcher<T>,
  options: QueryOptions,
  state: QueryState<T>,
  changes: watch::Receiver<u64>,
  enabled: Arc<AtomicBool>,
  pending: Option<Interest>,
  _focus: Option<FocusSubscription>,
}

impl<T: QueryData> QueryObserver<T> {
  pub(crate) fn mount(
    cache: QueryCache,
    key: QueryKey,
    fetcher: Fetcher<T>,
    options: QueryOptions,
  ) -> Self {
    let changes = cache.subscribe(&key);
    let enabled = Arc::new(AtomicBool::new(options.enabled));

    let focus = if options.refetch_on_focus {
      cache.focus().map(|focus| {
        let cache = cache.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        let enabled = enabled.clone();
        focus.subscribe(move || {
          if enabled.load(Ordering::SeqCst) {
            cache.refetch_detached(&key, &fetcher);
          }
        })
      })
    } else {
      None
    };

    let mut observer = Self {
      cache,
      key,
      fetcher,
      options,
      state: QueryState::idle(),
      changes,
      enabled,
      pending: None,
      _focus: focus,
    };

    if observer.is_enabled()
      && observer
        .cache
        .should_fetch(&observer.key, observer.options.stale_time)
    {
      observer.fetch();
    }
    observer.refresh();
    observer
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// The state as of the last [`poll`](Self::poll) or refresh.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn status(&self) -> QueryStatus {
    self.state.status
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.state.error()
  }

  pub fn is_fetching(&self) -> bool {
    self.state.is_fetching
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Enable or disable the query. Enabling fetches if the cached data is
  /// missing or stale.
  pub fn set_enabled(&mut self, enabled: bool) {
    let was_enabled = self.enabled.swap(enabled, Ordering::SeqCst);
    if enabled
      && !was_enabled
      && self.cache.should_fetch(&self.key, self.options.stale_time)
    {
      self.fetch();
      self.refresh();
    }
  }

  /// Fetch now, joining any fetch already in flight for this key.
  pub fn refetch(&mut self) {
    self.fetch();
    self.refresh();
  }

  fn fetch(&mut self) {
    // Assign before dropping the old interest so the shared fetch is never
    // left without an observer in between
    let interest = self.cache.start_fetch(&self.key, &self.fetcher);
    self.pending = Some(interest);
  }

  /// Pick up cache changes.
  ///
  /// Returns `true` if the state changed. While the application is
  /// unfocused this reports no change and leaves the update pending until
  /// focus returns.
  pub fn poll(&mut self) -> bool {
    match self.changes.has_changed() {
      Ok(true) => {}
      Ok(false) => return false,
      Err(_) => {
        // Entry was reset; follow the replacement
        self.changes = self.cache.subscribe(&self.key);
      }
    }

    if let Some(focus) = self.cache.focus() {
      if !focus.is_focused() {
        return false;
      }
    }

    self.refresh();
    true
  }

  /// Wait until no fetch is in flight for this key and return the state.
  pub async fn wait_settled(&mut self) -> &QueryState<T> {
    loop {
      self.refresh();
      if !self.state.is_fetching {
        return &self.state;
      }
      if self.changes.changed().await.is_err() {
        self.changes = self.cache.subscribe(&self.key);
      }
    }
  }

  fn refresh(&mut self) {
    self.changes.borrow_and_update();

    if self.is_enabled() && self.cache.awaiting_refetch(&self.key) {
      self.fetch();
    }

    if let Some(pending) = &self.pending {
      if self.cache.in_flight_id(&self.key) != Some(pending.id()) {
        if let Some(done) = self.pending.take() {
          done.settle();
        }
      }
    }

    self.state = self.cache.state(&self.key);
  }
}

impl<T: QueryData + std::fmt::Debug> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("enabled", &self.is_enabled())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::DurablePersister;
  use crate::db::MemoryStore;
  use crate::focus::{FocusCoordinator, FocusEvent};
  use crate::query::{PersistedRecord, QueryCacheConfig};
  use chrono::Utc;
  use serde_json::json;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;
  use tokio::sync::Notify;
  use tokio_util::sync::CancellationToken;

  fn cache_with_focus(focus: &FocusCoordinator) -> (QueryCache, Arc<DurablePersister>) {
    let persister = Arc::new(DurablePersister::new(
      Arc::new(MemoryStore::new()),
      "queryClient",
      1,
    ));
    let cache = QueryCache::new(
      Some(persister.clone()),
      QueryCacheConfig::default().with_known(["notes"]),
    )
    .with_focus(focus.clone());
    (cache, persister)
  }

  fn counting_fetcher(
    calls: &Arc<AtomicU32>,
  ) -> impl Fn(CancellationToken) -> futures::future::Ready<Result<u32, String>> + Send + Sync + 'static
  {
    let calls = calls.clone();
    move |_| futures::future::ready(Ok(calls.fetch_add(1, Ordering::SeqCst) + 1))
  }

  #[tokio::test]
  async fn test_mount_fetches_and_settles() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));

    let mut observer = cache.query(
      QueryKey::simple("chats"),
      counting_fetcher(&calls),
      QueryOptions::default(),
    );
    assert_eq!(observer.status(), QueryStatus::Pending);
    assert!(observer.is_fetching());

    let state = observer.wait_settled().await;
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data, Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_persisted_record_is_served_before_fetch_resolves() {
    let focus = FocusCoordinator::new(true);
    let (cache, persister) = cache_with_focus(&focus);
    let key = QueryKey::simple("notes");
    persister
      .set(
        key.cache_key(),
        &PersistedRecord {
          data: json!(["from disk"]),
          timestamp: Utc::now().timestamp_millis() - 600_000,
        },
      )
      .unwrap();
    cache.restore().unwrap();

    let gate = Arc::new(Notify::new());
    let fetcher = {
      let gate = gate.clone();
      move |_| {
        let gate = gate.clone();
        async move {
          gate.notified().await;
          Ok::<_, String>(vec!["from network".to_string()])
        }
      }
    };

    let mut observer = cache.query(key, fetcher, QueryOptions::default());
    assert_eq!(observer.data(), Some(&vec!["from disk".to_string()]));
    assert_eq!(observer.status(), QueryStatus::Success);
    assert!(observer.is_fetching());

    gate.notify_one();
    let state = observer.wait_settled().await;
    assert_eq!(state.data, Some(vec!["from network".to_string()]));
  }

  #[tokio::test]
  async fn test_fresh_cache_does_not_fetch_on_mount() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::simple("chats");
    cache.set_query_data(&key, 7u32);

    let observer = cache.query(key, counting_fetcher(&calls), QueryOptions::default());
    assert_eq!(observer.data(), Some(&7));
    assert!(!observer.is_fetching());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_disabled_query_never_fetches_until_enabled() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));

    let mut observer = cache.query(
      QueryKey::simple("chats"),
      counting_fetcher(&calls),
      QueryOptions::default().enabled(false),
    );
    assert_eq!(observer.status(), QueryStatus::Idle);

    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    observer.set_enabled(true);
    assert_eq!(observer.wait_settled().await.data, Some(1));
  }

  #[tokio::test]
  async fn test_focus_refetch_skips_first_gain() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));

    let mut observer = cache.query(
      QueryKey::simple("chats"),
      counting_fetcher(&calls),
      QueryOptions::default(),
    );
    observer.wait_settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    observer.wait_settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    while calls.load(Ordering::SeqCst) < 2 {
      tokio::task::yield_now().await;
    }
    assert_eq!(observer.wait_settled().await.data, Some(2));
  }

  #[tokio::test]
  async fn test_failing_focus_refetch_keeps_error_state() {
    let focus = FocusCoordinator::new(true);
    let (cache, persister) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));
    let fetcher = {
      let calls = calls.clone();
      move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Err::<u32, _>("offline"))
      }
    };

    let mut observer = cache.query(QueryKey::simple("chats"), fetcher, QueryOptions::default());
    assert_eq!(observer.wait_settled().await.status, QueryStatus::Error);

    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    focus.notify(FocusEvent::Lost);
    focus.notify(FocusEvent::Gained);
    while calls.load(Ordering::SeqCst) < 2 {
      tokio::task::yield_now().await;
    }

    let state = observer.wait_settled().await;
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.data.is_none());
    assert_eq!(observer.error(), Some(&CacheError::FetchFailed("offline".into())));
    assert!(persister.keys().unwrap().is_empty());

    // The failed background refetch leaves the rest of the cache usable
    let notes = QueryKey::simple("notes");
    cache.set_query_data(&notes, vec!["still here".to_string()]);
    assert_eq!(cache.get::<Vec<String>>(&notes), Some(vec!["still here".to_string()]));
  }

  #[tokio::test]
  async fn test_remount_after_unmount_fetches_again() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::simple("chats");

    let first = cache.query(key.clone(), counting_fetcher(&calls), QueryOptions::default());
    assert!(first.is_fetching());
    drop(first);

    let mut second = cache.query(key.clone(), counting_fetcher(&calls), QueryOptions::default());
    let state = second.wait_settled().await;
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data, Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get::<u32>(&key), Some(2));
  }

  #[tokio::test]
  async fn test_unfocused_poll_reports_nothing_changed() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let key = QueryKey::simple("chats");
    let calls = Arc::new(AtomicU32::new(0));

    let mut observer = cache.query(
      key.clone(),
      counting_fetcher(&calls),
      QueryOptions::default().refetch_on_focus(false),
    );
    observer.wait_settled().await;

    focus.notify(FocusEvent::Lost);
    cache.set_query_data(&key, 99u32);
    assert!(!observer.poll());
    assert_eq!(observer.data(), Some(&1));
    // The cache itself is up to date
    assert_eq!(cache.get::<u32>(&key), Some(99));

    focus.notify(FocusEvent::Gained);
    assert!(observer.poll());
    assert_eq!(observer.data(), Some(&99));
    assert!(!observer.poll());
  }

  #[tokio::test]
  async fn test_unmount_cancels_fetch() {
    let focus = FocusCoordinator::new(true);
    let (cache, persister) = cache_with_focus(&focus);
    let key = QueryKey::simple("notes");
    let cancelled = Arc::new(AtomicBool::new(false));

    let fetcher = {
      let cancelled = cancelled.clone();
      move |token: CancellationToken| {
        let cancelled = cancelled.clone();
        async move {
          token.cancelled().await;
          cancelled.store(true, Ordering::SeqCst);
          Err::<Vec<String>, _>("aborted")
        }
      }
    };

    let observer = cache.query(key.clone(), fetcher, QueryOptions::default());
    assert!(observer.is_fetching());
    drop(observer);

    while cache.in_flight_id(&key).is_some() {
      tokio::task::yield_now().await;
    }
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(cache.state::<Vec<String>>(&key).status, QueryStatus::Idle);
    assert!(persister.keys().unwrap().is_empty());
    assert_eq!(focus.subscriber_count(), 0);
  }

  #[tokio::test]
  async fn test_second_observer_keeps_fetch_alive() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let key = QueryKey::simple("chats");
    let gate = Arc::new(Notify::new());
    let fetcher = {
      let gate = gate.clone();
      move |_| {
        let gate = gate.clone();
        async move {
          gate.notified().await;
          Ok::<_, String>(5u32)
        }
      }
    };

    let first = cache.query(key.clone(), fetcher.clone(), QueryOptions::default());
    let mut second = cache.query(key.clone(), fetcher, QueryOptions::default());
    drop(first);
    gate.notify_one();

    assert_eq!(second.wait_settled().await.data, Some(5));
  }

  #[tokio::test]
  async fn test_invalidate_refetches_on_poll() {
    let focus = FocusCoordinator::new(true);
    let (cache, _) = cache_with_focus(&focus);
    let calls = Arc::new(AtomicU32::new(0));
    let key = QueryKey::simple("chats");

    let mut observer = cache.query(
      key.clone(),
      counting_fetcher(&calls),
      QueryOptions::default().with_stale_time(Duration::from_secs(3600)),
    );
    observer.wait_settled().await;

    cache.invalidate(&key);
    assert!(observer.poll());
    assert!(observer.is_fetching());
    assert_eq!(observer.wait_settled().await.data, Some(2));
  }
}
