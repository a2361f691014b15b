//! Canonical-key query store with de-duplicated fetching.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::key::QueryKey;
use super::observer::QueryObserver;
use super::state::{Mutation, QueryOptions, QueryState, QueryStatus};
use crate::cache::DurablePersister;
use crate::error::{CacheError, Result};
use crate::focus::FocusCoordinator;

/// Bound for values a query can hold.
pub trait QueryData: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> QueryData for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

type AnyData = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<AnyData>>>;

/// Envelope written to the persister for every cached query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
  pub data: Value,
  /// When the data was fetched or mutated, unix millis
  pub timestamp: i64,
}

/// Type-erased fetch function for one query.
///
/// The fetcher receives a cancellation token that fires once nobody is
/// waiting for the result any more.
pub struct Fetcher<T>(
  Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, std::result::Result<T, String>> + Send + Sync>,
);

impl<T> Clone for Fetcher<T> {
  fn clone(&self) -> Self {
    Self(Arc::clone(&self.0))
  }
}

impl<T: QueryData> Fetcher<T> {
  pub fn new<F, Fut, E>(f: F) -> Self
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Display,
  {
    Self(Arc::new(move |token| {
      let fut = f(token);
      async move { fut.await.map_err(|e| e.to_string()) }.boxed()
    }))
  }
}

#[derive(Clone)]
enum Slot {
  Typed(AnyData),
  /// Loaded from persistence; decoded on read until a fetch or mutation
  /// replaces it
  Restored(Value),
}

impl Slot {
  fn decode<T: QueryData>(&self, key: &str) -> Option<T> {
    match self {
      Slot::Typed(data) => {
        let value = data.downcast_ref::<T>().cloned();
        if value.is_none() {
          warn!(key, "Cached query data has a different type than requested");
        }
        value
      }
      Slot::Restored(value) => match serde_json::from_value(value.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
          warn!(key, error = %e, "Restored query data does not match requested type");
          None
        }
      },
    }
  }
}

struct InFlight {
  id: u64,
  token: CancellationToken,
  interest: Arc<AtomicUsize>,
  result: SharedFetch,
}

struct Entry {
  data: Option<Slot>,
  updated_at: Option<DateTime<Utc>>,
  error: Option<CacheError>,
  invalidated: bool,
  in_flight: Option<InFlight>,
  changes: watch::Sender<u64>,
}

impl Entry {
  fn new() -> Self {
    Self {
      data: None,
      updated_at: None,
      error: None,
      invalidated: false,
      in_flight: None,
      changes: watch::channel(0).0,
    }
  }

  fn notify(&self) {
    self.changes.send_modify(|version| *version += 1);
  }

  fn status(&self) -> QueryStatus {
    if self.error.is_some() && self.in_flight.is_none() {
      QueryStatus::Error
    } else if self.data.is_some() {
      QueryStatus::Success
    } else if self.in_flight.is_some() {
      QueryStatus::Pending
    } else {
      QueryStatus::Idle
    }
  }

  fn is_stale(&self, stale_time: Duration) -> bool {
    match self.updated_at {
      Some(at) => (Utc::now() - at).to_std().unwrap_or_default() > stale_time,
      None => true,
    }
  }

  fn set_data(&mut self, data: AnyData, at: DateTime<Utc>) {
    self.data = Some(Slot::Typed(data));
    self.updated_at = Some(at);
    self.error = None;
    self.invalidated = false;
  }
}

/// A caller's stake in an in-flight fetch.
///
/// When the last unsettled interest is dropped before the fetch completes,
/// the fetch is cancelled and its result is discarded.
pub(crate) struct Interest {
  id: u64,
  token: CancellationToken,
  count: Arc<AtomicUsize>,
  result: SharedFetch,
  settled: bool,
}

impl Interest {
  fn join(in_flight: &InFlight) -> Self {
    in_flight.interest.fetch_add(1, Ordering::SeqCst);
    Self {
      id: in_flight.id,
      token: in_flight.token.clone(),
      count: in_flight.interest.clone(),
      result: in_flight.result.clone(),
      settled: false,
    }
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  /// Wait for the shared fetch result.
  pub(crate) async fn wait(mut self) -> Result<AnyData> {
    let result = self.result.clone().await;
    self.settled = true;
    result
  }

  /// Release the interest without cancelling the fetch.
  pub(crate) fn settle(mut self) {
    self.settled = true;
  }
}

impl Drop for Interest {
  fn drop(&mut self) {
    let last = self.count.fetch_sub(1, Ordering::SeqCst) == 1;
    if last && !self.settled && !self.token.is_cancelled() {
      debug!(fetch = self.id, "No observers left, cancelling fetch");
      self.token.cancel();
    }
  }
}

/// Settings for a [`QueryCache`].
#[derive(Debug, Clone, Default)]
pub struct QueryCacheConfig {
  /// Query names whose persisted records are replayed by `restore()`
  pub known_queries: HashSet<String>,
  /// Query names that are never persisted (binary blobs, object URLs)
  pub volatile_queries: HashSet<String>,
}

impl QueryCacheConfig {
  pub fn with_known<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.known_queries.extend(names.into_iter().map(Into::into));
    self
  }

  pub fn with_volatile<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.volatile_queries.extend(names.into_iter().map(Into::into));
    self
  }
}

pub(crate) struct Inner {
  entries: Mutex<HashMap<String, Entry>>,
  persister: Option<Arc<DurablePersister>>,
  config: QueryCacheConfig,
  next_fetch_id: AtomicU64,
}

impl Inner {
  fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Write-through to the persister. Failures are logged, never surfaced.
  fn persist<T: Serialize>(&self, key: &QueryKey, value: &T, at: DateTime<Utc>) {
    let Some(persister) = &self.persister else {
      return;
    };
    if self.config.volatile_queries.contains(key.name()) {
      return;
    }

    let record = match serde_json::to_value(value) {
      Ok(data) => PersistedRecord {
        data,
        timestamp: at.timestamp_millis(),
      },
      Err(e) => {
        warn!(key = %key, error = %e, "Query data is not serializable, skipping persistence");
        return;
      }
    };
    if let Err(e) = persister.set(key.cache_key(), &record) {
      warn!(key = %key, error = %e, "Failed to persist query");
    }
  }

  /// Record the outcome of fetch `id` unless it was cancelled or superseded.
  fn complete<T: QueryData>(
    &self,
    key: &QueryKey,
    id: u64,
    token: &CancellationToken,
    outcome: std::result::Result<T, String>,
  ) -> Result<AnyData> {
    let mut entries = self.entries();
    let entry = match entries.get_mut(key.cache_key()) {
      Some(entry) if entry.in_flight.as_ref().map(|f| f.id) == Some(id) => entry,
      Some(entry) => {
        debug!(key = %key, fetch = id, "Fetch was superseded, discarding result");
        // Waiters get whatever superseded it, e.g. an optimistic write
        return match &entry.data {
          Some(Slot::Typed(data)) if entry.in_flight.is_none() => Ok(data.clone()),
          _ => Err(CacheError::Cancelled),
        };
      }
      None => {
        debug!(key = %key, "Query was reset during fetch, discarding result");
        return Err(CacheError::Cancelled);
      }
    };
    entry.in_flight = None;

    if token.is_cancelled() {
      debug!(key = %key, "Discarding result of cancelled fetch");
      entry.notify();
      return Err(CacheError::Cancelled);
    }

    match outcome {
      Ok(value) => {
        let now = Utc::now();
        let value = Arc::new(value);
        entry.set_data(value.clone(), now);
        entry.notify();
        self.persist(key, &*value, now);
        debug!(key = %key, "Fetch succeeded");
        Ok(value)
      }
      Err(message) => {
        warn!(key = %key, error = %message, "Fetch failed");
        let error = CacheError::FetchFailed(message);
        entry.error = Some(error.clone());
        entry.notify();
        Err(error)
      }
    }
  }
}

/// Query cache shared by every UI surface of the application.
///
/// Cloning is cheap and every clone sees the same entries.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
  focus: Option<FocusCoordinator>,
}

impl QueryCache {
  /// Create a cache. Without a persister the cache is memory-only.
  pub fn new(persister: Option<Arc<DurablePersister>>, config: QueryCacheConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        persister,
        config,
        next_fetch_id: AtomicU64::new(0),
      }),
      focus: None,
    }
  }

  /// Refetch focus-enabled queries through `focus`.
  pub fn with_focus(mut self, focus: FocusCoordinator) -> Self {
    self.focus = Some(focus);
    self
  }

  pub fn focus(&self) -> Option<&FocusCoordinator> {
    self.focus.as_ref()
  }

  pub fn is_volatile(&self, name: &str) -> bool {
    self.inner.config.volatile_queries.contains(name)
  }

  /// Synchronous read of cached data. Never fetches.
  pub fn get<T: QueryData>(&self, key: &QueryKey) -> Option<T> {
    let entries = self.inner.entries();
    entries
      .get(key.cache_key())
      .and_then(|entry| entry.data.as_ref())
      .and_then(|slot| slot.decode(key.cache_key()))
  }

  /// Snapshot of a query's state.
  pub fn state<T: QueryData>(&self, key: &QueryKey) -> QueryState<T> {
    let entries = self.inner.entries();
    match entries.get(key.cache_key()) {
      Some(entry) => QueryState {
        status: entry.status(),
        data: entry
          .data
          .as_ref()
          .and_then(|slot| slot.decode(key.cache_key())),
        error: entry.error.clone(),
        is_fetching: entry.in_flight.is_some(),
        updated_at: entry.updated_at,
      },
      None => QueryState::idle(),
    }
  }

  /// Cached keys, in no particular order.
  pub fn query_keys(&self) -> Vec<String> {
    self
      .inner
      .entries()
      .iter()
      .filter(|(_, entry)| entry.data.is_some())
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Cached data if present, fresh and not invalidated.
  fn fresh<T: QueryData>(&self, key: &QueryKey, stale_time: Duration) -> Option<T> {
    let entries = self.inner.entries();
    let entry = entries.get(key.cache_key())?;
    if entry.invalidated || entry.is_stale(stale_time) {
      return None;
    }
    entry.data.as_ref()?.decode(key.cache_key())
  }

  /// Whether a mounted observer should trigger a fetch.
  pub(crate) fn should_fetch(&self, key: &QueryKey, stale_time: Duration) -> bool {
    let entries = self.inner.entries();
    match entries.get(key.cache_key()) {
      Some(entry) if entry.in_flight.is_some() => true,
      Some(entry) if entry.data.is_some() => entry.invalidated || entry.is_stale(stale_time),
      _ => true,
    }
  }

  /// Whether `key` has been invalidated and is not yet being refetched.
  pub(crate) fn awaiting_refetch(&self, key: &QueryKey) -> bool {
    let entries = self.inner.entries();
    entries
      .get(key.cache_key())
      .is_some_and(|entry| entry.invalidated && entry.in_flight.is_none())
  }

  pub(crate) fn in_flight_id(&self, key: &QueryKey) -> Option<u64> {
    let entries = self.inner.entries();
    entries
      .get(key.cache_key())
      .and_then(|entry| entry.in_flight.as_ref().map(|f| f.id))
  }

  /// Receiver notified whenever the entry for `key` changes.
  pub(crate) fn subscribe(&self, key: &QueryKey) -> watch::Receiver<u64> {
    let mut entries = self.inner.entries();
    entries
      .entry(key.cache_key().to_string())
      .or_insert_with(Entry::new)
      .changes
      .subscribe()
  }

  /// Start a fetch for `key`, or join the one already in flight.
  ///
  /// Must be called from within a tokio runtime.
  pub(crate) fn start_fetch<T: QueryData>(&self, key: &QueryKey, fetcher: &Fetcher<T>) -> Interest {
    let (tx, rx) = oneshot::channel();
    let id = self.inner.next_fetch_id.fetch_add(1, Ordering::SeqCst);
    let token = CancellationToken::new();

    let interest = {
      let mut entries = self.inner.entries();
      let entry = entries
        .entry(key.cache_key().to_string())
        .or_insert_with(Entry::new);

      if let Some(in_flight) = &entry.in_flight {
        if !in_flight.token.is_cancelled() {
          debug!(key = %key, fetch = in_flight.id, "Joining in-flight fetch");
          return Interest::join(in_flight);
        }
        // The cancelled fetch finishes on its own and is discarded by id
        debug!(key = %key, fetch = in_flight.id, "Replacing cancelled fetch");
      }

      let result: SharedFetch = async move {
        rx.await
          .unwrap_or_else(|_| Err(CacheError::FetchFailed("Fetch task was dropped".to_string())))
      }
      .boxed()
      .shared();

      let in_flight = InFlight {
        id,
        token: token.clone(),
        interest: Arc::new(AtomicUsize::new(0)),
        result,
      };
      let interest = Interest::join(&in_flight);
      entry.in_flight = Some(in_flight);
      entry.notify();
      interest
    };

    debug!(key = %key, fetch = id, "Starting fetch");
    // Built outside the lock so a fetcher may read the cache synchronously
    let fut = (fetcher.0)(token.clone());
    let inner = Arc::clone(&self.inner);
    let key = key.clone();

    tokio::spawn(async move {
      let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => Err("Fetcher panicked".to_string()),
      };
      let result = inner.complete::<T>(&key, id, &token, outcome);
      let _ = tx.send(result);
    });

    interest
  }

  /// Return fresh cached data, or fetch it.
  ///
  /// Concurrent calls for the same key share one fetch and resolve to the
  /// same value.
  pub async fn fetch_query<T, F, Fut, E>(
    &self,
    key: &QueryKey,
    fetcher: F,
    options: &QueryOptions,
  ) -> Result<T>
  where
    T: QueryData,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Display,
  {
    self
      .fetch_with(key, &Fetcher::new(fetcher), options)
      .await
  }

  /// [`fetch_query`](Self::fetch_query) with an already-built [`Fetcher`].
  pub async fn fetch_with<T: QueryData>(
    &self,
    key: &QueryKey,
    fetcher: &Fetcher<T>,
    options: &QueryOptions,
  ) -> Result<T> {
    if let Some(data) = self.fresh::<T>(key, options.stale_time) {
      return Ok(data);
    }

    let data = self.start_fetch(key, fetcher).wait().await?;
    data.downcast_ref::<T>().cloned().ok_or_else(|| {
      CacheError::FetchFailed(format!("Query {} resolved to a different type", key))
    })
  }

  /// Mount an observer for `key`.
  ///
  /// The observer's state is populated synchronously from the cache
  /// (including restored data); a fetch starts in the background when the
  /// data is missing or stale and the query is enabled.
  pub fn query<T, F, Fut, E>(&self, key: QueryKey, fetcher: F, options: QueryOptions) -> QueryObserver<T>
  where
    T: QueryData,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    E: Display,
  {
    self.observe(key, Fetcher::new(fetcher), options)
  }

  /// [`query`](Self::query) with an already-built [`Fetcher`].
  pub fn observe<T: QueryData>(&self, key: QueryKey, fetcher: Fetcher<T>, options: QueryOptions) -> QueryObserver<T> {
    QueryObserver::mount(self.clone(), key, fetcher, options)
  }

  /// Fetch in the background, logging rather than returning any failure.
  pub fn refetch_detached<T: QueryData>(&self, key: &QueryKey, fetcher: &Fetcher<T>) {
    let interest = self.start_fetch(key, fetcher);
    let key = key.clone();
    tokio::spawn(async move {
      if let Err(e) = interest.wait().await {
        debug!(key = %key, error = %e, "Background refetch failed");
      }
    });
  }

  /// Write data directly, bypassing any fetch.
  ///
  /// A fetch in flight for `key` is cancelled so its older result cannot
  /// overwrite this write; its waiters receive the written value. The updater
  /// runs while the cache is locked and must not call back into the cache.
  pub fn mutate<T: QueryData>(&self, key: &QueryKey, mutation: Mutation<T>) -> T {
    let mut entries = self.inner.entries();
    let entry = entries
      .entry(key.cache_key().to_string())
      .or_insert_with(Entry::new);

    if let Some(in_flight) = entry.in_flight.take() {
      debug!(key = %key, fetch = in_flight.id, "Mutation supersedes in-flight fetch");
      in_flight.token.cancel();
    }

    let previous = entry
      .data
      .as_ref()
      .and_then(|slot| slot.decode::<T>(key.cache_key()));
    let next = mutation.apply(previous);

    let now = Utc::now();
    entry.set_data(Arc::new(next.clone()), now);
    entry.notify();
    self.inner.persist(key, &next, now);
    debug!(key = %key, "Mutated query data");
    next
  }

  /// Shorthand for [`mutate`](Self::mutate) with [`Mutation::Replace`].
  pub fn set_query_data<T: QueryData>(&self, key: &QueryKey, value: T) -> T {
    self.mutate(key, Mutation::Replace(value))
  }

  /// Mark a query stale and drop its persisted record. Mounted enabled
  /// observers refetch on their next poll.
  pub fn invalidate(&self, key: &QueryKey) {
    {
      let mut entries = self.inner.entries();
      if let Some(entry) = entries.get_mut(key.cache_key()) {
        entry.invalidated = true;
        entry.notify();
      }
    }
    self.remove_persisted(key);
  }

  /// Cancel the in-flight fetch for `key`, if any. Its result is discarded.
  pub fn cancel(&self, key: &QueryKey) {
    let entries = self.inner.entries();
    if let Some(in_flight) = entries
      .get(key.cache_key())
      .and_then(|entry| entry.in_flight.as_ref())
    {
      in_flight.token.cancel();
    }
  }

  /// Forget a query in memory and in persistence.
  pub fn remove(&self, key: &QueryKey) {
    if let Some(entry) = self.inner.entries().remove(key.cache_key()) {
      if let Some(in_flight) = entry.in_flight {
        in_flight.token.cancel();
      }
    }
    self.remove_persisted(key);
  }

  fn remove_persisted(&self, key: &QueryKey) {
    if let Some(persister) = &self.inner.persister {
      if let Err(e) = persister.remove(key.cache_key()) {
        warn!(key = %key, error = %e, "Failed to remove persisted query");
      }
    }
  }

  /// Drop every in-memory entry and cancel all fetches. Persisted records
  /// are left alone.
  pub fn reset(&self) {
    let drained: Vec<Entry> = self.inner.entries().drain().map(|(_, e)| e).collect();
    for entry in &drained {
      if let Some(in_flight) = &entry.in_flight {
        in_flight.token.cancel();
      }
    }
    info!(count = drained.len(), "Reset query cache");
  }

  /// Load persisted records of known queries into memory.
  ///
  /// Entries that already hold data are left untouched. Returns how many
  /// records were restored.
  pub fn restore(&self) -> Result<usize> {
    let Some(persister) = &self.inner.persister else {
      return Ok(0);
    };

    let mut restored = 0;
    for raw in persister.keys()? {
      let Some(key) = QueryKey::parse(&raw) else {
        debug!(key = %raw, "Skipping unparseable persisted key");
        continue;
      };
      if !self.inner.config.known_queries.contains(key.name()) {
        debug!(key = %raw, "Skipping persisted record of unknown query");
        continue;
      }
      let Some(record) = persister.get::<PersistedRecord>(&raw)? else {
        continue;
      };

      let mut entries = self.inner.entries();
      let entry = entries
        .entry(key.cache_key().to_string())
        .or_insert_with(Entry::new);
      if entry.data.is_some() {
        continue;
      }
      entry.data = Some(Slot::Restored(record.data));
      entry.updated_at = DateTime::from_timestamp_millis(record.timestamp);
      entry.notify();
      restored += 1;
    }

    info!(restored, "Restored persisted queries");
    Ok(restored)
  }
}
