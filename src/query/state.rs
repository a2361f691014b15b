use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::CacheError;

/// Lifecycle status of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Nothing cached and nothing fetching
  Idle,
  /// First fetch in progress, no data yet
  Pending,
  /// Data is available (possibly stale, possibly being refetched)
  Success,
  /// The last fetch failed
  Error,
}

/// Snapshot of a query as seen by one observer.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub status: QueryStatus,
  pub data: Option<T>,
  pub error: Option<CacheError>,
  /// A fetch for this key is in flight
  pub is_fetching: bool,
  pub updated_at: Option<DateTime<Utc>>,
}

impl<T> QueryState<T> {
  pub fn idle() -> Self {
    Self {
      status: QueryStatus::Idle,
      data: None,
      error: None,
      is_fetching: false,
      updated_at: None,
    }
  }

  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Pending
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&CacheError> {
    self.error.as_ref()
  }
}

/// Per-observer query behaviour.
#[derive(Debug, Clone)]
pub struct QueryOptions {
  /// How long fetched data counts as fresh
  pub stale_time: Duration,
  /// Disabled queries serve cached data but never fetch on their own
  pub enabled: bool,
  /// Refetch when the application regains focus
  pub refetch_on_focus: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(60),
      enabled: true,
      refetch_on_focus: true,
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn refetch_on_focus(mut self, refetch: bool) -> Self {
    self.refetch_on_focus = refetch;
    self
  }
}

/// A direct write to a query's cached data.
pub enum Mutation<T> {
  /// Replace the cached value outright
  Replace(T),
  /// Derive the new value from the previous one (`None` if nothing cached)
  Update(Box<dyn FnOnce(Option<T>) -> T + Send>),
}

impl<T> Mutation<T> {
  pub fn update<F>(f: F) -> Self
  where
    F: FnOnce(Option<T>) -> T + Send + 'static,
  {
    Mutation::Update(Box::new(f))
  }

  pub(crate) fn apply(self, previous: Option<T>) -> T {
    match self {
      Mutation::Replace(value) => value,
      Mutation::Update(f) => f(previous),
    }
  }
}
