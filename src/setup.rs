//! Single-flight application bootstrap.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

use crate::cache::DurablePersister;
use crate::db::LocalDatabase;
use crate::drive::{ClientSlot, RemoteClient};
use crate::error::{CacheError, Result};
use crate::query::QueryCache;
use crate::sync::{run_scoped, AsyncSemaphore};

/// Resolves stored credentials into an authenticated client.
#[async_trait]
pub trait Authenticator: Send + Sync {
  /// `None` when no usable credentials are stored.
  async fn resolve(&self) -> Result<Option<Arc<dyn RemoteClient>>>;
}

/// No stored credentials; for offline tooling.
pub struct Anonymous;

#[async_trait]
impl Authenticator for Anonymous {
  async fn resolve(&self) -> Result<Option<Arc<dyn RemoteClient>>> {
    Ok(None)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
  pub is_authed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupState {
  Uninitialized,
  Initializing,
  Ready(SetupOutcome),
  /// Terminal; later calls return the same error
  Failed(CacheError),
}

/// Runs the bootstrap sequence at most once, however many callers ask.
pub struct SetupOrchestrator {
  semaphore: AsyncSemaphore,
  state: Mutex<SetupState>,
  auth: Arc<dyn Authenticator>,
  client: ClientSlot,
  persister: Arc<DurablePersister>,
  database: Arc<dyn LocalDatabase>,
  queries: QueryCache,
}

impl SetupOrchestrator {
  pub fn new(
    auth: Arc<dyn Authenticator>,
    client: ClientSlot,
    persister: Arc<DurablePersister>,
    database: Arc<dyn LocalDatabase>,
    queries: QueryCache,
  ) -> Self {
    Self {
      semaphore: AsyncSemaphore::new(1),
      state: Mutex::new(SetupState::Uninitialized),
      auth,
      client,
      persister,
      database,
      queries,
    }
  }

  pub fn state(&self) -> SetupState {
    self
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  fn set_state(&self, state: SetupState) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Record the bootstrap result unless an abort already settled the state.
  fn finish(&self, outcome: SetupState) {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == SetupState::Initializing {
      *state = outcome;
    }
  }

  /// Bootstrap the application, or return the outcome of the bootstrap that
  /// already ran.
  ///
  /// Concurrent callers queue in arrival order; only the first performs the
  /// work.
  pub async fn setup(&self) -> Result<SetupOutcome> {
    run_scoped(|scope| async move {
      self.semaphore.acquire().await?;
      let semaphore = self.semaphore.clone();
      scope.defer(move || {
        semaphore.release();
        Ok(())
      });

      match self.state() {
        SetupState::Ready(outcome) => return Ok(outcome),
        SetupState::Failed(e) => return Err(e),
        // An interrupted bootstrap is retried
        SetupState::Uninitialized | SetupState::Initializing => {}
      }

      self.set_state(SetupState::Initializing);
      match self.bootstrap().await {
        Ok(outcome) => {
          info!(is_authed = outcome.is_authed, "Setup complete");
          self.finish(SetupState::Ready(outcome));
          Ok(outcome)
        }
        Err(e) => {
          let e = match e {
            CacheError::SetupFailed(_) => e,
            other => CacheError::SetupFailed(other.to_string()),
          };
          error!(error = %e, "Setup failed");
          self.finish(SetupState::Failed(e.clone()));
          Err(e)
        }
      }
    })
    .await
  }

  async fn bootstrap(&self) -> Result<SetupOutcome> {
    let client = self.auth.resolve().await?;
    let is_authed = client.is_some();
    if let Some(client) = client {
      self.client.install(client);
    }

    tokio::try_join!(
      async { self.persister.init() },
      self.database.init(),
      async { self.queries.restore().map(|_| ()) },
    )?;

    Ok(SetupOutcome { is_authed })
  }

  /// Reject every caller still queued behind a running setup.
  ///
  /// A bootstrap already running finishes and its caller gets its result,
  /// but the state becomes `Failed(Purged)` so later callers do not bootstrap
  /// again.
  pub fn abort(&self) -> usize {
    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      if *state == SetupState::Initializing {
        *state = SetupState::Failed(CacheError::Purged);
      }
    }
    let purged = self.semaphore.purge();
    if purged > 0 {
      info!(purged, "Aborted queued setup callers");
    }
    purged
  }
}
