//! Process-wide application context.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::DurablePersister;
use crate::config::Config;
use crate::db::{Database, KvStore, MemoryStore, SqliteStore};
use crate::drive::{ClientSlot, DriveQueries, EntityCaches};
use crate::focus::FocusCoordinator;
use crate::query::{QueryCache, QueryCacheConfig, QueryOptions};
use crate::setup::{Authenticator, SetupOrchestrator};

/// Owns the single instance of every cache component.
///
/// Build one per running application and pass it by reference.
pub struct AppContext {
  pub config: Config,
  pub database: Arc<Database>,
  pub persister: Arc<DurablePersister>,
  pub entities: Arc<EntityCaches>,
  pub client: ClientSlot,
  pub focus: FocusCoordinator,
  pub queries: QueryCache,
  pub drive: DriveQueries,
  pub setup: SetupOrchestrator,
}

impl AppContext {
  /// Wire every component. Nothing touches the filesystem until setup runs.
  pub fn new(config: Config, auth: Arc<dyn Authenticator>) -> Result<Self> {
    let database = Arc::new(Database::new(config.database_path()?));
    let store: Arc<dyn KvStore> = if config.cache.persist {
      Arc::new(SqliteStore::new(database.clone()))
    } else {
      Arc::new(MemoryStore::new())
    };
    let persister = Arc::new(DurablePersister::new(
      store,
      config.cache.prefix.clone(),
      config.cache.version,
    ));

    let focus = FocusCoordinator::default();
    let queries = QueryCache::new(
      Some(persister.clone()),
      QueryCacheConfig::default()
        .with_known(config.cache.known_queries.iter().cloned())
        .with_volatile(config.cache.volatile_queries.iter().cloned()),
    )
    .with_focus(focus.clone());

    let entities = Arc::new(EntityCaches::new());
    let client = ClientSlot::new();
    let drive = DriveQueries::new(queries.clone(), entities.clone(), client.clone());
    let setup = SetupOrchestrator::new(
      auth,
      client.clone(),
      persister.clone(),
      database.clone(),
      queries.clone(),
    );

    Ok(Self {
      config,
      database,
      persister,
      entities,
      client,
      focus,
      queries,
      drive,
      setup,
    })
  }

  /// Query options carrying the configured stale time.
  pub fn query_options(&self) -> QueryOptions {
    QueryOptions::default().with_stale_time(self.config.cache.stale_time())
  }

  /// Forget the signed-in user: drop the client, every cached entity and
  /// query, and the persisted records of the current cache version.
  pub fn logout(&self) -> crate::error::Result<()> {
    self.client.clear();
    self.queries.reset();
    self.entities.reset();
    self.persister.clear()?;
    info!("Logged out");
    Ok(())
  }
}
