//! In-memory identity map for decrypted entities.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::traits::Entity;
use crate::error::{CacheError, Result};

/// Process-wide map from UUID to decrypted entity of one kind.
///
/// Values are replaced wholesale and never expire; only [`reset`](Self::reset)
/// empties the map.
pub struct EntityCache<E: Entity> {
  entries: RwLock<HashMap<Uuid, E>>,
}

impl<E: Entity> EntityCache<E> {
  pub fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
    }
  }

  /// Look up an entity. `None` means a cache miss.
  pub fn get(&self, id: &Uuid) -> Option<E> {
    self
      .entries
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(id)
      .cloned()
  }

  /// Like [`get`](Self::get), but a miss is an error.
  pub fn require(&self, id: &Uuid) -> Result<E> {
    self
      .get(id)
      .ok_or_else(|| CacheError::NotFound(format!("{} {}", E::kind(), id)))
  }

  /// Store an entity, replacing whatever was cached for `id`.
  pub fn set(&self, id: Uuid, entity: E) {
    self
      .entries
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, entity);
  }

  /// Store an entity under its own UUID.
  pub fn insert(&self, entity: E) {
    self.set(entity.uuid(), entity);
  }

  pub fn extend(&self, entities: impl IntoIterator<Item = E>) {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    for entity in entities {
      entries.insert(entity.uuid(), entity);
    }
  }

  pub fn len(&self) -> usize {
    self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every cached entity.
  pub fn reset(&self) {
    let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
    debug!(kind = E::kind(), count = entries.len(), "Resetting entity cache");
    entries.clear();
  }
}

impl<E: Entity> Default for EntityCache<E> {
  fn default() -> Self {
    Self::new()
  }
}
