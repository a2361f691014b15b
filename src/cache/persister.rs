//! Namespaced, version-scoped JSON persistence over a [`KvStore`].

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::KvStore;
use crate::error::Result;

/// Durable key-value persister.
///
/// Every logical key is stored as `<prefix>_v<version>:<key>`. Bumping the
/// version makes every older record unreachable, which is the whole migration
/// story after an incompatible change to what gets persisted.
pub struct DurablePersister {
  store: Arc<dyn KvStore>,
  prefix: String,
  version: u32,
  namespace: String,
}

impl DurablePersister {
  pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, version: u32) -> Self {
    let prefix = prefix.into();
    let namespace = format!("{}_v{}:", prefix, version);
    Self {
      store,
      prefix,
      version,
      namespace,
    }
  }

  /// The physical key prefix, e.g. `queryClient_v1:`.
  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn version(&self) -> u32 {
    self.version
  }

  fn physical_key(&self, key: &str) -> String {
    format!("{}{}", self.namespace, key)
  }

  /// Prepare the underlying store.
  pub fn init(&self) -> Result<()> {
    self.store.init()?;
    debug!(namespace = %self.namespace, "Persister ready");
    Ok(())
  }

  /// Read a value. Missing and undecodable records both read as `None`.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let Some(bytes) = self.store.get(&self.physical_key(key))? else {
      return Ok(None);
    };

    match serde_json::from_slice(&bytes) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        warn!(key, error = %e, "Discarding undecodable persisted value");
        Ok(None)
      }
    }
  }

  pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    self.store.set(&self.physical_key(key), &bytes)
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    self.store.delete(&self.physical_key(key))
  }

  /// Logical keys of the current version, namespace stripped.
  pub fn keys(&self) -> Result<Vec<String>> {
    Ok(
      self
        .store
        .keys_with_prefix(&self.namespace)?
        .into_iter()
        .filter_map(|k| k.strip_prefix(&self.namespace).map(String::from))
        .collect(),
    )
  }

  /// Remove every record of the current version.
  pub fn clear(&self) -> Result<()> {
    let keys = self.store.keys_with_prefix(&self.namespace)?;
    for key in &keys {
      self.store.delete(key)?;
    }
    info!(namespace = %self.namespace, removed = keys.len(), "Cleared persisted cache");
    Ok(())
  }

  /// Delete records left behind by other versions of this prefix.
  ///
  /// Returns how many records were removed.
  pub fn prune_orphans(&self) -> Result<usize> {
    let family = format!("{}_v", self.prefix);
    let mut removed = 0;

    for key in self.store.keys_with_prefix(&family)? {
      if key.starts_with(&self.namespace) || !is_versioned_key(&key[family.len()..]) {
        continue;
      }
      self.store.delete(&key)?;
      removed += 1;
    }

    if removed > 0 {
      info!(prefix = %self.prefix, removed, "Pruned records from previous cache versions");
    }
    Ok(removed)
  }
}

/// Whether `rest` (the part after `<prefix>_v`) looks like `<digits>:...`.
fn is_versioned_key(rest: &str) -> bool {
  match rest.split_once(':') {
    Some((version, _)) => !version.is_empty() && version.chars().all(|c| c.is_ascii_digit()),
    None => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::MemoryStore;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Prefs {
    theme: String,
    columns: u8,
  }

  fn prefs() -> Prefs {
    Prefs {
      theme: "dark".into(),
      columns: 3,
    }
  }

  #[test]
  fn test_keys_are_namespaced() {
    let store = Arc::new(MemoryStore::new());
    let persister = DurablePersister::new(store.clone(), "queryClient", 1);

    persister.set("prefs", &prefs()).unwrap();
    assert_eq!(store.keys().unwrap(), vec!["queryClient_v1:prefs"]);
    assert_eq!(persister.keys().unwrap(), vec!["prefs"]);
    assert_eq!(persister.get::<Prefs>("prefs").unwrap(), Some(prefs()));

    persister.remove("prefs").unwrap();
    assert_eq!(persister.get::<Prefs>("prefs").unwrap(), None);
  }

  #[test]
  fn test_version_bump_orphans_records() {
    let store = Arc::new(MemoryStore::new());
    DurablePersister::new(store.clone(), "queryClient", 1)
      .set("prefs", &prefs())
      .unwrap();

    let bumped = DurablePersister::new(store.clone(), "queryClient", 2);
    assert_eq!(bumped.get::<Prefs>("prefs").unwrap(), None);
    assert!(bumped.keys().unwrap().is_empty());
    // Still there, just unreachable
    assert_eq!(store.keys().unwrap().len(), 1);
  }

  #[test]
  fn test_undecodable_value_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let persister = DurablePersister::new(store.clone(), "queryClient", 1);
    store.set("queryClient_v1:prefs", b"{not json").unwrap();
    persister.set("count", &5u32).unwrap();

    assert_eq!(persister.get::<Prefs>("prefs").unwrap(), None);
    assert_eq!(persister.get::<Prefs>("count").unwrap(), None);
    assert_eq!(persister.get::<u32>("count").unwrap(), Some(5));
  }

  #[test]
  fn test_clear_only_touches_current_version() {
    let store = Arc::new(MemoryStore::new());
    let old = DurablePersister::new(store.clone(), "queryClient", 1);
    let current = DurablePersister::new(store.clone(), "queryClient", 2);
    old.set("a", &1).unwrap();
    current.set("a", &2).unwrap();
    current.set("b", &3).unwrap();

    current.clear().unwrap();
    assert!(current.keys().unwrap().is_empty());
    assert_eq!(old.get::<i32>("a").unwrap(), Some(1));
  }

  #[test]
  fn test_prune_orphans() {
    let store = Arc::new(MemoryStore::new());
    DurablePersister::new(store.clone(), "queryClient", 1)
      .set("a", &1)
      .unwrap();
    DurablePersister::new(store.clone(), "queryClient", 2)
      .set("b", &2)
      .unwrap();
    store.set("queryClient_vault:unrelated", b"1").unwrap();
    store.set("settings:theme", b"1").unwrap();

    let current = DurablePersister::new(store.clone(), "queryClient", 3);
    current.set("c", &3).unwrap();

    assert_eq!(current.prune_orphans().unwrap(), 2);
    assert_eq!(
      store.keys().unwrap(),
      vec!["queryClient_v3:c", "queryClient_vault:unrelated", "settings:theme"]
    );
  }
}
