//! Core traits for cached entities.

use uuid::Uuid;

/// Trait for decrypted entities held in an [`EntityCache`](super::EntityCache).
///
/// Entities are deterministic projections of server state, so two copies with
/// the same UUID are interchangeable and the cache can keep whichever arrived
/// last.
pub trait Entity: Clone + Send + Sync + 'static {
  /// Stable identity of this entity
  fn uuid(&self) -> Uuid;

  /// Entity kind name used in log output (e.g., "note", "directory")
  fn kind() -> &'static str;
}
