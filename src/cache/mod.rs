//! Entity caching and durable persistence.
//!
//! Decrypting an entity is the expensive part of showing it, so every kind of
//! decrypted entity is kept in a UUID-keyed map that all UI surfaces share.
//! Query results additionally survive restarts through [`DurablePersister`].

mod entity;
mod persister;
mod traits;

pub use entity::EntityCache;
pub use persister::DurablePersister;
pub use traits::Entity;
