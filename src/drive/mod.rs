//! Drive entities, the remote client interface and the named queries built
//! on them.

pub mod cache;
pub mod client;
pub mod queries;
pub mod types;

pub use cache::{DriveQuery, EntityCaches, KNOWN_QUERIES, VOLATILE_QUERIES};
pub use client::{ClientSlot, RemoteClient};
pub use queries::DriveQueries;
