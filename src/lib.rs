//! Local caching and synchronization layer for encrypted cloud drive clients.
//!
//! Decrypted entities are kept in per-kind [`cache::EntityCache`]s, query
//! results in a shared [`query::QueryCache`] that de-duplicates fetches and
//! writes through to a versioned [`cache::DurablePersister`]. Bootstrap runs
//! once through [`setup::SetupOrchestrator`]; [`context::AppContext`] owns one
//! instance of everything.

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod drive;
pub mod error;
pub mod focus;
pub mod logging;
pub mod query;
pub mod setup;
pub mod sync;
