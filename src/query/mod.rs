//! Async query cache with persistence, de-duplication and focus refetching.
//!
//! Queries are addressed by a [`QueryKey`] (a name plus canonicalized JSON
//! parameters). Data lives in a shared [`QueryCache`]; UI surfaces mount a
//! [`QueryObserver`] per query and poll it from their event loop.
//!
//! # Example
//!
//! ```ignore
//! let client = client.clone();
//! let key = QueryKey::with_params("notes", &())?;
//! let mut notes = cache.query(key, move |_token| {
//!     let client = client.clone();
//!     async move { client.notes().await }
//! }, QueryOptions::default());
//!
//! // In event loop tick
//! if notes.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match notes.status() {
//!     QueryStatus::Pending => render_spinner(),
//!     QueryStatus::Success => render_notes(notes.data()),
//!     QueryStatus::Error => render_error(notes.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

mod cache;
mod key;
mod observer;
mod state;

pub use cache::{Fetcher, PersistedRecord, QueryCache, QueryCacheConfig, QueryData};
pub use key::{canonicalize, QueryKey};
pub use observer::QueryObserver;
pub use state::{Mutation, QueryOptions, QueryState, QueryStatus};
