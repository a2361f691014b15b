//! Named drive queries over the shared query cache.

use color_eyre::eyre::eyre;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::query::{Fetcher, Mutation, QueryCache, QueryData, QueryObserver, QueryOptions};

use super::cache::{DriveQuery, EntityCaches};
use super::client::{ClientSlot, RemoteClient};
use super::types::{Chat, ChatMessage, DriveItem, Note, NoteContent};

/// Drive queries with transparent caching.
///
/// Fetchers read the client installed in the [`ClientSlot`] at fetch time
/// and record every fetched entity in the [`EntityCaches`].
#[derive(Clone)]
pub struct DriveQueries {
  cache: QueryCache,
  entities: Arc<EntityCaches>,
  client: ClientSlot,
}

impl DriveQueries {
  pub fn new(cache: QueryCache, entities: Arc<EntityCaches>, client: ClientSlot) -> Self {
    Self {
      cache,
      entities,
      client,
    }
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  fn fetcher<T, F, Fut>(&self, f: F) -> Fetcher<T>
  where
    T: QueryData,
    F: Fn(Arc<dyn RemoteClient>, Arc<EntityCaches>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = color_eyre::Result<T>> + Send + 'static,
  {
    let client = self.client.clone();
    let entities = self.entities.clone();
    Fetcher::new(move |token| {
      let fut = client.get().map(|client| f(client, entities.clone(), token));
      async move {
        match fut {
          Some(fut) => fut.await,
          None => Err(eyre!("Not authenticated")),
        }
      }
    })
  }

  fn directory_listing_fetcher(&self, parent: Uuid) -> Fetcher<Vec<DriveItem>> {
    self.fetcher(move |client, entities, token| async move {
      let items = client.list_directory(parent, Some(token)).await?;
      entities.record_listing(&items);
      Ok::<_, color_eyre::Report>(items)
    })
  }

  fn notes_fetcher(&self) -> Fetcher<Vec<Note>> {
    self.fetcher(|client, entities, token| async move {
      let notes = client.notes(Some(token)).await?;
      entities.notes.extend(notes.iter().cloned());
      Ok::<_, color_eyre::Report>(notes)
    })
  }

  fn note_fetcher(&self, uuid: Uuid) -> Fetcher<NoteContent> {
    self.fetcher(move |client, _, token| async move { client.note_content(uuid, Some(token)).await })
  }

  fn chats_fetcher(&self) -> Fetcher<Vec<Chat>> {
    self.fetcher(|client, entities, token| async move {
      let chats = client.chats(Some(token)).await?;
      entities.chats.extend(chats.iter().cloned());
      Ok::<_, color_eyre::Report>(chats)
    })
  }

  fn chat_messages_fetcher(&self, conversation: Uuid) -> Fetcher<Vec<ChatMessage>> {
    self.fetcher(move |client, _, token| async move {
      client.chat_messages(conversation, Some(token)).await
    })
  }

  fn file_thumbnail_fetcher(&self, uuid: Uuid) -> Fetcher<Vec<u8>> {
    self.fetcher(move |client, _, token| async move { client.file_thumbnail(uuid, Some(token)).await })
  }

  // ==========================================================================
  // Observers
  // ==========================================================================

  pub fn directory_listing(&self, parent: Uuid, options: QueryOptions) -> QueryObserver<Vec<DriveItem>> {
    let key = DriveQuery::DirectoryListing { parent }.key();
    self.cache.observe(key, self.directory_listing_fetcher(parent), options)
  }

  pub fn notes(&self, options: QueryOptions) -> QueryObserver<Vec<Note>> {
    self.cache.observe(DriveQuery::Notes.key(), self.notes_fetcher(), options)
  }

  pub fn note(&self, uuid: Uuid, options: QueryOptions) -> QueryObserver<NoteContent> {
    let key = DriveQuery::Note { uuid }.key();
    self.cache.observe(key, self.note_fetcher(uuid), options)
  }

  pub fn chats(&self, options: QueryOptions) -> QueryObserver<Vec<Chat>> {
    self.cache.observe(DriveQuery::Chats.key(), self.chats_fetcher(), options)
  }

  pub fn chat_messages(&self, conversation: Uuid, options: QueryOptions) -> QueryObserver<Vec<ChatMessage>> {
    let key = DriveQuery::ChatMessages { conversation }.key();
    self.cache.observe(key, self.chat_messages_fetcher(conversation), options)
  }

  pub fn file_thumbnail(&self, uuid: Uuid, options: QueryOptions) -> QueryObserver<Vec<u8>> {
    let key = DriveQuery::FileThumbnail { uuid }.key();
    self.cache.observe(key, self.file_thumbnail_fetcher(uuid), options)
  }

  // ==========================================================================
  // Awaitable fetches
  // ==========================================================================

  pub async fn fetch_directory_listing(&self, parent: Uuid) -> Result<Vec<DriveItem>> {
    let key = DriveQuery::DirectoryListing { parent }.key();
    self
      .cache
      .fetch_with(&key, &self.directory_listing_fetcher(parent), &QueryOptions::default())
      .await
  }

  pub async fn fetch_notes(&self) -> Result<Vec<Note>> {
    self
      .cache
      .fetch_with(&DriveQuery::Notes.key(), &self.notes_fetcher(), &QueryOptions::default())
      .await
  }

  pub async fn fetch_note(&self, uuid: Uuid) -> Result<NoteContent> {
    let key = DriveQuery::Note { uuid }.key();
    self
      .cache
      .fetch_with(&key, &self.note_fetcher(uuid), &QueryOptions::default())
      .await
  }

  pub async fn fetch_chats(&self) -> Result<Vec<Chat>> {
    self
      .cache
      .fetch_with(&DriveQuery::Chats.key(), &self.chats_fetcher(), &QueryOptions::default())
      .await
  }

  // ==========================================================================
  // Optimistic updates
  // ==========================================================================

  /// Reflect a locally saved note in the cached note list and body.
  pub fn note_saved(&self, note: Note, content: NoteContent) {
    self.entities.notes.insert(note.clone());

    self.cache.mutate(
      &DriveQuery::Notes.key(),
      Mutation::update(move |notes: Option<Vec<Note>>| {
        let mut notes = notes.unwrap_or_default();
        match notes.iter_mut().find(|n| n.uuid == note.uuid) {
          Some(existing) => *existing = note,
          None => notes.insert(0, note),
        }
        notes
      }),
    );

    let key = DriveQuery::Note { uuid: content.uuid }.key();
    self.cache.set_query_data(&key, content);
    debug!(key = %key, "Applied local note save");
  }

  /// Remove a deleted item from its parent's cached listing.
  pub fn item_removed(&self, parent: Uuid, uuid: Uuid) {
    self.cache.mutate(
      &DriveQuery::DirectoryListing { parent }.key(),
      Mutation::update(move |items: Option<Vec<DriveItem>>| {
        let mut items = items.unwrap_or_default();
        items.retain(|item| item.uuid() != uuid);
        items
      }),
    );
  }
}
