//! Remote drive client interface.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::types::{Chat, ChatMessage, DriveItem, Note, NoteContent};

/// Authenticated SDK client: network transport and decryption.
///
/// Every call takes an optional cancellation token; implementations should
/// abort promptly once it fires.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  /// Directories and files directly under `parent`
  async fn list_directory(&self, parent: Uuid, cancel: Option<CancellationToken>) -> Result<Vec<DriveItem>>;

  async fn notes(&self, cancel: Option<CancellationToken>) -> Result<Vec<Note>>;

  async fn note_content(&self, uuid: Uuid, cancel: Option<CancellationToken>) -> Result<NoteContent>;

  async fn chats(&self, cancel: Option<CancellationToken>) -> Result<Vec<Chat>>;

  async fn chat_messages(&self, conversation: Uuid, cancel: Option<CancellationToken>) -> Result<Vec<ChatMessage>>;

  /// Encoded thumbnail image of a file
  async fn file_thumbnail(&self, uuid: Uuid, cancel: Option<CancellationToken>) -> Result<Vec<u8>>;
}

/// Holder for the authenticated client handle.
///
/// Filled by setup once stored credentials resolve, cleared on logout.
/// Fetchers read it at fetch time.
#[derive(Clone, Default)]
pub struct ClientSlot {
  inner: Arc<RwLock<Option<Arc<dyn RemoteClient>>>>,
}

impl ClientSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn install(&self, client: Arc<dyn RemoteClient>) {
    *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
    info!("Installed authenticated client");
  }

  pub fn get(&self) -> Option<Arc<dyn RemoteClient>> {
    self
      .inner
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn is_installed(&self) -> bool {
    self
      .inner
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }

  pub fn clear(&self) {
    self
      .inner
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
  }
}

impl std::fmt::Debug for ClientSlot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientSlot")
      .field("installed", &self.is_installed())
      .finish()
  }
}
