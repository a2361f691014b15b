//! Caching implementations for drive types.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{Entity, EntityCache};
use crate::query::QueryKey;

use super::types::{Chat, Directory, DriveFile, DriveItem, Note};

// ============================================================================
// Entity implementations
// ============================================================================

impl Entity for Directory {
  fn uuid(&self) -> Uuid {
    self.uuid
  }

  fn kind() -> &'static str {
    "directory"
  }
}

impl Entity for DriveFile {
  fn uuid(&self) -> Uuid {
    self.uuid
  }

  fn kind() -> &'static str {
    "file"
  }
}

impl Entity for Note {
  fn uuid(&self) -> Uuid {
    self.uuid
  }

  fn kind() -> &'static str {
    "note"
  }
}

impl Entity for Chat {
  fn uuid(&self) -> Uuid {
    self.uuid
  }

  fn kind() -> &'static str {
    "chat"
  }
}

/// One entity cache per kind.
#[derive(Default)]
pub struct EntityCaches {
  pub directories: EntityCache<Directory>,
  pub files: EntityCache<DriveFile>,
  pub notes: EntityCache<Note>,
  pub chats: EntityCache<Chat>,
}

impl EntityCaches {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record every entity of a directory listing.
  pub fn record_listing(&self, items: &[DriveItem]) {
    for item in items {
      match item {
        DriveItem::Directory(dir) => self.directories.insert(dir.clone()),
        DriveItem::File(file) => self.files.insert(file.clone()),
      }
    }
  }

  /// Drop every cached entity (logout).
  pub fn reset(&self) {
    self.directories.reset();
    self.files.reset();
    self.notes.reset();
    self.chats.reset();
    debug!("Reset entity caches");
  }
}

// ============================================================================
// Query families
// ============================================================================

pub const DIRECTORY_LISTING: &str = "directory_listing";
pub const NOTES: &str = "notes";
pub const NOTE: &str = "note";
pub const CHATS: &str = "chats";
pub const CHAT_MESSAGES: &str = "chat_messages";
pub const FILE_THUMBNAIL: &str = "file_thumbnail";

/// Query names whose persisted records are restored on startup.
pub const KNOWN_QUERIES: &[&str] = &[DIRECTORY_LISTING, NOTES, NOTE, CHATS, CHAT_MESSAGES];

/// Binary payloads, never persisted.
pub const VOLATILE_QUERIES: &[&str] = &[FILE_THUMBNAIL];

/// Query key types for drive calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveQuery {
  /// Items directly under a directory
  DirectoryListing { parent: Uuid },
  /// All notes
  Notes,
  /// Decrypted body of one note
  Note { uuid: Uuid },
  /// All chat conversations
  Chats,
  /// Messages of one conversation
  ChatMessages { conversation: Uuid },
  /// Thumbnail of one file
  FileThumbnail { uuid: Uuid },
}

impl DriveQuery {
  pub fn name(&self) -> &'static str {
    match self {
      Self::DirectoryListing { .. } => DIRECTORY_LISTING,
      Self::Notes => NOTES,
      Self::Note { .. } => NOTE,
      Self::Chats => CHATS,
      Self::ChatMessages { .. } => CHAT_MESSAGES,
      Self::FileThumbnail { .. } => FILE_THUMBNAIL,
    }
  }

  pub fn key(&self) -> QueryKey {
    let params = match self {
      Self::DirectoryListing { parent } => json!({ "parent": parent }),
      Self::Note { uuid } | Self::FileThumbnail { uuid } => json!({ "uuid": uuid }),
      Self::ChatMessages { conversation } => json!({ "conversation": conversation }),
      Self::Notes | Self::Chats => serde_json::Value::Null,
    };
    QueryKey::new(self.name(), params)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_query_keys() {
    let parent = Uuid::nil();
    assert_eq!(
      DriveQuery::DirectoryListing { parent }.key().cache_key(),
      "directory_listing:{\"parent\":\"00000000-0000-0000-0000-000000000000\"}"
    );
    assert_eq!(DriveQuery::Notes.key().cache_key(), "notes:null");
    assert_eq!(DriveQuery::Notes.key(), QueryKey::simple(NOTES));
  }

  #[test]
  fn test_record_listing_and_reset() {
    let caches = EntityCaches::new();
    let dir = Directory {
      uuid: Uuid::new_v4(),
      name: "Photos".into(),
      parent: None,
      color: None,
      favorited: false,
      timestamp: 0,
    };
    let file = DriveFile {
      uuid: Uuid::new_v4(),
      name: "cat.jpg".into(),
      parent: dir.uuid,
      size: 1024,
      mime: "image/jpeg".into(),
      favorited: true,
      last_modified: 0,
    };

    caches.record_listing(&[DriveItem::Directory(dir.clone()), DriveItem::File(file.clone())]);
    assert_eq!(caches.directories.get(&dir.uuid), Some(dir));
    assert_eq!(caches.files.get(&file.uuid), Some(file));

    caches.reset();
    assert!(caches.directories.is_empty());
    assert!(caches.files.is_empty());
  }
}
