use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decrypted directory metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
  pub uuid: Uuid,
  pub name: String,
  pub parent: Option<Uuid>,
  pub color: Option<String>,
  pub favorited: bool,
  /// Creation time, unix millis
  pub timestamp: i64,
}

/// Decrypted file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveFile {
  pub uuid: Uuid,
  pub name: String,
  pub parent: Uuid,
  pub size: u64,
  pub mime: String,
  pub favorited: bool,
  /// Last modification time, unix millis
  pub last_modified: i64,
}

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriveItem {
  Directory(Directory),
  File(DriveFile),
}

impl DriveItem {
  pub fn uuid(&self) -> Uuid {
    match self {
      DriveItem::Directory(d) => d.uuid,
      DriveItem::File(f) => f.uuid,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      DriveItem::Directory(d) => &d.name,
      DriveItem::File(f) => &f.name,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
  Text,
  Md,
  Code,
  Rich,
  Checklist,
}

/// Note summary for list views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
  pub uuid: Uuid,
  pub title: String,
  pub preview: String,
  pub note_type: NoteType,
  pub pinned: bool,
  pub trash: bool,
  pub archive: bool,
  pub edited_timestamp: i64,
}

/// Full decrypted note body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteContent {
  pub uuid: Uuid,
  pub content: String,
  pub note_type: NoteType,
  pub edited_timestamp: i64,
}

/// Chat conversation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
  pub uuid: Uuid,
  pub name: Option<String>,
  pub participants: Vec<String>,
  pub last_message: Option<String>,
  pub last_message_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
  pub uuid: Uuid,
  pub conversation: Uuid,
  pub sender: String,
  pub message: String,
  pub sent_timestamp: i64,
}
