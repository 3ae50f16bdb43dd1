use crate::{FileId, FolderId, NoteId, Timestamp};

/// A reference to an attachment carried in a note's `setting.data` array.
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct AttachmentRef {
    #[serde(rename = "fileId")]
    pub file_id: FileId,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

/// A note as stored locally.
///
/// The `id` is never mutated in place: id changes (temporary to
/// server-issued) are performed by inserting a new row and deleting the
/// old one atomically.
///
/// Invariants:
/// - `updated_at >= created_at`
/// - `server_tag` is `None` for notes never uploaded
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    /// Opaque document blob; the sync engine only ever substring-scans it
    /// for attachment markers.
    pub content: String,
    pub folder_id: FolderId,
    pub is_starred: bool,
    pub color_id: i64,
    pub status: String,
    /// Ordered, duplicate-free.
    pub tags: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Server-issued version token; required for updates and deletes.
    pub server_tag: Option<String>,
    /// Parsed `setting.data` attachment references.
    pub attachments: Vec<AttachmentRef>,
}

impl Note {
    pub const STATUS_NORMAL: &str = "normal";
    pub const STATUS_DELETED: &str = "deleted";

    /// Build a note created offline, with a fresh temporary id.
    pub fn new_offline(title: impl Into<String>, content: impl Into<String>, folder_id: FolderId) -> Self {
        let now = Timestamp::now();
        Self {
            id: NoteId::generate_temporary(),
            title: title.into(),
            content: content.into(),
            folder_id,
            is_starred: false,
            color_id: 0,
            status: Self::STATUS_NORMAL.to_owned(),
            tags: vec![],
            created_at: now,
            updated_at: now,
            server_tag: None,
            attachments: vec![],
        }
    }

    /// Replace the note's id, preserving everything else.
    pub fn with_id(mut self, id: NoteId) -> Self {
        self.id = id;
        self
    }
}

/// A folder as stored locally.
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    /// Derived note count; refreshed by the store, not authoritative.
    pub count: u64,
    pub is_system: bool,
    pub is_pinned: bool,
    pub created_at: Timestamp,
    /// Server-issued version token.
    pub tag: Option<String>,
}

impl Folder {
    /// Build a folder created offline, with a fresh temporary id.
    pub fn new_offline(name: impl Into<String>) -> Self {
        Self {
            id: FolderId::generate_temporary(),
            name: name.into(),
            count: 0,
            is_system: false,
            is_pinned: false,
            created_at: Timestamp::now(),
            tag: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_note_invariants() {
        let note = Note::new_offline("A", "x", FolderId::all());
        assert!(note.id.is_temporary());
        assert!(note.created_at <= note.updated_at);
        assert_eq!(note.server_tag, None);
        assert_eq!(note.status, Note::STATUS_NORMAL);
    }

    #[test]
    fn attachment_ref_serde_field_names() {
        let a = AttachmentRef {
            file_id: FileId::new("f1"),
            mime_type: "image/png".into(),
            size: 7,
        };
        let v = serde_json::to_value(&a).expect("serializes");
        assert_eq!(v["fileId"], "f1");
        assert_eq!(v["mimeType"], "image/png");
        assert_eq!(v["size"], 7);
    }
}
