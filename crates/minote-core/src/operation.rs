use crate::{NoteId, OperationId, Timestamp};

/// The eight kinds of queued outbound operations.
#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
)]
pub enum OperationKind {
    NoteCreate,
    CloudUpload,
    CloudDelete,
    ImageUpload,
    AudioUpload,
    FolderCreate,
    FolderRename,
    FolderDelete,
}

impl OperationKind {
    /// Scheduling priority; higher runs first, FIFO within equal priority.
    pub fn priority(self) -> u8 {
        match self {
            OperationKind::CloudDelete => 10,
            OperationKind::NoteCreate => 8,
            OperationKind::FolderDelete => 7,
            OperationKind::FolderCreate => 6,
            OperationKind::CloudUpload => 5,
            OperationKind::FolderRename => 4,
            OperationKind::ImageUpload => 3,
            OperationKind::AudioUpload => 3,
        }
    }

    pub fn is_upload(self) -> bool {
        matches!(
            self,
            OperationKind::NoteCreate
                | OperationKind::CloudUpload
                | OperationKind::ImageUpload
                | OperationKind::AudioUpload
        )
    }

    pub fn is_file_upload(self) -> bool {
        matches!(self, OperationKind::ImageUpload | OperationKind::AudioUpload)
    }
}

#[derive(
    ::bincode::Encode,
    ::bincode::Decode,
    ::serde::Serialize,
    ::serde::Deserialize,
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
)]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A persistent queue row.
///
/// `note_id` is the target entity id: a note id for note operations, a
/// folder id for folder operations, the owning note's id for file
/// uploads. It may be temporary; the processor resolves it through the
/// id-mapping registry before dispatch.
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
pub struct NoteOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub note_id: NoteId,
    /// Opaque handler payload; each handler defines its own encoding.
    pub data: Vec<u8>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Timestamp of the local save that produced this operation; for
    /// coalesced uploads this is the timestamp of the *latest* edit.
    pub local_save_timestamp: Timestamp,
    /// Insertion-order sequence number; FIFO tie-break within a priority.
    pub seq: u64,
    /// Earliest time the processor may attempt this row again;
    /// `Timestamp::ZERO` means immediately.
    pub next_attempt_at: Timestamp,
}

impl NoteOperation {
    pub fn new(kind: OperationKind, note_id: NoteId, data: Vec<u8>) -> Self {
        Self {
            id: OperationId::generate(),
            kind,
            note_id,
            data,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
            local_save_timestamp: Timestamp::now(),
            seq: 0,
            next_attempt_at: Timestamp::ZERO,
        }
    }

    pub fn with_local_save_timestamp(mut self, ts: Timestamp) -> Self {
        self.local_save_timestamp = ts;
        self
    }

    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }
}
