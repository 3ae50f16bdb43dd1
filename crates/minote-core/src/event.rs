//! Typed events exchanged over the client's event bus.
//!
//! Data flow is strictly event-oriented: the UI and the sync engine emit
//! *intent* events (`Created`, `ContentUpdated`, `NoteDownloaded`,
//! `FolderSaved`, …); the note store is the only component that applies
//! them to the database and republishes *result* events (`Saved`,
//! `ListChanged`).

use crate::{EntityKind, Folder, FolderId, Note, NoteId};

/// Who asked for a deletion.
///
/// User deletions must be propagated to the cloud; cloud deletions are
/// already server truth and only remove local state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeleteOrigin {
    User,
    Cloud,
}

#[derive(Clone, Debug)]
pub enum NoteEvent {
    /// Intent: persist a freshly created note (id may be temporary).
    Created(Note),
    /// Intent: replace title/content of an existing note.
    ContentUpdated {
        note_id: NoteId,
        title: String,
        content: String,
    },
    /// Intent: update color/status/tags.
    MetadataUpdated {
        note_id: NoteId,
        color_id: Option<i64>,
        status: Option<String>,
        tags: Option<Vec<String>>,
    },
    /// Intent: delete a note.
    Deleted { note_id: NoteId, origin: DeleteOrigin },
    /// Intent: move a note to another folder.
    Moved { note_id: NoteId, folder_id: FolderId },
    /// Intent: star or unstar a note.
    Starred { note_id: NoteId, starred: bool },
    /// Result: a note row was written.
    Saved(Note),
    /// Result: the visible note list changed.
    ListChanged,
    /// Result: a temporary id was replaced by a server id.
    IdMigrated { old_id: NoteId, new_id: NoteId },
}

#[derive(Clone, Debug)]
pub enum FolderEvent {
    /// Intent: persist a freshly created folder (id may be temporary).
    Created(Folder),
    /// Intent: rename a folder.
    Renamed { folder_id: FolderId, name: String },
    /// Intent: delete a folder.
    Deleted {
        folder_id: FolderId,
        origin: DeleteOrigin,
    },
    /// Intent (from sync): a folder arrived from the cloud.
    FolderSaved(Folder),
    /// Intent (from sync): several folders arrived from the cloud.
    BatchSaved(Vec<Folder>),
    /// Result: a temporary folder id was replaced by a server id.
    FolderIdMigrated { old_id: FolderId, new_id: FolderId },
    /// Result: a folder row was written.
    Saved(Folder),
    /// Result: the folder list changed.
    ListChanged,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Full { force_redownload: bool },
}

#[derive(Clone, Debug)]
pub enum SyncEvent {
    Requested { mode: SyncMode },
    Started { mode: SyncMode },
    Progress { current: usize, total: usize },
    /// Intent: a note (with resolved attachments) arrived from the cloud.
    NoteDownloaded(Note),
    TagUpdated { tag: String },
    Completed { downloaded_count: usize },
    Failed { message: String },
}

#[derive(Clone, Debug)]
pub enum AuthEvent {
    /// A fresh service token was minted.
    CookieRefreshed,
    /// The session cookie is no longer accepted by the server.
    CookieExpired,
    /// A refresh attempt failed; after a bounded number of consecutive
    /// failures the user must sign in again.
    TokenRefreshFailed { message: String },
}

#[derive(Clone, Debug)]
pub enum OnlineEvent {
    /// Edge-triggered: published only when the aggregate online flag flips.
    StatusChanged(bool),
}

#[derive(Clone, Debug)]
pub enum ErrorEvent {
    StorageFailed { message: String },
}

#[derive(Clone, Debug)]
pub enum IdMappingEvent {
    MappingCompleted {
        local_id: String,
        server_id: String,
        entity: EntityKind,
    },
}

/// Published once the startup sequence finished, successfully or not.
#[derive(Clone, Debug)]
pub enum StartupEvent {
    Completed {
        success: bool,
        errors: Vec<String>,
        duration_ms: u64,
    },
}
