//! Database table definitions for the minote client.
//!
//! # Data Model Overview
//!
//! The database is the durable half of the offline-first engine: the
//! local mirror of notes and folders, the persistent operation queue of
//! not-yet-pushed local intents, and the temporary-to-canonical id
//! mapping table that lets the client keep working with ids it invented
//! before the server issued real ones.
//!
//! ## Key Concepts
//!
//! - **Note / Folder**: local mirror rows. The note store is the only
//!   writer of these two tables; everyone else publishes intents.
//! - **Operation**: a pending outbound mutation, keyed by its own id and
//!   carrying an insertion-order `seq` for FIFO tie-breaks within a
//!   priority class.
//! - **Id mapping**: `(local id → server id)` aliases. A mapping row must
//!   survive restarts so that an interrupted reference rewrite can be
//!   re-run (it is idempotent) before the row is marked completed.
//! - **Sync status**: a singleton carrying the committed server cursor.
//!   The cursor is only committed when no pending uploads remain, so a
//!   crash between upload and cursor advance never loses work.

use minote_core::{EntityKind, Folder, FolderId, Note, NoteId, NoteOperation, OperationId, Timestamp};
use serde::Serialize;

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

// ============================================================================
// ENTITY TABLES
// ============================================================================

def_table! {
    /// Local mirror of notes, keyed by note id.
    ///
    /// The id inside the record always equals the key. Rows with a
    /// temporary id are local-only; a pending `NoteCreate` operation or
    /// an incomplete id mapping always exists for them.
    notes: NoteId => Note
}

def_table! {
    /// Local mirror of folders, keyed by folder id.
    ///
    /// System folders ("0", "2", "starred") are seeded locally and are
    /// never deleted or uploaded.
    folders: FolderId => Folder
}

def_table! {
    /// User-defined ordering of folders in the sidebar.
    folder_sort_info: () => FolderSortRecord
}

// ============================================================================
// SYNC TABLES
// ============================================================================

def_table! {
    /// Singleton sync cursor + last successful sync time.
    sync_status: () => SyncStatusRecord
}

def_table! {
    /// Persistent queue of pending outbound operations.
    ///
    /// Scheduling order is computed at read time: (priority desc, seq
    /// asc). The queue stays small (one coalesced upload per note), so a
    /// full scan per drain is fine.
    note_operations: OperationId => NoteOperation
}

def_table! {
    /// Temporary-id to server-id aliases, keyed by the raw local id.
    ///
    /// A row with `completed = false` means the reference rewrite may not
    /// have finished; startup re-runs it (idempotent) and then marks the
    /// row completed, after which it may be garbage-collected.
    id_mappings: String => IdMappingRecord
}

/// Singleton record in [`sync_status`].
#[derive(Debug, ::bincode::Encode, ::bincode::Decode, Clone, Default, Serialize)]
pub struct SyncStatusRecord {
    pub last_sync_time: Timestamp,
    /// Committed server cursor; `None` means "never synced" and forces a
    /// full sync.
    pub sync_tag: Option<String>,
}

/// One temporary-to-canonical id alias.
#[derive(Debug, ::bincode::Encode, ::bincode::Decode, Clone, Serialize)]
pub struct IdMappingRecord {
    pub server_id: String,
    pub entity: EntityKind,
    pub created_at: Timestamp,
    /// True once every reference (entity row, queued operations) has been
    /// rewritten to the server id.
    pub completed: bool,
}

/// Sidebar ordering of folder ids.
#[derive(Debug, ::bincode::Encode, ::bincode::Decode, Clone, Default, Serialize)]
pub struct FolderSortRecord {
    pub order: Vec<FolderId>,
}
