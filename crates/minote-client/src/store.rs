//! The single database writer for notes and folders.
//!
//! Everyone else (UI, sync engine, operation handlers) publishes
//! intents or calls into this store; nothing else touches the `notes`
//! and `folders` tables. This removes the class of races where a sync
//! write could clobber an edit the store was in the middle of applying.
//!
//! Mutations serialize behind one async mutex; reads come straight from
//! the in-memory caches, which are refreshed after every write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use minote_client_db::{Database, DbResult, folders as folders_table, notes as notes_table};
use minote_core::event::{DeleteOrigin, FolderEvent, NoteEvent};
use minote_core::{
    FileId, Folder, FolderId, Note, NoteId, NoteOperation, OperationId, OperationKind, Timestamp,
};
use minote_util_error::{BoxedError, FmtCompact as _};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::bus::EventBus;
use crate::handlers::{DeletePayload, FolderDeletePayload, FolderRenamePayload};
use crate::online::OnlineState;
use crate::processor::OperationProcessor;
use crate::queue::OperationQueue;

const LOG_TARGET: &str = "minote::store";

pub struct NoteStore {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    queue: Arc<OperationQueue>,
    blob: Arc<BlobStore>,

    notes_cache: RwLock<HashMap<NoteId, Note>>,
    folders_cache: RwLock<HashMap<FolderId, Folder>>,
    /// The single note open in an editor right now; protected from
    /// remote overwrites by the sync guard.
    active_editing: Mutex<Option<NoteId>>,

    /// Serializes all mutations.
    write_lock: tokio::sync::Mutex<()>,

    /// Injected after construction; the store triggers immediate
    /// processing after enqueueing while online.
    processor: OnceLock<Arc<OperationProcessor>>,
    online: OnceLock<Arc<OnlineState>>,
}

impl NoteStore {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        queue: Arc<OperationQueue>,
        blob: Arc<BlobStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            queue,
            blob,
            notes_cache: RwLock::new(HashMap::new()),
            folders_cache: RwLock::new(HashMap::new()),
            active_editing: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            processor: OnceLock::new(),
            online: OnceLock::new(),
        })
    }

    /// Two-phase wiring; see the client constructor.
    pub fn set_processor(&self, processor: Arc<OperationProcessor>) {
        let _ = self.processor.set(processor);
    }

    pub fn set_online(&self, online: Arc<OnlineState>) {
        let _ = self.online.set(online);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn note(&self, id: &NoteId) -> Option<Note> {
        self.notes_cache
            .read()
            .expect("Locking failed")
            .get(id)
            .cloned()
    }

    pub fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self
            .notes_cache
            .read()
            .expect("Locking failed")
            .values()
            .cloned()
            .collect();
        notes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        notes
    }

    pub fn folder(&self, id: &FolderId) -> Option<Folder> {
        self.folders_cache
            .read()
            .expect("Locking failed")
            .get(id)
            .cloned()
    }

    /// Folders with their derived note counts.
    pub fn folders(&self) -> Vec<Folder> {
        let counts: HashMap<FolderId, u64> = {
            let notes = self.notes_cache.read().expect("Locking failed");
            let mut counts = HashMap::new();
            for note in notes.values() {
                *counts.entry(note.folder_id.clone()).or_default() += 1;
            }
            counts
        };

        let mut folders: Vec<Folder> = self
            .folders_cache
            .read()
            .expect("Locking failed")
            .values()
            .cloned()
            .map(|mut folder| {
                folder.count = counts.get(&folder.id).copied().unwrap_or_default();
                folder
            })
            .collect();
        folders.sort_by(|a, b| {
            b.is_system
                .cmp(&a.is_system)
                .then(b.is_pinned.cmp(&a.is_pinned))
                .then(a.name.cmp(&b.name))
        });
        folders
    }

    pub fn active_editing_note_id(&self) -> Option<NoteId> {
        self.active_editing.lock().expect("Locking failed").clone()
    }

    pub fn set_active_editing(&self, note_id: Option<NoteId>) {
        *self.active_editing.lock().expect("Locking failed") = note_id;
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Populate the caches from the database, seeding the system folders
    /// on first run.
    pub async fn load_caches(&self) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let (notes, mut folders) = self.db.load_all().await?;

        if folders.iter().all(|f| f.id.as_str() != FolderId::ALL) {
            for (id, name) in [
                (FolderId::all(), "All notes"),
                (FolderId::starred(), "Starred"),
                (FolderId::private(), "Private"),
            ] {
                let folder = Folder {
                    id,
                    name: name.to_owned(),
                    count: 0,
                    is_system: true,
                    is_pinned: false,
                    created_at: Timestamp::now(),
                    tag: None,
                };
                self.db.upsert_folder(&folder).await?;
                folders.push(folder);
            }
        }

        *self.notes_cache.write().expect("Locking failed") =
            notes.into_iter().map(|n| (n.id.clone(), n)).collect();
        *self.folders_cache.write().expect("Locking failed") =
            folders.into_iter().map(|f| (f.id.clone(), f)).collect();

        info!(
            target: LOG_TARGET,
            notes = self.notes_cache.read().expect("Locking failed").len(),
            folders = self.folders_cache.read().expect("Locking failed").len(),
            "Caches loaded"
        );
        Ok(())
    }

    // ========================================================================
    // Note mutations
    // ========================================================================

    /// Create a note locally with a temporary id and queue its upload.
    pub async fn create_note_offline(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        folder_id: FolderId,
    ) -> DbResult<Note> {
        let note = Note::new_offline(title, content, folder_id);
        self.apply_created_note(note.clone()).await?;
        Ok(note)
    }

    /// Persist a note created elsewhere (UI intent) and queue its
    /// upload.
    pub async fn apply_created_note(&self, note: Note) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        self.db.upsert_note(&note).await?;
        self.cache_note(note.clone());

        let op = NoteOperation::new(
            OperationKind::NoteCreate,
            note.id.clone(),
            encode_payload(&note)?,
        )
        .with_local_save_timestamp(note.updated_at);
        let outcome = self.queue.enqueue(op).await?;

        debug!(target: LOG_TARGET, note_id = %note.id, "Created note offline");
        self.bus.publish_note(NoteEvent::Saved(note));
        self.bus.publish_note(NoteEvent::ListChanged);
        drop(_guard);

        self.spawn_immediate(outcome.operation_id().clone());
        Ok(())
    }

    /// Save an edit; at most one upload stays queued per note.
    pub async fn save_note_content(
        &self,
        note_id: &NoteId,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut note) = self.note(note_id) else {
            warn!(target: LOG_TARGET, note_id = %note_id, "Save for unknown note");
            return Ok(());
        };
        note.title = title.into();
        note.content = content.into();
        note.updated_at = Timestamp::now();

        self.db.upsert_note(&note).await?;
        self.cache_note(note.clone());
        self.enqueue_upload(&note).await?;

        self.bus.publish_note(NoteEvent::Saved(note));
        self.bus.publish_note(NoteEvent::ListChanged);
        Ok(())
    }

    /// Color/status/tags updates; each one rides the same coalesced
    /// upload.
    pub async fn update_note_metadata(
        &self,
        note_id: &NoteId,
        color_id: Option<i64>,
        status: Option<String>,
        tags: Option<Vec<String>>,
    ) -> DbResult<()> {
        self.mutate_note(note_id, move |note| {
            if let Some(color_id) = color_id {
                note.color_id = color_id;
            }
            if let Some(status) = status {
                note.status = status;
            }
            if let Some(tags) = tags {
                note.tags = tags;
            }
        })
        .await
    }

    pub async fn move_note(&self, note_id: &NoteId, folder_id: FolderId) -> DbResult<()> {
        self.mutate_note(note_id, move |note| {
            note.folder_id = folder_id;
        })
        .await
    }

    pub async fn set_note_starred(&self, note_id: &NoteId, starred: bool) -> DbResult<()> {
        self.mutate_note(note_id, move |note| {
            note.is_starred = starred;
        })
        .await
    }

    async fn mutate_note(
        &self,
        note_id: &NoteId,
        f: impl FnOnce(&mut Note),
    ) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut note) = self.note(note_id) else {
            warn!(target: LOG_TARGET, note_id = %note_id, "Metadata update for unknown note");
            return Ok(());
        };
        f(&mut note);
        note.updated_at = Timestamp::now();

        self.db.upsert_note(&note).await?;
        self.cache_note(note.clone());
        self.enqueue_upload(&note).await?;

        self.bus.publish_note(NoteEvent::Saved(note));
        self.bus.publish_note(NoteEvent::ListChanged);
        Ok(())
    }

    /// Delete a note.
    ///
    /// User deletions of server-known notes queue a `CloudDelete` with
    /// the note's version tag; temporary notes only need their queued
    /// operations cancelled. Cloud deletions never go back out.
    pub async fn delete_note(&self, note_id: &NoteId, origin: DeleteOrigin) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let note = self.note(note_id);
        self.db.delete_note(note_id).await?;
        self.notes_cache
            .write()
            .expect("Locking failed")
            .remove(note_id);

        // Whatever was queued for this note is moot now.
        self.queue.cancel_operations(note_id).await?;

        let mut immediate = None;
        if origin == DeleteOrigin::User && !note_id.is_temporary() {
            if let Some(tag) = note.as_ref().and_then(|n| n.server_tag.clone()) {
                let op = NoteOperation::new(
                    OperationKind::CloudDelete,
                    note_id.clone(),
                    encode_payload(&DeletePayload { tag, purge: false })?,
                );
                immediate = Some(self.queue.enqueue(op).await?);
            }
        }

        debug!(target: LOG_TARGET, note_id = %note_id, ?origin, "Deleted note");
        self.bus.publish_note(NoteEvent::ListChanged);
        drop(_guard);

        if let Some(outcome) = immediate {
            self.spawn_immediate(outcome.operation_id().clone());
        }
        Ok(())
    }

    /// A note arrived from the cloud (already vetted by the sync guard).
    pub async fn apply_downloaded_note(&self, note: Note) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        self.db.upsert_note(&note).await?;
        self.cache_note(note.clone());

        self.bus.publish_note(NoteEvent::Saved(note));
        self.bus.publish_note(NoteEvent::ListChanged);
        Ok(())
    }

    /// Record the server-issued version tag after a successful push.
    pub async fn set_note_server_tag(&self, note_id: &NoteId, tag: String) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        // Right after an id cutover the cache may still be keyed by the
        // old id; the row itself is already renamed.
        let note = match self.note(note_id) {
            Some(note) => Some(note),
            None => self.db.get_note(note_id).await?,
        };
        let Some(mut note) = note else {
            return Ok(());
        };
        note.server_tag = Some(tag);
        self.db.upsert_note(&note).await?;
        self.cache_note(note);
        Ok(())
    }

    /// Substring-rewrite an attachment reference inside a note's content
    /// and queue the note for upload again.
    ///
    /// Known limitation: a file id that happens to be a substring of
    /// other content is rewritten too; the content format is opaque
    /// here, so no smarter policy is possible.
    pub async fn rewrite_attachment_reference(
        &self,
        note_id: &NoteId,
        old_file_id: &FileId,
        new_file_id: &FileId,
    ) -> DbResult<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(mut note) = self.note(note_id) else {
            return Ok(false);
        };

        let mut changed = false;
        if note.content.contains(old_file_id.as_str()) {
            note.content = note
                .content
                .replace(old_file_id.as_str(), new_file_id.as_str());
            changed = true;
        }
        for attachment in &mut note.attachments {
            if attachment.file_id == *old_file_id {
                attachment.file_id = new_file_id.clone();
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        note.updated_at = Timestamp::now();
        self.db.upsert_note(&note).await?;
        self.cache_note(note.clone());
        self.enqueue_upload(&note).await?;

        debug!(
            target: LOG_TARGET,
            note_id = %note_id,
            old_file_id = %old_file_id,
            new_file_id = %new_file_id,
            "Rewrote attachment reference"
        );
        self.bus.publish_note(NoteEvent::Saved(note));
        Ok(true)
    }

    // ========================================================================
    // Folder mutations
    // ========================================================================

    pub async fn create_folder(&self, name: impl Into<String>) -> DbResult<Folder> {
        let folder = Folder::new_offline(name);
        self.apply_created_folder(folder.clone()).await?;
        Ok(folder)
    }

    pub async fn apply_created_folder(&self, folder: Folder) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        self.db.upsert_folder(&folder).await?;
        self.cache_folder(folder.clone());

        let op = NoteOperation::new(
            OperationKind::FolderCreate,
            NoteId::new(folder.id.as_str()),
            encode_payload(&folder)?,
        );
        let outcome = self.queue.enqueue(op).await?;

        debug!(target: LOG_TARGET, folder_id = %folder.id, "Created folder offline");
        self.bus.publish_folder(FolderEvent::Saved(folder));
        self.bus.publish_folder(FolderEvent::ListChanged);
        drop(_guard);

        self.spawn_immediate(outcome.operation_id().clone());
        Ok(())
    }

    pub async fn rename_folder(&self, folder_id: &FolderId, name: impl Into<String>) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut folder) = self.folder(folder_id) else {
            warn!(target: LOG_TARGET, folder_id = %folder_id, "Rename for unknown folder");
            return Ok(());
        };
        if folder.is_system {
            warn!(target: LOG_TARGET, folder_id = %folder_id, "Refusing to rename system folder");
            return Ok(());
        }
        folder.name = name.into();

        self.db.upsert_folder(&folder).await?;
        self.cache_folder(folder.clone());

        let op = NoteOperation::new(
            OperationKind::FolderRename,
            NoteId::new(folder.id.as_str()),
            encode_payload(&FolderRenamePayload {
                name: folder.name.clone(),
            })?,
        );
        let outcome = self.queue.enqueue(op).await?;

        self.bus.publish_folder(FolderEvent::Saved(folder));
        self.bus.publish_folder(FolderEvent::ListChanged);
        drop(_guard);

        self.spawn_immediate(outcome.operation_id().clone());
        Ok(())
    }

    pub async fn delete_folder(&self, folder_id: &FolderId, origin: DeleteOrigin) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let Some(folder) = self.folder(folder_id) else {
            return Ok(());
        };
        if folder.is_system {
            warn!(target: LOG_TARGET, folder_id = %folder_id, "Refusing to delete system folder");
            return Ok(());
        }

        self.db.delete_folder(folder_id).await?;
        self.folders_cache
            .write()
            .expect("Locking failed")
            .remove(folder_id);

        let queue_id = NoteId::new(folder_id.as_str());
        self.queue.cancel_operations(&queue_id).await?;

        let mut immediate = None;
        if origin == DeleteOrigin::User && !folder_id.is_temporary() {
            if let Some(tag) = folder.tag.clone() {
                let op = NoteOperation::new(
                    OperationKind::FolderDelete,
                    queue_id,
                    encode_payload(&FolderDeletePayload { tag })?,
                );
                immediate = Some(self.queue.enqueue(op).await?);
            }
        }

        debug!(target: LOG_TARGET, folder_id = %folder_id, ?origin, "Deleted folder");
        self.bus.publish_folder(FolderEvent::ListChanged);
        drop(_guard);

        if let Some(outcome) = immediate {
            self.spawn_immediate(outcome.operation_id().clone());
        }
        Ok(())
    }

    /// Record the server-issued version tag after a successful folder
    /// push.
    pub async fn set_folder_server_tag(&self, folder_id: &FolderId, tag: String) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let Some(mut folder) = self.folder(folder_id) else {
            return Ok(());
        };
        folder.tag = Some(tag);
        self.db.upsert_folder(&folder).await?;
        self.cache_folder(folder);
        Ok(())
    }

    /// A folder arrived from the cloud.
    pub async fn apply_folder_saved(&self, folder: Folder) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        self.db.upsert_folder(&folder).await?;
        self.cache_folder(folder.clone());

        self.bus.publish_folder(FolderEvent::Saved(folder));
        self.bus.publish_folder(FolderEvent::ListChanged);
        Ok(())
    }

    pub async fn apply_folder_batch(&self, folders: Vec<Folder>) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        for folder in &folders {
            self.db.upsert_folder(folder).await?;
            self.cache_folder(folder.clone());
        }
        self.bus.publish_folder(FolderEvent::ListChanged);
        Ok(())
    }

    // ========================================================================
    // Id migrations
    // ========================================================================

    /// The registry renamed a note row; rotate the cache and the
    /// active-editing pointer.
    pub async fn handle_note_id_migrated(&self, old_id: &NoteId, new_id: &NoteId) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        {
            let mut active = self.active_editing.lock().expect("Locking failed");
            if active.as_ref() == Some(old_id) {
                *active = Some(new_id.clone());
                debug!(target: LOG_TARGET, old_id = %old_id, new_id = %new_id, "Rotated active-editing pointer");
            }
        }

        let migrated = self.db.get_note(new_id).await?;
        {
            let mut cache = self.notes_cache.write().expect("Locking failed");
            cache.remove(old_id);
            if let Some(note) = migrated {
                cache.insert(new_id.clone(), note);
            }
        }

        self.bus.publish_note(NoteEvent::ListChanged);
        Ok(())
    }

    /// The registry renamed a folder row; rewrite every note's folder
    /// reference and move the attachment directory inside the same
    /// critical section.
    pub async fn handle_folder_id_migrated(
        &self,
        old_id: &FolderId,
        new_id: &FolderId,
    ) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        let moved = self
            .db
            .write_with(|tx| {
                let mut notes = tx.open_table(&notes_table::TABLE)?;
                Database::update_notes_folder_id_tx(old_id, new_id, &mut notes)
            })
            .await?;

        if let Err(err) = self.blob.rename_folder_dir(old_id, new_id).await {
            warn!(
                target: LOG_TARGET,
                err = %err.fmt_compact(),
                old_id = %old_id,
                "Attachment directory rename failed"
            );
        }

        {
            let mut folders = self.folders_cache.write().expect("Locking failed");
            if let Some(folder) = folders.remove(old_id) {
                folders.insert(new_id.clone(), folder);
            }
        }
        {
            let mut notes = self.notes_cache.write().expect("Locking failed");
            for note in notes.values_mut() {
                if &note.folder_id == old_id {
                    note.folder_id = new_id.clone();
                }
            }
        }

        info!(
            target: LOG_TARGET,
            old_id = %old_id,
            new_id = %new_id,
            moved,
            "Folder id migrated"
        );
        self.bus.publish_folder(FolderEvent::ListChanged);
        self.bus.publish_note(NoteEvent::ListChanged);
        Ok(())
    }

    // ========================================================================
    // Full sync support
    // ========================================================================

    /// Clear everything the cloud will re-send: non-system folders and
    /// non-temporary notes. Temporary-id notes are local-only work and
    /// survive.
    pub async fn clear_for_full_sync(&self) -> DbResult<()> {
        let _guard = self.write_lock.lock().await;

        self.db
            .write_with(|tx| {
                let mut notes = tx.open_table(&notes_table::TABLE)?;
                for note in Database::list_notes_tx(&notes)? {
                    if !note.id.is_temporary() {
                        Database::delete_note_tx(&note.id, &mut notes)?;
                    }
                }

                let mut folders = tx.open_table(&folders_table::TABLE)?;
                for folder in Database::list_folders_tx(&folders)? {
                    if !folder.is_system && !folder.id.is_temporary() {
                        Database::delete_folder_tx(&folder.id, &mut folders)?;
                    }
                }
                Ok(())
            })
            .await?;

        self.notes_cache
            .write()
            .expect("Locking failed")
            .retain(|id, _| id.is_temporary());
        self.folders_cache
            .write()
            .expect("Locking failed")
            .retain(|id, folder| folder.is_system || id.is_temporary());

        info!(target: LOG_TARGET, "Cleared local state for full sync");
        self.bus.publish_note(NoteEvent::ListChanged);
        self.bus.publish_folder(FolderEvent::ListChanged);
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn cache_note(&self, note: Note) {
        self.notes_cache
            .write()
            .expect("Locking failed")
            .insert(note.id.clone(), note);
    }

    fn cache_folder(&self, folder: Folder) {
        self.folders_cache
            .write()
            .expect("Locking failed")
            .insert(folder.id.clone(), folder);
    }

    async fn enqueue_upload(&self, note: &Note) -> DbResult<()> {
        let op = NoteOperation::new(
            OperationKind::CloudUpload,
            note.id.clone(),
            encode_payload(note)?,
        )
        .with_local_save_timestamp(note.updated_at);
        let outcome = self.queue.enqueue(op).await?;
        self.spawn_immediate(outcome.operation_id().clone());
        Ok(())
    }

    /// While online, poke the processor right away instead of waiting
    /// for the next drain tick.
    fn spawn_immediate(&self, op_id: OperationId) {
        let is_online = self
            .online
            .get()
            .map(|online| online.is_online())
            .unwrap_or(false);
        if !is_online {
            return;
        }
        let Some(processor) = self.processor.get().cloned() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(err) = processor.process_immediately(&op_id).await {
                debug!(
                    target: LOG_TARGET,
                    op_id = %op_id,
                    err = %err.fmt_compact(),
                    "Immediate processing failed; the drain loop will retry"
                );
            }
        });
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    Ok(serde_json::to_vec(value).map_err(|err| Box::new(err) as BoxedError)?)
}
