//! Temporary-to-canonical id resolution.
//!
//! Deliberately *not* an isolation boundary: resolution is called
//! synchronously from event handlers and from the operation processor,
//! and funneling those through an actor queue caused suspension fan-out
//! deadlocks. A short-held mutex over the small in-memory alias cache is
//! all the protection the state needs; durable writes go through the
//! database like everyone else's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use minote_client_db::{Database, DbResult, folders, note_operations, notes};
use minote_core::event::{FolderEvent, IdMappingEvent, NoteEvent};
use minote_core::{EntityKind, FileId, FolderId, NoteId, id::is_temporary_id};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::store::NoteStore;

const LOG_TARGET: &str = "minote::idmap";

pub struct IdMappingRegistry {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    config: ClientConfig,
    /// local id → server id, for synchronous resolution.
    cache: Mutex<HashMap<String, String>>,
}

impl IdMappingRegistry {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Populate the cache from the durable table.
    pub async fn load(&self) -> DbResult<usize> {
        let mappings = self.db.all_mappings().await?;
        let mut cache = self.cache.lock().expect("Locking failed");
        cache.clear();
        for (local, record) in &mappings {
            cache.insert(local.clone(), record.server_id.clone());
        }
        Ok(mappings.len())
    }

    /// Resolve an id through the alias table; non-temporary ids and
    /// unmapped temporaries come back unchanged. Synchronous by design.
    pub fn resolve_id(&self, id: &str) -> String {
        if !is_temporary_id(id) {
            return id.to_owned();
        }
        self.cache
            .lock()
            .expect("Locking failed")
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_owned())
    }

    pub fn resolve_note_id(&self, id: &NoteId) -> NoteId {
        NoteId::new(self.resolve_id(id.as_str()))
    }

    /// Whether a mapping for this temporary id is known.
    pub fn has_mapping(&self, id: &str) -> bool {
        self.cache.lock().expect("Locking failed").contains_key(id)
    }

    /// Persist and cache a fresh alias; idempotent for the same pair.
    pub async fn register_mapping(
        &self,
        local_id: &str,
        server_id: &str,
        entity: EntityKind,
    ) -> DbResult<()> {
        self.db.register_mapping(local_id, server_id, entity).await?;
        self.cache
            .lock()
            .expect("Locking failed")
            .insert(local_id.to_owned(), server_id.to_owned());
        info!(target: LOG_TARGET, local_id, server_id, ?entity, "Registered id mapping");
        Ok(())
    }

    /// The atomic cutover: rename the entity row and rewrite every
    /// queued operation in one transaction, then announce the migration.
    ///
    /// Idempotent: re-running after a crash re-applies whatever half is
    /// left and publishes again; subscribers treat the events as
    /// level-resetting.
    pub async fn update_all_references(&self, local_id: &str, server_id: &str) -> DbResult<()> {
        let Some(record) = self.db.get_mapping(local_id).await? else {
            warn!(target: LOG_TARGET, local_id, "No mapping to apply");
            return Ok(());
        };

        let bus = self.bus.clone();
        let local = local_id.to_owned();
        let server = server_id.to_owned();
        let entity = record.entity;

        self.db
            .write_with(move |tx| {
                match entity {
                    EntityKind::Note => {
                        let mut notes_table = tx.open_table(&notes::TABLE)?;
                        Database::rename_note_id_tx(
                            &NoteId::new(local.clone()),
                            &NoteId::new(server.clone()),
                            &mut notes_table,
                        )?;
                    }
                    EntityKind::Folder => {
                        let mut folders_table = tx.open_table(&folders::TABLE)?;
                        Database::rename_folder_id_tx(
                            &FolderId::new(local.clone()),
                            &FolderId::new(server.clone()),
                            &mut folders_table,
                        )?;
                    }
                    EntityKind::File => {
                        // File ids live inside note content; the content
                        // rewrite is handled by the polling remap.
                    }
                }

                let mut ops_table = tx.open_table(&note_operations::TABLE)?;
                let rewritten = Database::update_note_id_in_pending_operations_tx(
                    &NoteId::new(local.clone()),
                    &NoteId::new(server.clone()),
                    &mut ops_table,
                )?;

                tx.on_commit(move || {
                    debug!(
                        target: LOG_TARGET,
                        local_id = %local,
                        server_id = %server,
                        rewritten,
                        "Applied id cutover"
                    );
                    match entity {
                        EntityKind::Note => bus.publish_note(NoteEvent::IdMigrated {
                            old_id: NoteId::new(local.clone()),
                            new_id: NoteId::new(server.clone()),
                        }),
                        EntityKind::Folder => bus.publish_folder(FolderEvent::FolderIdMigrated {
                            old_id: FolderId::new(local.clone()),
                            new_id: FolderId::new(server.clone()),
                        }),
                        EntityKind::File => {}
                    }
                    bus.publish_id_mapping(IdMappingEvent::MappingCompleted {
                        local_id: local.clone(),
                        server_id: server.clone(),
                        entity,
                    });
                });

                Ok(())
            })
            .await
    }

    /// Mark a mapping as fully rewritten; the row becomes eligible for
    /// garbage collection.
    pub async fn mark_completed(&self, local_id: &str) -> DbResult<()> {
        self.db.mark_mapping_completed(local_id).await?;
        Ok(())
    }

    /// Startup recovery: re-run the (idempotent) cutover for every
    /// mapping whose rewrite may have been interrupted, then mark it
    /// completed.
    pub async fn recover_incomplete_mappings(&self) -> DbResult<usize> {
        let incomplete = self.db.incomplete_mappings().await?;
        let count = incomplete.len();

        for (local_id, record) in incomplete {
            info!(
                target: LOG_TARGET,
                local_id,
                server_id = %record.server_id,
                "Recovering incomplete id mapping"
            );
            self.update_all_references(&local_id, &record.server_id).await?;
            self.mark_completed(&local_id).await?;
        }

        Ok(count)
    }

    /// Drop completed mapping rows.
    pub async fn gc_completed(&self) -> DbResult<usize> {
        self.db.gc_completed_mappings().await
    }

    /// File-id remap: wait for the temporary file id to show up in the
    /// note's content (the editor save races the upload), then rewrite
    /// it and push the note again.
    ///
    /// Gives up after the configured number of polls; the upload stays
    /// accepted and the stale reference is only logged.
    pub async fn remap_file_references(
        &self,
        note_id: &NoteId,
        local_file_id: &FileId,
        server_file_id: &FileId,
        store: &NoteStore,
    ) -> DbResult<bool> {
        for attempt in 0..self.config.file_remap_poll_attempts {
            let contains = store
                .note(note_id)
                .map(|note| {
                    note.content.contains(local_file_id.as_str())
                        || note
                            .attachments
                            .iter()
                            .any(|a| a.file_id == *local_file_id)
                })
                .unwrap_or(false);

            if contains {
                let rewritten = store
                    .rewrite_attachment_reference(note_id, local_file_id, server_file_id)
                    .await?;
                debug!(
                    target: LOG_TARGET,
                    note_id = %note_id,
                    local_file_id = %local_file_id,
                    server_file_id = %server_file_id,
                    attempt,
                    rewritten,
                    "File id remapped in note content"
                );
                return Ok(rewritten);
            }

            tokio::time::sleep(self.config.file_remap_poll_interval).await;
        }

        warn!(
            target: LOG_TARGET,
            note_id = %note_id,
            local_file_id = %local_file_id,
            "Temporary file id never appeared in note content; accepting upload without rewrite"
        );
        Ok(false)
    }
}
