//! The note store's intent loop.
//!
//! Applies every intent event (from the UI, the sync engine, and the
//! id-mapping registry) through the store, which is the single
//! database writer. Result events (`Saved`, `ListChanged`) are ignored
//! here; the store publishes those itself after each write.

use minote_client_db::DbResult;
use minote_core::event::{ErrorEvent, FolderEvent, NoteEvent, SyncEvent};
use minote_util_bus::Receiver;
use minote_util_error::FmtCompact as _;
use tracing::{debug, instrument, warn};

use crate::LOG_TARGET;
use crate::client::{Client, ClientHandle};

pub struct StoreIntentLoop {
    client: ClientHandle,
    note_rx: Receiver<NoteEvent>,
    folder_rx: Receiver<FolderEvent>,
    sync_rx: Receiver<SyncEvent>,
}

impl StoreIntentLoop {
    pub fn new(client: &Client) -> Self {
        debug!(target: LOG_TARGET, "Starting store intent loop");
        Self {
            client: client.handle(),
            note_rx: client.bus().note_subscribe(),
            folder_rx: client.bus().folder_subscribe(),
            sync_rx: client.bus().sync_subscribe(),
        }
    }

    #[instrument(name = "store-intent-loop", skip(self))]
    pub async fn run(mut self) {
        loop {
            let result = tokio::select! {
                event = self.note_rx.recv() => {
                    let Ok(event) = event else { break };
                    let Ok(client) = self.client.client_ref() else { break };
                    Self::on_note_event(&client, event).await
                }
                event = self.folder_rx.recv() => {
                    let Ok(event) = event else { break };
                    let Ok(client) = self.client.client_ref() else { break };
                    Self::on_folder_event(&client, event).await
                }
                event = self.sync_rx.recv() => {
                    let Ok(event) = event else { break };
                    let Ok(client) = self.client.client_ref() else { break };
                    Self::on_sync_event(&client, event).await
                }
            };

            if let Err(err) = result {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Intent application failed");
                if let Ok(client) = self.client.client_ref() {
                    client.bus().publish_error(ErrorEvent::StorageFailed {
                        message: err.fmt_compact().to_string(),
                    });
                }
            }
        }
        debug!(target: LOG_TARGET, "Store intent loop stopped");
    }

    async fn on_note_event(client: &Client, event: NoteEvent) -> DbResult<()> {
        let store = client.store();
        match event {
            NoteEvent::Created(note) => store.apply_created_note(note).await,
            NoteEvent::ContentUpdated {
                note_id,
                title,
                content,
            } => store.save_note_content(&note_id, title, content).await,
            NoteEvent::MetadataUpdated {
                note_id,
                color_id,
                status,
                tags,
            } => {
                store
                    .update_note_metadata(&note_id, color_id, status, tags)
                    .await
            }
            NoteEvent::Moved { note_id, folder_id } => store.move_note(&note_id, folder_id).await,
            NoteEvent::Starred { note_id, starred } => {
                store.set_note_starred(&note_id, starred).await
            }
            NoteEvent::Deleted { note_id, origin } => store.delete_note(&note_id, origin).await,
            NoteEvent::IdMigrated { old_id, new_id } => {
                store.handle_note_id_migrated(&old_id, &new_id).await
            }
            NoteEvent::Saved(_) | NoteEvent::ListChanged => Ok(()),
        }
    }

    async fn on_folder_event(client: &Client, event: FolderEvent) -> DbResult<()> {
        let store = client.store();
        match event {
            FolderEvent::Created(folder) => store.apply_created_folder(folder).await,
            FolderEvent::Renamed { folder_id, name } => {
                store.rename_folder(&folder_id, name).await
            }
            FolderEvent::Deleted { folder_id, origin } => {
                store.delete_folder(&folder_id, origin).await
            }
            FolderEvent::FolderSaved(folder) => store.apply_folder_saved(folder).await,
            FolderEvent::BatchSaved(folders) => store.apply_folder_batch(folders).await,
            FolderEvent::FolderIdMigrated { old_id, new_id } => {
                store.handle_folder_id_migrated(&old_id, &new_id).await
            }
            FolderEvent::Saved(_) | FolderEvent::ListChanged => Ok(()),
        }
    }

    async fn on_sync_event(client: &Client, event: SyncEvent) -> DbResult<()> {
        match event {
            SyncEvent::NoteDownloaded(note) => client.store().apply_downloaded_note(note).await,
            _ => Ok(()),
        }
    }
}
