//! Typed event fan-out.
//!
//! One unbounded fan-out channel per event family; every subscriber gets
//! every event, in publication order, and a slow subscriber never blocks
//! a publisher.

use minote_core::event::{
    AuthEvent, ErrorEvent, FolderEvent, IdMappingEvent, NoteEvent, OnlineEvent, StartupEvent,
    SyncEvent,
};
use minote_util_bus as bus;

pub struct EventBus {
    note_tx: bus::Sender<NoteEvent>,
    folder_tx: bus::Sender<FolderEvent>,
    sync_tx: bus::Sender<SyncEvent>,
    auth_tx: bus::Sender<AuthEvent>,
    online_tx: bus::Sender<OnlineEvent>,
    error_tx: bus::Sender<ErrorEvent>,
    id_mapping_tx: bus::Sender<IdMappingEvent>,
    startup_tx: bus::Sender<StartupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            note_tx: bus::Sender::new(),
            folder_tx: bus::Sender::new(),
            sync_tx: bus::Sender::new(),
            auth_tx: bus::Sender::new(),
            online_tx: bus::Sender::new(),
            error_tx: bus::Sender::new(),
            id_mapping_tx: bus::Sender::new(),
            startup_tx: bus::Sender::new(),
        }
    }

    pub fn note_subscribe(&self) -> bus::Receiver<NoteEvent> {
        self.note_tx.subscribe()
    }

    pub fn folder_subscribe(&self) -> bus::Receiver<FolderEvent> {
        self.folder_tx.subscribe()
    }

    pub fn sync_subscribe(&self) -> bus::Receiver<SyncEvent> {
        self.sync_tx.subscribe()
    }

    pub fn auth_subscribe(&self) -> bus::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    pub fn online_subscribe(&self) -> bus::Receiver<OnlineEvent> {
        self.online_tx.subscribe()
    }

    pub fn error_subscribe(&self) -> bus::Receiver<ErrorEvent> {
        self.error_tx.subscribe()
    }

    pub fn id_mapping_subscribe(&self) -> bus::Receiver<IdMappingEvent> {
        self.id_mapping_tx.subscribe()
    }

    pub fn startup_subscribe(&self) -> bus::Receiver<StartupEvent> {
        self.startup_tx.subscribe()
    }

    pub fn publish_note(&self, event: NoteEvent) {
        self.note_tx.send(event);
    }

    pub fn publish_folder(&self, event: FolderEvent) {
        self.folder_tx.send(event);
    }

    pub fn publish_sync(&self, event: SyncEvent) {
        self.sync_tx.send(event);
    }

    pub fn publish_auth(&self, event: AuthEvent) {
        self.auth_tx.send(event);
    }

    pub fn publish_online(&self, event: OnlineEvent) {
        self.online_tx.send(event);
    }

    pub fn publish_error(&self, event: ErrorEvent) {
        self.error_tx.send(event);
    }

    pub fn publish_id_mapping(&self, event: IdMappingEvent) {
        self.id_mapping_tx.send(event);
    }

    pub fn publish_startup(&self, event: StartupEvent) {
        self.startup_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
