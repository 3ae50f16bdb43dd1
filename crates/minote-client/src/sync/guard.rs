//! "Is local state more authoritative than this incoming record?"
//!
//! The checks run in a fixed order and the first match wins; the pure
//! decision is separated from the state gathering so it can be tested
//! exhaustively.

use std::sync::Arc;

use minote_client_db::DbResult;
use minote_core::{NoteId, Timestamp};
use tracing::debug;

use crate::queue::OperationQueue;
use crate::store::NoteStore;

const LOG_TARGET: &str = "minote::sync";

/// Why an incoming record was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncSkipReason {
    /// The local note has never been uploaded; the cloud record cannot
    /// be about it.
    TemporaryId,
    /// The note is open in an editor right now.
    ActivelyEditing,
    /// A pending upload exists and the local save is at least as new.
    LocalNewer { local: Timestamp, cloud: Timestamp },
    /// A pending upload exists; the local version wins regardless of
    /// timestamps because the user is about to push it.
    PendingUpload,
    /// The note's create has not reached the server yet.
    PendingCreate,
    /// An attachment of this note is still uploading.
    PendingFileUpload,
}

/// Everything the decision needs, gathered up front.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuardInputs {
    pub is_temporary: bool,
    pub is_actively_editing: bool,
    pub pending_upload: Option<Timestamp>,
    pub pending_create: bool,
    pub pending_file_upload: bool,
}

/// The ordered checks; pure.
pub fn evaluate(inputs: GuardInputs, cloud_timestamp: Timestamp) -> Option<SyncSkipReason> {
    if inputs.is_temporary {
        return Some(SyncSkipReason::TemporaryId);
    }
    if inputs.is_actively_editing {
        return Some(SyncSkipReason::ActivelyEditing);
    }
    if let Some(local) = inputs.pending_upload {
        if cloud_timestamp <= local {
            return Some(SyncSkipReason::LocalNewer {
                local,
                cloud: cloud_timestamp,
            });
        }
        return Some(SyncSkipReason::PendingUpload);
    }
    if inputs.pending_create {
        return Some(SyncSkipReason::PendingCreate);
    }
    if inputs.pending_file_upload {
        return Some(SyncSkipReason::PendingFileUpload);
    }
    None
}

pub struct SyncGuard {
    queue: Arc<OperationQueue>,
    store: Arc<NoteStore>,
}

impl SyncGuard {
    pub fn new(queue: Arc<OperationQueue>, store: Arc<NoteStore>) -> Arc<Self> {
        Arc::new(Self { queue, store })
    }

    pub async fn get_skip_reason(
        &self,
        note_id: &NoteId,
        cloud_timestamp: Timestamp,
    ) -> DbResult<Option<SyncSkipReason>> {
        // Cheap, lock-free checks first; queue lookups only when they
        // still matter.
        if note_id.is_temporary() {
            return Ok(Some(SyncSkipReason::TemporaryId));
        }
        if self.store.active_editing_note_id().as_ref() == Some(note_id) {
            return Ok(Some(SyncSkipReason::ActivelyEditing));
        }

        let inputs = GuardInputs {
            is_temporary: false,
            is_actively_editing: false,
            pending_upload: self.queue.local_save_timestamp(note_id).await?,
            pending_create: self.queue.has_pending_note_create(note_id).await?,
            pending_file_upload: self.queue.has_pending_file_upload(note_id).await?,
        };

        let reason = evaluate(inputs, cloud_timestamp);
        if let Some(reason) = &reason {
            debug!(
                target: LOG_TARGET,
                note_id = %note_id,
                ?reason,
                "Skipping incoming record"
            );
        }
        Ok(reason)
    }

    pub async fn should_skip_sync(
        &self,
        note_id: &NoteId,
        cloud_timestamp: Timestamp,
    ) -> DbResult<bool> {
        Ok(self
            .get_skip_reason(note_id, cloud_timestamp)
            .await?
            .is_some())
    }
}
