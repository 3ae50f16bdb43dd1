//! The persistent operation queue.
//!
//! A thin, typed façade over the queue table: enqueue (with upload
//! coalescing), the pending-state predicates the sync guard asks for,
//! cancellation, and the id rewrite used by mapping cutover. Durability
//! and single-writer discipline come from the database itself.

use std::sync::Arc;

use minote_client_db::{Database, DbResult, EnqueueOutcome, note_operations};
use minote_core::{
    NoteId, NoteOperation, OperationId, OperationKind, OperationStatus, Timestamp,
};
use tracing::debug;

const LOG_TARGET: &str = "minote::queue";

pub struct OperationQueue {
    db: Arc<Database>,
}

impl OperationQueue {
    pub fn new(db: Arc<Database>) -> Arc<Self> {
        Arc::new(Self { db })
    }

    /// Persist an operation.
    ///
    /// A pending `CloudUpload` for the same note coalesces: the newer
    /// payload and save timestamp replace the queued ones and no second
    /// row appears.
    pub async fn enqueue(&self, op: NoteOperation) -> DbResult<EnqueueOutcome> {
        let kind = op.kind;
        let note_id = op.note_id.clone();
        let outcome = self.db.enqueue_operation(op).await?;
        debug!(
            target: LOG_TARGET,
            ?kind,
            note_id = %note_id,
            op_id = %outcome.operation_id(),
            coalesced = matches!(outcome, EnqueueOutcome::Coalesced(_)),
            "Enqueued operation"
        );
        Ok(outcome)
    }

    /// All pending operations in scheduling order: priority desc, FIFO
    /// within a priority.
    pub async fn pending_operations(&self) -> DbResult<Vec<NoteOperation>> {
        self.db.pending_operations().await
    }

    pub async fn get(&self, id: &OperationId) -> DbResult<Option<NoteOperation>> {
        self.db.get_operation(id).await
    }

    pub async fn has_pending_upload(&self, note_id: &NoteId) -> DbResult<bool> {
        self.db
            .has_pending_kind(note_id, &[OperationKind::CloudUpload])
            .await
    }

    pub async fn has_pending_note_create(&self, note_id: &NoteId) -> DbResult<bool> {
        self.db
            .has_pending_kind(note_id, &[OperationKind::NoteCreate])
            .await
    }

    pub async fn has_pending_file_upload(&self, note_id: &NoteId) -> DbResult<bool> {
        self.db
            .has_pending_kind(
                note_id,
                &[OperationKind::ImageUpload, OperationKind::AudioUpload],
            )
            .await
    }

    pub async fn has_pending_folder_create(&self, folder_id: &NoteId) -> DbResult<bool> {
        self.db
            .has_pending_kind(folder_id, &[OperationKind::FolderCreate])
            .await
    }

    /// Any pending upload-class operation at all; gates sync-cursor
    /// commits.
    pub async fn has_any_pending_upload(&self) -> DbResult<bool> {
        self.db.has_any_pending_upload().await
    }

    /// Save timestamp of the pending upload for this note, if any.
    pub async fn local_save_timestamp(&self, note_id: &NoteId) -> DbResult<Option<Timestamp>> {
        self.db.local_save_timestamp(note_id).await
    }

    /// Drop every pending operation targeting this id.
    pub async fn cancel_operations(&self, note_id: &NoteId) -> DbResult<usize> {
        let cancelled = self.db.cancel_operations(note_id).await?;
        if 0 < cancelled {
            debug!(target: LOG_TARGET, note_id = %note_id, cancelled, "Cancelled operations");
        }
        Ok(cancelled)
    }

    /// Atomic rewrite used by id-mapping cutover.
    pub async fn update_note_id_in_pending_operations(
        &self,
        old_id: &NoteId,
        new_id: &NoteId,
    ) -> DbResult<usize> {
        self.db
            .write_with(|tx| {
                let mut ops_table = tx.open_table(&note_operations::TABLE)?;
                Database::update_note_id_in_pending_operations_tx(old_id, new_id, &mut ops_table)
            })
            .await
    }

    pub async fn update_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
        last_error: Option<String>,
    ) -> DbResult<bool> {
        self.db.update_operation_status(id, status, last_error).await
    }

    pub async fn mark_retry(
        &self,
        id: &OperationId,
        retry_count: u32,
        next_attempt_at: Timestamp,
        last_error: Option<String>,
    ) -> DbResult<bool> {
        self.db
            .mark_operation_retry(id, retry_count, next_attempt_at, last_error)
            .await
    }

    /// Remove a completed operation's row.
    pub async fn remove(&self, id: &OperationId) -> DbResult<bool> {
        self.db.remove_operation(id).await
    }
}
