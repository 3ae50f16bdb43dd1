use std::sync::atomic::Ordering;

use minote_core::{
    NoteId, NoteOperation, OperationId, OperationKind, OperationStatus, Timestamp,
};
use tracing::debug;

use crate::{Database, DbResult, LOG_TARGET, note_operations};

/// What happened on enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was appended.
    Inserted(OperationId),
    /// An existing pending upload for the same note swallowed the new
    /// payload; the row keeps its queue position.
    Coalesced(OperationId),
}

impl EnqueueOutcome {
    pub fn operation_id(&self) -> &OperationId {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::Coalesced(id) => id,
        }
    }
}

impl Database {
    /// Claim the next insertion-order sequence number.
    pub fn next_operation_seq(&self) -> u64 {
        self.op_seq_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn max_operation_seq_tx(
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<Option<u64>> {
        let mut max = None;
        for res in ops_table.range::<OperationId>(..)? {
            let (_k, v) = res?;
            let seq = v.value().seq;
            if max.is_none_or(|m| m < seq) {
                max = Some(seq);
            }
        }
        Ok(max)
    }

    /// Insert an operation, coalescing uploads.
    ///
    /// A pending `CloudUpload` for a note swallows any newer upload for
    /// the same note: the payload and `local_save_timestamp` are
    /// replaced, the row keeps its id and insertion order. Everything
    /// else appends.
    pub fn enqueue_operation_tx(
        mut op: NoteOperation,
        seq: u64,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<EnqueueOutcome> {
        if op.kind == OperationKind::CloudUpload {
            let existing = Self::find_pending_tx(&op.note_id, OperationKind::CloudUpload, ops_table)?;
            if let Some(mut pending) = existing {
                pending.data = op.data;
                pending.local_save_timestamp = op.local_save_timestamp;
                pending.retry_count = 0;
                pending.last_error = None;
                pending.next_attempt_at = Timestamp::ZERO;
                ops_table.insert(&pending.id, &pending)?;
                debug!(
                    target: LOG_TARGET,
                    note_id = %pending.note_id,
                    op_id = %pending.id,
                    "Coalesced pending upload"
                );
                return Ok(EnqueueOutcome::Coalesced(pending.id));
            }
        }

        op.seq = seq;
        op.status = OperationStatus::Pending;
        ops_table.insert(&op.id, &op)?;
        Ok(EnqueueOutcome::Inserted(op.id))
    }

    fn find_pending_tx(
        note_id: &NoteId,
        kind: OperationKind,
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<Option<NoteOperation>> {
        for res in ops_table.range::<OperationId>(..)? {
            let (_k, v) = res?;
            let op = v.value();
            if op.status == OperationStatus::Pending && op.kind == kind && &op.note_id == note_id {
                return Ok(Some(op));
            }
        }
        Ok(None)
    }

    /// All pending rows in scheduling order: priority desc, seq asc.
    pub fn pending_operations_tx(
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<Vec<NoteOperation>> {
        let mut ops: Vec<NoteOperation> = ops_table
            .range::<OperationId>(..)?
            .map(|res| res.map(|(_k, v)| v.value()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .collect();

        ops.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.seq.cmp(&b.seq))
        });
        Ok(ops)
    }

    pub fn get_operation_tx(
        id: &OperationId,
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<Option<NoteOperation>> {
        Ok(ops_table.get(id)?.map(|g| g.value()))
    }

    pub fn has_pending_kind_tx(
        note_id: &NoteId,
        kinds: &[OperationKind],
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<bool> {
        for res in ops_table.range::<OperationId>(..)? {
            let (_k, v) = res?;
            let op = v.value();
            if op.status == OperationStatus::Pending
                && &op.note_id == note_id
                && kinds.contains(&op.kind)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Timestamp of the pending upload for `note_id`, if any.
    pub fn local_save_timestamp_tx(
        note_id: &NoteId,
        ops_table: &impl note_operations::ReadableTable,
    ) -> DbResult<Option<Timestamp>> {
        Ok(Self::find_pending_tx(note_id, OperationKind::CloudUpload, ops_table)?
            .map(|op| op.local_save_timestamp))
    }

    /// Delete every pending row targeting `note_id`.
    pub fn cancel_operations_tx(
        note_id: &NoteId,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<usize> {
        let doomed: Vec<OperationId> = ops_table
            .range::<OperationId>(..)?
            .map(|res| res.map(|(k, v)| (k.value(), v.value())))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(_id, op)| op.status == OperationStatus::Pending && &op.note_id == note_id)
            .map(|(id, _op)| id)
            .collect();

        for id in &doomed {
            ops_table.remove(id)?;
        }
        Ok(doomed.len())
    }

    /// Atomic rewrite used by id remapping: every pending row referencing
    /// `old_id` now references `new_id`.
    pub fn update_note_id_in_pending_operations_tx(
        old_id: &NoteId,
        new_id: &NoteId,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<usize> {
        let affected: Vec<NoteOperation> = ops_table
            .range::<OperationId>(..)?
            .map(|res| res.map(|(_k, v)| v.value()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|op| &op.note_id == old_id)
            .collect();

        for mut op in affected.iter().cloned() {
            op.note_id = new_id.clone();
            ops_table.insert(&op.id, &op)?;
        }
        Ok(affected.len())
    }

    pub fn update_operation_status_tx(
        id: &OperationId,
        status: OperationStatus,
        last_error: Option<String>,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<bool> {
        let Some(mut op) = ops_table.get(id)?.map(|g| g.value()) else {
            return Ok(false);
        };
        op.status = status;
        op.last_error = last_error;
        ops_table.insert(id, &op)?;
        Ok(true)
    }

    /// Put a row back to pending with an increased retry count and a
    /// scheduled next attempt.
    pub fn mark_operation_retry_tx(
        id: &OperationId,
        retry_count: u32,
        next_attempt_at: Timestamp,
        last_error: Option<String>,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<bool> {
        let Some(mut op) = ops_table.get(id)?.map(|g| g.value()) else {
            return Ok(false);
        };
        op.status = OperationStatus::Pending;
        op.retry_count = retry_count;
        op.next_attempt_at = next_attempt_at;
        op.last_error = last_error;
        ops_table.insert(id, &op)?;
        Ok(true)
    }

    pub fn remove_operation_tx(
        id: &OperationId,
        ops_table: &mut note_operations::Table,
    ) -> DbResult<bool> {
        Ok(ops_table.remove(id)?.is_some())
    }
}

impl Database {
    pub async fn enqueue_operation(&self, op: NoteOperation) -> DbResult<EnqueueOutcome> {
        let seq = self.next_operation_seq();
        self.write_with(|tx| {
            let mut ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::enqueue_operation_tx(op, seq, &mut ops_table)
        })
        .await
    }

    pub async fn pending_operations(&self) -> DbResult<Vec<NoteOperation>> {
        self.read_with(|tx| {
            let ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::pending_operations_tx(&ops_table)
        })
        .await
    }

    pub async fn get_operation(&self, id: &OperationId) -> DbResult<Option<NoteOperation>> {
        self.read_with(|tx| {
            let ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::get_operation_tx(id, &ops_table)
        })
        .await
    }

    pub async fn has_pending_kind(
        &self,
        note_id: &NoteId,
        kinds: &[OperationKind],
    ) -> DbResult<bool> {
        self.read_with(|tx| {
            let ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::has_pending_kind_tx(note_id, kinds, &ops_table)
        })
        .await
    }

    /// Does *any* note still have an un-pushed local change?
    ///
    /// Governs sync-cursor commits: the cursor may only advance once no
    /// pending upload-class operation remains.
    pub async fn has_any_pending_upload(&self) -> DbResult<bool> {
        self.read_with(|tx| {
            let ops_table = tx.open_table(&note_operations::TABLE)?;
            for res in ops_table.range::<OperationId>(..)? {
                let (_k, v) = res?;
                let op = v.value();
                if op.status == OperationStatus::Pending && op.kind.is_upload() {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await
    }

    pub async fn local_save_timestamp(&self, note_id: &NoteId) -> DbResult<Option<Timestamp>> {
        self.read_with(|tx| {
            let ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::local_save_timestamp_tx(note_id, &ops_table)
        })
        .await
    }

    pub async fn cancel_operations(&self, note_id: &NoteId) -> DbResult<usize> {
        self.write_with(|tx| {
            let mut ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::cancel_operations_tx(note_id, &mut ops_table)
        })
        .await
    }

    pub async fn update_operation_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
        last_error: Option<String>,
    ) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::update_operation_status_tx(id, status, last_error, &mut ops_table)
        })
        .await
    }

    pub async fn mark_operation_retry(
        &self,
        id: &OperationId,
        retry_count: u32,
        next_attempt_at: Timestamp,
        last_error: Option<String>,
    ) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::mark_operation_retry_tx(id, retry_count, next_attempt_at, last_error, &mut ops_table)
        })
        .await
    }

    pub async fn remove_operation(&self, id: &OperationId) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut ops_table = tx.open_table(&note_operations::TABLE)?;
            Self::remove_operation_tx(id, &mut ops_table)
        })
        .await
    }
}
