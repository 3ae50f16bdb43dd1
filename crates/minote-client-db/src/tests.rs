use minote_core::{
    EntityKind, FolderId, Note, NoteId, NoteOperation, OperationKind, OperationStatus, Timestamp,
};
use minote_util_error::BoxedErrorResult;
use tempfile::{TempDir, tempdir};

use crate::{Database, EnqueueOutcome, note_operations, notes};

pub(crate) async fn temp_db() -> BoxedErrorResult<(TempDir, Database)> {
    let dir = tempdir()?;
    let db = Database::open(dir.path().join("db.redb")).await?;

    Ok((dir, db))
}

fn test_note(id: &str) -> Note {
    Note::new_offline("title", "content", FolderId::all()).with_id(NoteId::new(id))
}

fn upload_op(note_id: &str, payload: &[u8], ts: u64) -> NoteOperation {
    NoteOperation::new(
        OperationKind::CloudUpload,
        NoteId::new(note_id),
        payload.to_vec(),
    )
    .with_local_save_timestamp(Timestamp::from(ts))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn note_roundtrip_and_rename() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    let note = test_note("local_0000");
    db.upsert_note(&note).await?;

    assert_eq!(db.get_note(&note.id).await?.as_ref(), Some(&note));

    let new_id = NoteId::new("s1");
    db.write_with(|tx| {
        let mut notes_table = tx.open_table(&notes::TABLE)?;
        assert!(Database::rename_note_id_tx(&note.id, &new_id, &mut notes_table)?);
        Ok(())
    })
    .await?;

    assert_eq!(db.get_note(&note.id).await?, None);
    let renamed = db.get_note(&new_id).await?.expect("Renamed row present");
    assert_eq!(renamed.id, new_id);
    assert_eq!(renamed.title, note.title);

    // Idempotent: old row already gone.
    db.write_with(|tx| {
        let mut notes_table = tx.open_table(&notes::TABLE)?;
        assert!(!Database::rename_note_id_tx(&note.id, &new_id, &mut notes_table)?);
        Ok(())
    })
    .await?;

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn queue_scheduling_order() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    // Enqueued in "wrong" order on purpose.
    db.enqueue_operation(upload_op("n1", b"p", 1)).await?;
    db.enqueue_operation(NoteOperation::new(
        OperationKind::NoteCreate,
        NoteId::new("n2"),
        vec![],
    ))
    .await?;
    db.enqueue_operation(NoteOperation::new(
        OperationKind::CloudDelete,
        NoteId::new("n3"),
        vec![],
    ))
    .await?;

    let pending = db.pending_operations().await?;
    let kinds: Vec<OperationKind> = pending.iter().map(|op| op.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OperationKind::CloudDelete,
            OperationKind::NoteCreate,
            OperationKind::CloudUpload,
        ]
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn queue_fifo_within_priority() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    for i in 0..3 {
        db.enqueue_operation(NoteOperation::new(
            OperationKind::NoteCreate,
            NoteId::new(format!("n{i}")),
            vec![],
        ))
        .await?;
    }

    let pending = db.pending_operations().await?;
    let ids: Vec<&str> = pending.iter().map(|op| op.note_id.as_str()).collect();
    assert_eq!(ids, vec!["n0", "n1", "n2"]);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn upload_coalescing_keeps_one_row() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    let first = db.enqueue_operation(upload_op("n1", b"p1", 100)).await?;
    let EnqueueOutcome::Inserted(first_id) = first else {
        panic!("First enqueue must insert");
    };

    let second = db.enqueue_operation(upload_op("n1", b"p2", 200)).await?;
    let EnqueueOutcome::Coalesced(second_id) = second else {
        panic!("Second enqueue must coalesce");
    };
    assert_eq!(first_id, second_id);

    let pending = db.pending_operations().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].data, b"p2");
    assert_eq!(pending[0].local_save_timestamp, Timestamp::from(200));

    // A different note still appends.
    let other = db.enqueue_operation(upload_op("n2", b"q", 300)).await?;
    assert!(matches!(other, EnqueueOutcome::Inserted(_)));
    assert_eq!(db.pending_operations().await?.len(), 2);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn queue_predicates_and_cancel() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    let note_id = NoteId::new("n1");
    db.enqueue_operation(upload_op("n1", b"p", 7)).await?;
    db.enqueue_operation(NoteOperation::new(
        OperationKind::ImageUpload,
        note_id.clone(),
        vec![],
    ))
    .await?;

    assert!(
        db.has_pending_kind(&note_id, &[OperationKind::CloudUpload])
            .await?
    );
    assert!(
        db.has_pending_kind(
            &note_id,
            &[OperationKind::ImageUpload, OperationKind::AudioUpload]
        )
        .await?
    );
    assert!(
        !db.has_pending_kind(&note_id, &[OperationKind::NoteCreate])
            .await?
    );
    assert_eq!(
        db.local_save_timestamp(&note_id).await?,
        Some(Timestamp::from(7))
    );
    assert!(db.has_any_pending_upload().await?);

    assert_eq!(db.cancel_operations(&note_id).await?, 2);
    assert!(db.pending_operations().await?.is_empty());
    assert!(!db.has_any_pending_upload().await?);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn queue_note_id_rewrite() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    let old_id = NoteId::new("local_abc");
    let new_id = NoteId::new("s9");
    db.enqueue_operation(upload_op("local_abc", b"p", 1)).await?;
    db.enqueue_operation(NoteOperation::new(
        OperationKind::ImageUpload,
        old_id.clone(),
        vec![],
    ))
    .await?;

    db.write_with(|tx| {
        let mut ops_table = tx.open_table(&note_operations::TABLE)?;
        assert_eq!(
            Database::update_note_id_in_pending_operations_tx(&old_id, &new_id, &mut ops_table)?,
            2
        );
        Ok(())
    })
    .await?;

    for op in db.pending_operations().await? {
        assert_eq!(op.note_id, new_id);
    }

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn seq_counter_survives_reopen() -> BoxedErrorResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db.redb");

    let max_seq = {
        let db = Database::open(path.clone()).await?;
        db.enqueue_operation(upload_op("n1", b"p", 1)).await?;
        db.enqueue_operation(NoteOperation::new(
            OperationKind::NoteCreate,
            NoteId::new("n2"),
            vec![],
        ))
        .await?;
        db.pending_operations()
            .await?
            .iter()
            .map(|op| op.seq)
            .max()
            .expect("Has rows")
    };

    let db = Database::open(path.clone()).await?;
    let outcome = db
        .enqueue_operation(NoteOperation::new(
            OperationKind::CloudDelete,
            NoteId::new("n3"),
            vec![],
        ))
        .await?;
    let op = db
        .get_operation(outcome.operation_id())
        .await?
        .expect("Row present");
    assert!(max_seq < op.seq);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mapping_lifecycle() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    assert!(
        db.register_mapping("local_x", "s1", EntityKind::Note)
            .await?
    );
    // Idempotent for the same pair.
    assert!(
        !db.register_mapping("local_x", "s1", EntityKind::Note)
            .await?
    );

    let incomplete = db.incomplete_mappings().await?;
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].0, "local_x");
    assert_eq!(incomplete[0].1.server_id, "s1");

    assert!(db.mark_mapping_completed("local_x").await?);
    assert!(db.incomplete_mappings().await?.is_empty());

    assert_eq!(db.gc_completed_mappings().await?, 1);
    assert_eq!(db.get_mapping("local_x").await?.map(|m| m.server_id), None);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mappings_survive_reopen() -> BoxedErrorResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db.redb");

    {
        let db = Database::open(path.clone()).await?;
        db.register_mapping("local_x", "s1", EntityKind::File).await?;
    }

    let db = Database::open(path.clone()).await?;
    let mapping = db.get_mapping("local_x").await?.expect("Mapping survived");
    assert_eq!(mapping.server_id, "s1");
    assert_eq!(mapping.entity, EntityKind::File);
    assert!(!mapping.completed);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn sync_status_roundtrip() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    assert_eq!(db.get_sync_status().await?.sync_tag, None);

    db.commit_sync_tag("T1").await?;
    let status = db.get_sync_status().await?;
    assert_eq!(status.sync_tag.as_deref(), Some("T1"));
    assert!(Timestamp::ZERO < status.last_sync_time);

    db.clear_sync_tag().await?;
    assert_eq!(db.get_sync_status().await?.sync_tag, None);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn folder_sort_roundtrip() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    assert!(db.get_folder_sort().await?.order.is_empty());

    let record = crate::FolderSortRecord {
        order: vec![FolderId::new("0"), FolderId::new("f2"), FolderId::new("f1")],
    };
    db.set_folder_sort(&record).await?;

    let loaded = db.get_folder_sort().await?;
    assert_eq!(loaded.order.len(), 3);
    assert_eq!(loaded.order[1].as_str(), "f2");

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn retry_scheduling_fields() -> BoxedErrorResult<()> {
    let (_dir, db) = temp_db().await?;

    let outcome = db.enqueue_operation(upload_op("n1", b"p", 1)).await?;
    let op_id = outcome.operation_id().clone();

    db.update_operation_status(&op_id, OperationStatus::Running, None)
        .await?;
    assert!(db.pending_operations().await?.is_empty());

    db.mark_operation_retry(&op_id, 2, Timestamp::from(12345), Some("timeout".into()))
        .await?;
    let pending = db.pending_operations().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 2);
    assert_eq!(pending[0].next_attempt_at, Timestamp::from(12345));
    assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));

    db.update_operation_status(&op_id, OperationStatus::Failed, Some("gone".into()))
        .await?;
    assert!(db.pending_operations().await?.is_empty());
    let failed = db.get_operation(&op_id).await?.expect("Row kept");
    assert_eq!(failed.status, OperationStatus::Failed);

    Ok(())
}
