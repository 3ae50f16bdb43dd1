//! Processor scheduling: priority order, temp-id deferral, and the
//! retry/backoff ladder.

mod common;

use std::sync::Arc;

use minote_client::transport::{HttpResponse, MemoryExecutor, Method};
use minote_core::{
    FolderId, NoteId, NoteOperation, OperationKind, OperationStatus, Timestamp,
};

use crate::common::{go_online, mount_login_routes, test_client, test_config};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn dispatch_order_follows_priority_then_fifo() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    exec.on(Method::Post, "/note/full/n-del/delete", |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({"code": 0, "data": {}}).to_string().into_bytes(),
        ))
    });
    exec.on(Method::Post, "/note/note/n-up", |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({"code": 0, "data": {"entry": {"id": "n-up", "tag": "t"}}})
                .to_string()
                .into_bytes(),
        ))
    });
    exec.on(Method::Post, "/note/note", |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({"code": 0, "data": {"entry": {"id": "s-new", "tag": "t"}}})
                .to_string()
                .into_bytes(),
        ))
    });

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;

    // Enqueued lowest-priority first, on purpose, while still offline so
    // nothing dispatches mid-setup.
    let upload_note = minote_core::Note::new_offline("U", "u", FolderId::all())
        .with_id(NoteId::new("n-up"));
    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::CloudUpload,
            NoteId::new("n-up"),
            serde_json::to_vec(&upload_note).expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    let create_note = minote_core::Note::new_offline("C", "c", FolderId::all());
    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::NoteCreate,
            create_note.id.clone(),
            serde_json::to_vec(&create_note).expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::CloudDelete,
            NoteId::new("n-del"),
            serde_json::to_vec(&minote_client::handlers::DeletePayload {
                tag: "t".to_owned(),
                purge: false,
            })
            .expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    go_online(&client).await;
    client.processor().process_queue().await.expect("Drains");

    let queue = client.queue().clone();
    crate::common::wait_until_async("queue drained", move || {
        let queue = queue.clone();
        async move {
            queue
                .pending_operations()
                .await
                .expect("Reads")
                .is_empty()
        }
    })
    .await;

    // Wire order: delete (10), create (8), upload (5).
    let posts: Vec<String> = exec
        .requests()
        .into_iter()
        .filter(|req| req.method == Method::Post)
        .map(|req| req.url)
        .collect();
    assert_eq!(posts.len(), 3);
    assert!(posts[0].contains("/note/full/n-del/delete"));
    assert!(posts[1].ends_with("/note/note"));
    assert!(posts[2].contains("/note/note/n-up"));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn temp_id_operations_wait_for_their_create() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;
    go_online(&client).await;

    // An upload referencing a temporary id with no create queued and no
    // mapping: nothing must be sent for it.
    let orphan_id = NoteId::generate_temporary();
    let orphan = minote_core::Note::new_offline("O", "o", FolderId::all())
        .with_id(orphan_id.clone());
    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::CloudUpload,
            orphan_id.clone(),
            serde_json::to_vec(&orphan).expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    let processed = client.processor().process_queue().await.expect("Drains");
    assert_eq!(processed, 0);

    // Deferred, not failed: still pending, untouched.
    let pending = client.queue().pending_operations().await.expect("Reads");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, OperationStatus::Pending);
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(exec.hits("/note/note"), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn transient_failures_back_off_then_fail_permanently() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    exec.on(Method::Post, "/note/note/s1", |_req| {
        Ok(HttpResponse::new(503, vec![]))
    });

    let mut config = test_config();
    config.max_operation_retries = 2;
    // Wide enough that the "window still open" assertion cannot race a
    // slow test runner.
    config.retry_base_delay = std::time::Duration::from_millis(300);
    config.retry_max_delay = std::time::Duration::from_millis(300);
    let (_dir, client) = crate::common::test_client_with_config(exec.clone(), config).await;
    client.startup().await;
    go_online(&client).await;

    let note = minote_core::Note::new_offline("N", "c", FolderId::all())
        .with_id(NoteId::new("s1"));
    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::CloudUpload,
            NoteId::new("s1"),
            serde_json::to_vec(&note).expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    // First drain: one failed attempt, rescheduled into the future.
    client.processor().process_queue().await.expect("Drains");
    let op = client
        .queue()
        .pending_operations()
        .await
        .expect("Reads")
        .pop()
        .expect("Still pending");
    assert_eq!(op.retry_count, 1);
    assert_eq!(op.status, OperationStatus::Pending);
    assert!(Timestamp::now() < op.next_attempt_at);
    assert!(op.last_error.is_some());

    // Draining again immediately does nothing: the backoff window is
    // still open.
    client.processor().process_queue().await.expect("Drains");
    let op_again = client
        .queue()
        .pending_operations()
        .await
        .expect("Reads")
        .pop()
        .expect("Still pending");
    assert_eq!(op_again.retry_count, 1);

    // Once the window passes, the final attempt runs and exhausts the
    // retry budget.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    client.processor().process_queue().await.expect("Drains");

    assert!(
        client
            .queue()
            .pending_operations()
            .await
            .expect("Reads")
            .is_empty()
    );
    let failed = client
        .queue()
        .get(&op.id)
        .await
        .expect("Reads")
        .expect("Row kept");
    assert_eq!(failed.status, OperationStatus::Failed);
    assert!(failed.last_error.is_some());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn business_errors_are_permanent() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    exec.on_json(
        Method::Post,
        "/note/note/s1",
        serde_json::json!({"code": 12, "description": "tag conflict"}),
    );

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;
    go_online(&client).await;

    let note = minote_core::Note::new_offline("N", "c", FolderId::all())
        .with_id(NoteId::new("s1"));
    client
        .queue()
        .enqueue(NoteOperation::new(
            OperationKind::CloudUpload,
            NoteId::new("s1"),
            serde_json::to_vec(&note).expect("Encodes"),
        ))
        .await
        .expect("Enqueues");

    client.processor().process_queue().await.expect("Drains");

    let pending = client.queue().pending_operations().await.expect("Reads");
    assert!(pending.is_empty(), "No retry for a business rejection");
    assert_eq!(exec.hits("/note/note/s1"), 1);
}
