//! Pull-side behavior: tier fallback, guard protection, and cursor
//! staging across pending uploads.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use minote_client::sync::SyncOutcome;
use minote_client::transport::{HttpResponse, MemoryExecutor, Method};
use minote_core::{FolderId, NoteId};

use crate::common::{go_online, mount_login_routes, test_client, wait_until};

fn detail_body(id: &str, content: &str, modify_date: u64) -> Vec<u8> {
    serde_json::json!({
        "code": 0,
        "data": {"entry": {
            "id": id,
            "subject": format!("title-{id}"),
            "content": content,
            "folderId": "0",
            "createDate": 1,
            "modifyDate": modify_date,
            "tag": format!("tag-{id}"),
        }}
    })
    .to_string()
    .into_bytes()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fallback_cascade_lightweight_web_legacy() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    // Tier 1 (lightweight) returns garbage; tier 2 (web) a 500; both
    // hit the web-sync endpoint.
    let web_hits = Arc::new(AtomicUsize::new(0));
    let hits = web_hits.clone();
    exec.on(Method::Get, "/note/sync/full/", move |_req| {
        match hits.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(HttpResponse::new(200, b"definitely not json".to_vec())),
            _ => Ok(HttpResponse::new(500, vec![])),
        }
    });

    // Tier 3 (legacy pager) succeeds with two entries.
    exec.on(Method::Get, "/note/full/page", |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({
                "code": 0,
                "data": {
                    "entries": [
                        {"id": "s1", "folderId": "0", "modifyDate": 10, "tag": "a"},
                        {"id": "s2", "folderId": "0", "modifyDate": 20, "tag": "b"},
                    ],
                    "folders": [],
                },
                "syncTag": "T2",
            })
            .to_string()
            .into_bytes(),
        ))
    });
    exec.on(Method::Get, "/note/note/s1/", |_req| {
        Ok(HttpResponse::new(200, detail_body("s1", "c1", 10)))
    });
    exec.on(Method::Get, "/note/note/s2/", |_req| {
        Ok(HttpResponse::new(200, detail_body("s2", "c2", 20)))
    });

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;
    go_online(&client).await;

    // A committed cursor makes smart sync incremental, which is what
    // exercises tier 1.
    client.db().commit_sync_tag("T1").await.expect("Commits");

    let outcome = client
        .engine()
        .perform_incremental_sync()
        .await
        .expect("Sync completes");
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            downloaded_count: 2
        }
    );

    assert_eq!(web_hits.load(Ordering::SeqCst), 2, "Both web tiers tried");

    // Both notes land in the store via the intent loop.
    let store = client.store().clone();
    wait_until("downloaded notes applied", || {
        store.note(&NoteId::new("s1")).is_some() && store.note(&NoteId::new("s2")).is_some()
    })
    .await;

    // No pending uploads, so the fresh cursor committed.
    assert_eq!(
        client
            .db()
            .get_sync_status()
            .await
            .expect("Reads")
            .sync_tag
            .as_deref(),
        Some("T2")
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn guard_protects_the_active_editor() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;
    go_online(&client).await;
    client.db().commit_sync_tag("T1").await.expect("Commits");

    let note_id = NoteId::new("s1");
    let note = minote_core::Note::new_offline("mine", "local", FolderId::all())
        .with_id(note_id.clone());
    let local_updated_at = note.updated_at;
    client
        .store()
        .apply_downloaded_note(note)
        .await
        .expect("Applies");

    client.store().set_active_editing(Some(note_id.clone()));

    // The cloud copy is strictly *newer* than the local edit; active
    // editing must still win.
    let cloud_ts = local_updated_at.as_millis() + 60_000;
    exec.on(Method::Get, "/note/sync/full/", move |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({
                "code": 0,
                "note_view": {"data": {
                    "entries": [{"id": "s1", "folderId": "0", "modifyDate": cloud_ts, "tag": "new"}],
                    "folders": [],
                    "syncTag": "T2",
                }}
            })
            .to_string()
            .into_bytes(),
        ))
    });

    let outcome = client
        .engine()
        .perform_incremental_sync()
        .await
        .expect("Sync completes");
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            downloaded_count: 0
        }
    );

    // The detail endpoint was never consulted and the local row is
    // untouched, cloud timestamp notwithstanding.
    assert_eq!(exec.hits("/note/note/s1/"), 0);
    let local = client.store().note(&note_id).expect("Still present");
    assert_eq!(local.content, "local");
    assert_eq!(local.updated_at, local_updated_at);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cursor_never_commits_past_pending_uploads() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    let tag = Arc::new(std::sync::Mutex::new("T2".to_owned()));
    let tag_route = tag.clone();
    exec.on(Method::Get, "/note/sync/full/", move |_req| {
        let tag = tag_route.lock().expect("Locking failed").clone();
        Ok(HttpResponse::new(
            200,
            serde_json::json!({
                "code": 0,
                "note_view": {"data": {"entries": [], "folders": [], "syncTag": tag}}
            })
            .to_string()
            .into_bytes(),
        ))
    });

    // The upload endpoint is down at first, pinning the upload in the
    // queue while the pull returns a fresh cursor.
    let upload_down = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let upload_flag = upload_down.clone();
    exec.on(Method::Post, "/note/note/s1", move |_req| {
        if upload_flag.load(Ordering::SeqCst) {
            return Ok(HttpResponse::new(503, vec![]));
        }
        Ok(HttpResponse::new(
            200,
            serde_json::json!({"code": 0, "data": {"entry": {"id": "s1", "tag": "t2"}}})
                .to_string()
                .into_bytes(),
        ))
    });

    let (_dir, client) = test_client(exec.clone()).await;
    client.startup().await;
    go_online(&client).await;
    client.db().commit_sync_tag("T1").await.expect("Commits");

    let note_id = NoteId::new("s1");
    let mut note =
        minote_core::Note::new_offline("N", "c", FolderId::all()).with_id(note_id.clone());
    note.server_tag = Some("t1".to_owned());
    client
        .store()
        .apply_downloaded_note(note)
        .await
        .expect("Applies");
    client
        .store()
        .save_note_content(&note_id, "N", "edited")
        .await
        .expect("Saves");

    // The immediate push fails against the dead endpoint and the row
    // settles back to pending with a retry scheduled.
    let queue = client.queue().clone();
    let pending_note = note_id.clone();
    crate::common::wait_until_async("upload back in pending", move || {
        let queue = queue.clone();
        let note_id = pending_note.clone();
        async move {
            queue
                .pending_operations()
                .await
                .expect("Reads")
                .iter()
                .any(|op| op.note_id == note_id && 0 < op.retry_count)
        }
    })
    .await;

    client
        .engine()
        .perform_incremental_sync()
        .await
        .expect("Sync completes");

    // The classic crash window: committed cursor stayed put, the fresh
    // one is only staged.
    let status = client.db().get_sync_status().await.expect("Reads");
    assert_eq!(status.sync_tag.as_deref(), Some("T1"));
    assert_eq!(
        client.engine().state().staged_sync_tag().as_deref(),
        Some("T2")
    );

    // Endpoint recovers; wait out the backoff, drain, and sync again.
    upload_down.store(false, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    client.processor().process_queue().await.expect("Drains");
    assert!(
        !client
            .queue()
            .has_pending_upload(&note_id)
            .await
            .expect("Reads")
    );

    *tag.lock().expect("Locking failed") = "T3".to_owned();
    client
        .engine()
        .perform_incremental_sync()
        .await
        .expect("Sync completes");

    let status = client.db().get_sync_status().await.expect("Reads");
    assert_eq!(
        status.sync_tag.as_deref(),
        Some("T3"),
        "Cursor advanced once uploads drained"
    );
}
