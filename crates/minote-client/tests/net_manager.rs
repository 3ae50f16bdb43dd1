//! Request-manager behavior that only shows under failure and state
//! flips: the offline retry queue and the GET cache.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minote_client::net::PRIORITY_NORMAL;
use minote_client::transport::{MemoryExecutor, Method, TimeoutSnafu};

use crate::common::{go_online, mount_login_routes, test_client, test_client_with_config, test_config};

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn transient_failures_replay_on_the_online_edge() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);

    let network_down = Arc::new(AtomicBool::new(true));
    let flag = network_down.clone();
    exec.on(Method::Get, "/note/note/n1/", move |_req| {
        if flag.load(Ordering::SeqCst) {
            return Err(TimeoutSnafu.build());
        }
        Ok(minote_client::transport::HttpResponse::new(
            200,
            serde_json::json!({"code": 0, "data": {"entry": {"id": "n1"}}})
                .to_string()
                .into_bytes(),
        ))
    });

    let (_dir, client) = test_client(exec.clone()).await;
    go_online(&client).await;

    // Tell the manager we are offline; the timeout now parks the
    // request instead of failing it.
    client.net().notify_online(false);

    let session = client.session().clone();
    let call =
        tokio::spawn(
            async move { session.get_json("/note/note/n1/?ts=1", PRIORITY_NORMAL).await },
        );

    // Give the first attempt time to fail and park.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished(), "Caller still suspended on the handle");

    // Network heals; the online edge replays the parked request.
    network_down.store(false, Ordering::SeqCst);
    client.net().notify_online(true);

    let envelope = call
        .await
        .expect("Task completes")
        .expect("Replayed request succeeds");
    assert_eq!(envelope["code"], 0);
    assert_eq!(exec.hits("/note/note/n1/"), 2);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn get_cache_serves_within_ttl() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    exec.on_json(
        Method::Get,
        "/status/lite/profile",
        serde_json::json!({"code": 0, "data": {"name": "u1"}}),
    );

    let mut config = test_config();
    config.get_cache_ttl = Some(Duration::from_secs(30));
    // Keep the duplicate window out of the way of the second call.
    config.dedup_window = Duration::from_millis(1);
    let (_dir, client) = test_client_with_config(exec.clone(), config).await;
    go_online(&client).await;

    let first = client
        .session()
        .get_json("/status/lite/profile?ts=fixed", PRIORITY_NORMAL)
        .await
        .expect("First call succeeds");
    assert_eq!(first["data"]["name"], "u1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = client
        .session()
        .get_json("/status/lite/profile?ts=fixed", PRIORITY_NORMAL)
        .await
        .expect("Second call succeeds");
    assert_eq!(second["data"]["name"], "u1");

    // One hit on the wire, the second served from cache.
    assert_eq!(exec.hits("/status/lite/profile"), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cookie_probe_and_restore_endpoints() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    exec.on_json(
        Method::Get,
        "/common/check",
        serde_json::json!({"code": 0, "data": {}}),
    );
    exec.on_json(
        Method::Post,
        "/note/note/s1/restore",
        serde_json::json!({"code": 0, "data": {"entry": {"id": "s1", "tag": "t2"}}}),
    );

    let (_dir, client) = test_client(exec.clone()).await;
    go_online(&client).await;

    assert!(
        client
            .session()
            .check_cookie_health()
            .await
            .expect("Probe succeeds")
    );

    let envelope = client
        .session()
        .restore_note(&minote_core::NoteId::new("s1"), "t1")
        .await
        .expect("Restore succeeds");
    assert_eq!(envelope["data"]["entry"]["tag"], "t2");

    let restore = exec
        .requests()
        .into_iter()
        .find(|req| req.url.contains("/restore"))
        .expect("Restore request logged");
    assert_eq!(
        restore.body.as_deref(),
        Some("tag=t1".as_bytes()),
        "Restore carries the version tag"
    );
}
