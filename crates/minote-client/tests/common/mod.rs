//! Shared scaffolding for the integration tests: an in-memory cloud,
//! login routes for the token handshake, and polling helpers for
//! event-driven assertions.

// Each test binary uses a different subset of the helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use minote_client::auth::Credentials;
use minote_client::config::ClientConfig;
use minote_client::transport::{HttpResponse, MemoryExecutor, Method};
use minote_client::Client;
use minote_client_db::Database;
use tempfile::TempDir;

pub const SERVICE_TOKEN: &str = "svc-token-1";

/// Config with intervals small enough for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry_base_delay: Duration::from_millis(20),
        retry_max_delay: Duration::from_millis(100),
        dedup_window: Duration::from_millis(200),
        token_refresh_timeout: Duration::from_secs(5),
        file_remap_poll_attempts: 3,
        file_remap_poll_interval: Duration::from_millis(20),
        attachment_retry_delays: vec![Duration::from_millis(10), Duration::from_millis(20)],
        ..ClientConfig::default()
    }
}

/// The three-step login dance: login url → redirect → serviceToken
/// cookie.
pub fn mount_login_routes(exec: &MemoryExecutor) {
    exec.on(Method::Get, "/api/user/login", |_req| {
        Ok(HttpResponse::new(
            200,
            serde_json::json!({
                "code": 0,
                "data": {"loginUrl": "https://i.mi.com/sts/step2"}
            })
            .to_string()
            .into_bytes(),
        ))
    });
    exec.on(Method::Get, "/sts/step2", |_req| {
        Ok(HttpResponse::new(302, vec![])
            .with_header("Location", "https://i.mi.com/sts/step3"))
    });
    exec.on(Method::Get, "/sts/step3", |_req| {
        Ok(HttpResponse::new(200, vec![]).with_header(
            "Set-Cookie",
            format!("serviceToken={SERVICE_TOKEN}; Path=/; HttpOnly"),
        ))
    });
}

pub async fn test_client(exec: Arc<MemoryExecutor>) -> (TempDir, Arc<Client>) {
    test_client_with_config(exec, test_config()).await
}

pub async fn test_client_with_config(
    exec: Arc<MemoryExecutor>,
    config: ClientConfig,
) -> (TempDir, Arc<Client>) {
    let dir = tempfile::tempdir().expect("Temp dir");
    let db = Database::open(dir.path().join("db.redb"))
        .await
        .expect("Database opens");

    let client = Client::builder()
        .db(db)
        .transport(exec)
        .data_dir(dir.path().to_path_buf())
        .config(config)
        .credentials(Credentials {
            user_id: "u1".to_owned(),
            pass_token: "pass-1".to_owned(),
        })
        .build()
        .await
        .expect("Client builds");

    (dir, client)
}

/// Mint a token and flip every online input; waits for the edge to
/// propagate.
pub async fn go_online(client: &Client) {
    client.tokens().refresh().await.expect("Token refresh");
    client.set_reachable(true);
    wait_until("online", || client.online().is_online()).await;
}

/// Poll until `cond` holds; panics after 5 s.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}

/// Poll an async predicate until it holds; panics after 5 s.
pub async fn wait_until_async<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {what}");
}
