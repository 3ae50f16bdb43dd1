//! The three-step token handshake and its single-flight discipline.

mod common;

use std::sync::Arc;

use minote_client::auth::{AuthError, Credentials, TokenManager};
use minote_client::bus::EventBus;
use minote_client::transport::{HttpResponse, MemoryExecutor, Method};
use minote_core::event::AuthEvent;

use crate::common::{SERVICE_TOKEN, mount_login_routes, test_config};

fn token_manager(exec: Arc<MemoryExecutor>, credentials: Option<Credentials>) -> (Arc<EventBus>, TokenManager) {
    let bus = Arc::new(EventBus::new());
    let manager = TokenManager::new(exec, bus.clone(), test_config(), credentials);
    (bus, manager)
}

fn creds() -> Option<Credentials> {
    Some(Credentials {
        user_id: "u1".to_owned(),
        pass_token: "pass-1".to_owned(),
    })
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn three_step_handshake() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    let (bus, manager) = token_manager(exec.clone(), creds());
    let mut auth_rx = bus.auth_subscribe();

    let token = manager.service_token().await.expect("Refresh succeeds");
    assert_eq!(token, SERVICE_TOKEN);

    assert_eq!(exec.hits("/api/user/login"), 1);
    assert_eq!(exec.hits("/sts/step2"), 1);
    assert_eq!(exec.hits("/sts/step3"), 1);

    // The login steps carry the passToken cookie with a fresh wb_
    // device id.
    let first = &exec.requests()[0];
    let cookie = first.header("cookie").expect("Cookie attached");
    assert!(cookie.contains("userId=u1"));
    assert!(cookie.contains("passToken=pass-1"));
    assert!(cookie.contains("deviceId=wb_"));

    assert!(matches!(
        auth_rx.recv().await,
        Ok(AuthEvent::CookieRefreshed)
    ));

    // Fresh cache: no more HTTP.
    let again = manager.service_token().await.expect("Cached");
    assert_eq!(again, SERVICE_TOKEN);
    assert_eq!(exec.hits("/api/user/login"), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn refresh_is_single_flight() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    let (_bus, manager) = token_manager(exec.clone(), creds());
    let manager = Arc::new(manager);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.service_token().await })
        })
        .collect();

    for task in tasks {
        let token = task
            .await
            .expect("Task completes")
            .expect("Refresh succeeds");
        assert_eq!(token, SERVICE_TOKEN);
    }

    // Eight callers, one handshake.
    assert_eq!(exec.hits("/api/user/login"), 1);
    assert_eq!(exec.hits("/sts/step3"), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn no_credentials_is_terminal() {
    let exec = Arc::new(MemoryExecutor::new());
    mount_login_routes(&exec);
    let (_bus, manager) = token_manager(exec.clone(), None);

    let err = manager.service_token().await.unwrap_err();
    assert!(matches!(err, AuthError::NoCredentials { .. }));
    assert!(!err.is_retryable());
    assert_eq!(exec.hits("/api/user/login"), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn missing_login_url() {
    let exec = Arc::new(MemoryExecutor::new());
    exec.on_json(
        Method::Get,
        "/api/user/login",
        serde_json::json!({"code": 0, "data": {}}),
    );
    let (_bus, manager) = token_manager(exec, creds());

    let err = manager.service_token().await.unwrap_err();
    assert!(matches!(err, AuthError::LoginUrlMissing { .. }));
    assert!(err.is_retryable());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn missing_redirect() {
    let exec = Arc::new(MemoryExecutor::new());
    exec.on_json(
        Method::Get,
        "/api/user/login",
        serde_json::json!({"code": 0, "data": {"loginUrl": "https://i.mi.com/sts/step2"}}),
    );
    // Answers 200 instead of a redirect.
    exec.on_json(Method::Get, "/sts/step2", serde_json::json!({"ok": true}));
    let (_bus, manager) = token_manager(exec, creds());

    let err = manager.service_token().await.unwrap_err();
    assert!(matches!(err, AuthError::RedirectMissing { .. }));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn missing_service_token_cookie() {
    let exec = Arc::new(MemoryExecutor::new());
    exec.on_json(
        Method::Get,
        "/api/user/login",
        serde_json::json!({"code": 0, "data": {"loginUrl": "https://i.mi.com/sts/step2"}}),
    );
    exec.on(Method::Get, "/sts/step2", |_req| {
        Ok(HttpResponse::new(302, vec![]).with_header("Location", "https://i.mi.com/sts/step3"))
    });
    // Sets an unrelated cookie only.
    exec.on(Method::Get, "/sts/step3", |_req| {
        Ok(HttpResponse::new(200, vec![]).with_header("Set-Cookie", "other=1; Path=/"))
    });
    let (_bus, manager) = token_manager(exec, creds());

    let err = manager.service_token().await.unwrap_err();
    assert!(matches!(err, AuthError::ServiceTokenMissing { .. }));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn repeated_failures_expire_the_cookie() {
    let exec = Arc::new(MemoryExecutor::new());
    exec.on_json(
        Method::Get,
        "/api/user/login",
        serde_json::json!({"code": 0, "data": {}}),
    );
    let (bus, manager) = token_manager(exec, creds());
    let mut auth_rx = bus.auth_subscribe();

    let failures = test_config().max_refresh_failures;
    for _ in 0..failures {
        let _ = manager.refresh().await.unwrap_err();
    }

    let mut saw_expired = false;
    while let Some(event) = auth_rx.try_recv() {
        match event {
            AuthEvent::CookieExpired => saw_expired = true,
            AuthEvent::TokenRefreshFailed { .. } => {}
            AuthEvent::CookieRefreshed => panic!("No refresh should have succeeded"),
        }
    }
    assert!(saw_expired, "Bounded failures must expire the cookie");
}
