//! Credential handling and the three-step service-token handshake.
//!
//! The long-lived `passToken` is exchanged for a short-lived
//! `serviceToken` by walking the web login flow by hand: redirects are
//! *data* here, so the transport never follows them and the `Location`
//! and `Set-Cookie` headers stay observable.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use minote_core::event::AuthEvent;
use minote_util_error::FmtCompact as _;
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, warn};

use crate::api;
use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::transport::{HttpRequest, RequestExecutor, TransportError};

const LOG_TARGET: &str = "minote::auth";

#[derive(Debug, Snafu)]
pub enum AuthError {
    /// Terminal: there is nothing to refresh with; the user must log in
    /// again.
    #[snafu(display("No credentials stored; please log in again"))]
    NoCredentials {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Login endpoint returned no loginUrl"))]
    LoginUrlMissing {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Login url did not redirect"))]
    RedirectMissing {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Redirect target set no serviceToken cookie"))]
    ServiceTokenMissing {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Token refresh timed out"))]
    RefreshTimeout {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Transport failure during token refresh"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Malformed login response: {message}"))]
    Decode {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type AuthResult<T> = std::result::Result<T, AuthError>;

impl AuthError {
    /// Everything except missing credentials may be retried by the
    /// caller.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::NoCredentials { .. })
    }
}

/// The durable login identity.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user_id: String,
    pub pass_token: String,
}

struct CachedToken {
    service_token: String,
    refreshed_at: Instant,
}

/// Holds the long-lived credential and mints short-lived service tokens.
///
/// Refresh is single-flight: concurrent callers funnel through one
/// mutex; whoever wins runs the handshake, everyone else finds a fresh
/// cache when the mutex is released. Waiters time out after
/// `token_refresh_timeout` and `is_refreshing` is force-cleared then,
/// in case the winner got wedged mid-handshake.
pub struct TokenManager {
    transport: Arc<dyn RequestExecutor>,
    bus: Arc<EventBus>,
    config: ClientConfig,

    credentials: Mutex<Option<Credentials>>,
    cached: Mutex<Option<CachedToken>>,
    refresh_flight: tokio::sync::Mutex<()>,
    is_refreshing: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn RequestExecutor>,
        bus: Arc<EventBus>,
        config: ClientConfig,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            transport,
            bus,
            config,
            credentials: Mutex::new(credentials),
            cached: Mutex::new(None),
            refresh_flight: tokio::sync::Mutex::new(()),
            is_refreshing: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock().expect("Locking failed") = Some(credentials);
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn user_id(&self) -> Option<String> {
        self.credentials
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|c| c.user_id.clone())
    }

    /// The cached token, if any, fresh or not.
    pub fn cached_service_token(&self) -> Option<String> {
        self.cached
            .lock()
            .expect("Locking failed")
            .as_ref()
            .map(|c| c.service_token.clone())
    }

    pub fn is_refreshing(&self) -> bool {
        self.is_refreshing.load(Ordering::SeqCst)
    }

    fn fresh_token(&self) -> Option<String> {
        let cached = self.cached.lock().expect("Locking failed");
        cached.as_ref().and_then(|c| {
            (c.refreshed_at.elapsed() < self.config.token_fresh_for)
                .then(|| c.service_token.clone())
        })
    }

    /// Return a token no older than the freshness window, refreshing if
    /// needed.
    pub async fn service_token(&self) -> AuthResult<String> {
        if let Some(token) = self.fresh_token() {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Run (or wait for) a refresh; every concurrent caller gets the
    /// same resulting token off one HTTP handshake.
    ///
    /// Note that a 401-driven refresh must mint a *new* token even when
    /// the cached one is still young, so only flights that completed
    /// after the caller arrived short-circuit.
    pub async fn refresh(&self) -> AuthResult<String> {
        let entered_at = Instant::now();
        let guard = match tokio::time::timeout(
            self.config.token_refresh_timeout,
            self.refresh_flight.lock(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_elapsed) => {
                // The in-flight refresh got wedged; resume waiters and
                // clear the flag so the next caller can try again.
                self.is_refreshing.store(false, Ordering::SeqCst);
                return RefreshTimeoutSnafu.fail();
            }
        };

        // A flight that completed while we waited already refreshed the
        // cache; piggyback instead of running the handshake again.
        {
            let cached = self.cached.lock().expect("Locking failed");
            if let Some(cached) = cached.as_ref() {
                if entered_at <= cached.refreshed_at {
                    return Ok(cached.service_token.clone());
                }
            }
        }

        self.is_refreshing.store(true, Ordering::SeqCst);
        let result = self.refresh_inner().await;
        self.is_refreshing.store(false, Ordering::SeqCst);
        drop(guard);

        match result {
            Ok(token) => {
                *self.cached.lock().expect("Locking failed") = Some(CachedToken {
                    service_token: token.clone(),
                    refreshed_at: Instant::now(),
                });
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.bus.publish_auth(AuthEvent::CookieRefreshed);
                Ok(token)
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    failures,
                    "Token refresh failed"
                );
                self.bus.publish_auth(AuthEvent::TokenRefreshFailed {
                    message: err.to_string(),
                });
                if self.config.max_refresh_failures <= failures
                    || matches!(err, AuthError::NoCredentials { .. })
                {
                    self.bus.publish_auth(AuthEvent::CookieExpired);
                }
                Err(err)
            }
        }
    }

    /// The three-step handshake.
    ///
    /// 1. `GET /api/user/login` with the passToken cookie; expect
    ///    `data.loginUrl`.
    /// 2. `GET loginUrl`, redirects disabled; expect 3xx + `Location`.
    /// 3. `GET Location`, redirects disabled; expect a `Set-Cookie`
    ///    carrying `serviceToken=`, any header case.
    async fn refresh_inner(&self) -> AuthResult<String> {
        let credentials = self
            .credentials
            .lock()
            .expect("Locking failed")
            .clone()
            .context(NoCredentialsSnafu)?;

        let device_id = format!("wb_{}", uuid::Uuid::new_v4());
        let cookie = format!(
            "userId={}; deviceId={device_id}; passToken={}",
            credentials.user_id, credentials.pass_token
        );

        // Step 1: discover the login url.
        let login_path = format!(
            "{}/api/user/login?ts={}&followUp={}&_locale=zh_CN",
            self.config.base_url,
            api::ts_now(),
            urlencoding::encode(&self.config.base_url),
        );
        let response = self
            .transport
            .execute(self.login_request(login_path, &cookie))
            .await
            .context(TransportSnafu)?;

        let body: serde_json::Value = serde_json::from_slice(&response.body).map_err(|err| {
            DecodeSnafu {
                message: err.to_string(),
            }
            .build()
        })?;
        let login_url = body["data"]["loginUrl"]
            .as_str()
            .context(LoginUrlMissingSnafu)?
            .to_owned();
        debug!(target: LOG_TARGET, "Got login url");

        // Step 2: the login url must answer with a redirect.
        let response = self
            .transport
            .execute(self.login_request(login_url, &cookie))
            .await
            .context(TransportSnafu)?;
        if !response.is_redirect() {
            return RedirectMissingSnafu.fail();
        }
        let location = response
            .header("location")
            .context(RedirectMissingSnafu)?
            .to_owned();
        debug!(target: LOG_TARGET, "Got redirect location");

        // Step 3: the redirect target sets the serviceToken cookie.
        let response = self
            .transport
            .execute(self.login_request(location, &cookie))
            .await
            .context(TransportSnafu)?;

        for set_cookie in response.headers_all("set-cookie") {
            if let Some(token) = extract_service_token(set_cookie) {
                debug!(target: LOG_TARGET, "Service token minted");
                return Ok(token);
            }
        }

        ServiceTokenMissingSnafu.fail()
    }

    fn login_request(&self, url: String, cookie: &str) -> HttpRequest {
        HttpRequest::get(url)
            .with_header("User-Agent", self.config.user_agent.clone())
            .with_header("Accept-Language", api::ACCEPT_LANGUAGE)
            .with_header("Cookie", cookie)
            .with_timeout(self.config.http_timeout)
    }
}

fn extract_service_token(set_cookie: &str) -> Option<String> {
    let (name, rest) = set_cookie.split_once('=')?;
    if !name.trim().eq_ignore_ascii_case("serviceToken") {
        return None;
    }
    let value = rest.split(';').next().unwrap_or(rest).trim();
    (!value.is_empty()).then(|| value.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_token_cookie_extraction() {
        assert_eq!(
            extract_service_token("serviceToken=abc123; Path=/; HttpOnly"),
            Some("abc123".to_owned())
        );
        assert_eq!(
            extract_service_token("SERVICETOKEN=xyz"),
            Some("xyz".to_owned())
        );
        assert_eq!(extract_service_token("other=1"), None);
        assert_eq!(extract_service_token("serviceToken=; Path=/"), None);
    }
}
