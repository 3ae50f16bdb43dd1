//! Authenticated request execution.
//!
//! A thin layer above the request manager: attach the current cookie,
//! execute, decode the envelope; on 401/403 refresh the token through
//! the token manager and retry the original request exactly once.

use std::sync::Arc;

use minote_core::event::AuthEvent;
use serde_json::Value;
use snafu::{IntoError as _, ResultExt as _};
use tracing::{debug, trace};

use crate::api::{self, ApiResult, AuthSnafu};
use crate::auth::TokenManager;
use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::net::{NetError, NetworkRequestManager};
use crate::transport::{HttpRequest, HttpResponse, Method};

const LOG_TARGET: &str = "minote::session";

/// Longest body prefix that makes it into the logs.
const LOG_BODY_LIMIT: usize = 512;

pub struct SessionClient {
    config: ClientConfig,
    net: Arc<NetworkRequestManager>,
    tokens: Arc<TokenManager>,
    bus: Arc<EventBus>,
}

impl SessionClient {
    pub fn new(
        config: ClientConfig,
        net: Arc<NetworkRequestManager>,
        tokens: Arc<TokenManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            net,
            tokens,
            bus,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// The cookie attached to every authenticated request, if one can be
    /// assembled from the cached credentials.
    pub fn current_cookie(&self) -> Option<String> {
        let user_id = self.tokens.user_id()?;
        let token = self.tokens.cached_service_token()?;
        Some(format!("userId={user_id}; serviceToken={token}"))
    }

    /// Whether a usable (possibly stale) session cookie exists.
    pub fn has_cookie(&self) -> bool {
        self.current_cookie().is_some()
    }

    pub async fn get_json(&self, path: &str, priority: u8) -> ApiResult<Value> {
        self.request_json(Method::Get, path, None, priority).await
    }

    pub async fn post_form(&self, path: &str, body: Vec<u8>, priority: u8) -> ApiResult<Value> {
        self.request_json(Method::Post, path, Some(body), priority)
            .await
    }

    /// Fetch raw bytes from an absolute URL (attachment CDNs); no
    /// cookie, no envelope.
    pub async fn get_bytes_absolute(&self, url: &str, priority: u8) -> ApiResult<Vec<u8>> {
        let req = HttpRequest::get(url)
            .with_header("User-Agent", self.config.user_agent.clone())
            .with_timeout(self.config.http_timeout);

        let response = self.execute_mapped(req, priority, false).await?;
        match response.status {
            200 => Ok(response.body),
            status => status_error(status),
        }
    }

    /// POST raw bytes to an absolute URL (upload block chunks); no
    /// cookie, no envelope.
    pub async fn post_bytes_absolute(
        &self,
        url: &str,
        body: Vec<u8>,
        priority: u8,
    ) -> ApiResult<Vec<u8>> {
        let req = HttpRequest::post(url, body)
            .with_header("User-Agent", self.config.user_agent.clone())
            .with_header("Content-Type", "application/octet-stream")
            .with_timeout(self.config.http_timeout);

        let response = self.execute_mapped(req, priority, false).await?;
        match response.status {
            200 => Ok(response.body),
            status => status_error(status),
        }
    }

    /// Probe whether the server still accepts the session cookie.
    pub async fn check_cookie_health(&self) -> ApiResult<bool> {
        match self
            .get_json(
                &api::common_check_path(api::ts_now()),
                crate::net::PRIORITY_HIGH,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if matches!(err, crate::api::ApiError::Client { status: 401 | 403, .. }) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Account profile, as served by the lite endpoint.
    pub async fn fetch_profile(&self) -> ApiResult<Value> {
        self.get_json(&api::profile_path(api::ts_now()), crate::net::PRIORITY_HIGH)
            .await
    }

    /// Undo a server-side deletion while it is still in the trash.
    pub async fn restore_note(&self, note_id: &minote_core::NoteId, tag: &str) -> ApiResult<Value> {
        self.post_form(
            &api::note_restore_path(note_id),
            api::kv_form_body(&[("tag", tag)]),
            crate::net::PRIORITY_NORMAL,
        )
        .await
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        priority: u8,
    ) -> ApiResult<Value> {
        let token = self.tokens.service_token().await.context(AuthSnafu)?;
        let request = self.build_request(method, path, body.clone(), &token);
        self.log_request(&request);

        let response = self.execute_mapped(request, priority, false).await?;
        self.log_response(path, &response);

        match response.status {
            200 => api::decode_envelope(&response.body),
            401 | 403 => {
                debug!(target: LOG_TARGET, path, status = response.status, "Auth rejected, refreshing token");
                let token = self.tokens.refresh().await.context(AuthSnafu)?;

                // Exactly one retry with the refreshed cookie.
                let request = self.build_request(method, path, body, &token);
                let response = self.execute_mapped(request, priority, true).await?;
                self.log_response(path, &response);

                match response.status {
                    200 => api::decode_envelope(&response.body),
                    401 | 403 => {
                        self.bus.publish_auth(AuthEvent::CookieExpired);
                        status_error(response.status)
                    }
                    status => status_error(status),
                }
            }
            status => status_error(status),
        }
    }

    async fn execute_mapped(
        &self,
        request: HttpRequest,
        priority: u8,
        bypass_dedup: bool,
    ) -> ApiResult<HttpResponse> {
        let result = if bypass_dedup {
            self.net.execute_nodedup(request, priority).await
        } else {
            self.net.execute(request, priority).await
        };

        result.map_err(|err| match err {
            NetError::Duplicate { .. } => api::DuplicateSnafu.build(),
            NetError::Transport { source, .. } => api::TransportSnafu.into_error(source),
            NetError::Shutdown { .. } => api::DecodeSnafu {
                message: "request manager stopped".to_owned(),
            }
            .build(),
        })
    }

    fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        service_token: &str,
    ) -> HttpRequest {
        let url = format!("{}{path}", self.config.base_url);
        let user_id = self.tokens.user_id().unwrap_or_default();
        let cookie = format!("userId={user_id}; serviceToken={service_token}");

        let mut request = match method {
            Method::Get => HttpRequest::get(url),
            Method::Post => HttpRequest::post(url, body.unwrap_or_default()).with_header(
                "Content-Type",
                api::FORM_CONTENT_TYPE,
            ),
        };
        request = request
            .with_header("User-Agent", self.config.user_agent.clone())
            .with_header("Accept-Language", api::ACCEPT_LANGUAGE)
            .with_header("Cookie", cookie)
            .with_timeout(self.config.http_timeout);
        request
    }

    fn log_request(&self, request: &HttpRequest) {
        trace!(
            target: LOG_TARGET,
            method = %request.method,
            url = %request.url,
            body = %truncated(request.body.as_deref().unwrap_or_default()),
            "Request"
        );
    }

    fn log_response(&self, path: &str, response: &HttpResponse) {
        trace!(
            target: LOG_TARGET,
            path,
            status = response.status,
            body = %truncated(&response.body),
            "Response"
        );
    }
}

fn status_error<T>(status: u16) -> ApiResult<T> {
    if 500 <= status || status == 429 {
        api::ServerSnafu { status }.fail()
    } else {
        api::ClientSnafu { status }.fail()
    }
}

fn truncated(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= LOG_BODY_LIMIT {
        return text.into_owned();
    }

    let mut cut = LOG_BODY_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... ({} bytes)", &text[..cut], body.len())
}
