//! The narrow HTTP transport contract.
//!
//! The kernel never talks to an HTTP client directly; it hands a
//! [`HttpRequest`] to a [`RequestExecutor`] and gets back status, headers
//! and bytes. The executor never follows redirects: the token-refresh
//! handshake reads `Location` and `Set-Cookie` as data.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use snafu::{Location, Snafu};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
        })
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: vec![],
            body: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: vec![],
            body: Some(body),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace (or insert) a header, case-insensitively.
    pub fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_owned(), value)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![],
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every header with the given name, matched case-insensitively.
    pub fn headers_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("Request timed out"))]
    Timeout {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Connection failed: {message}"))]
    Connect {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Transport failure: {message}"))]
    Other {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// One async call: request in, bytes + status + headers out.
///
/// Implementations must not follow redirects and must not retry.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, req: HttpRequest) -> TransportResult<HttpResponse>;
}

/// Production executor backed by reqwest.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new() -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| {
                OtherSnafu {
                    message: err.to_string(),
                }
                .build()
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    async fn execute(&self, req: HttpRequest) -> TransportResult<HttpResponse> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        };

        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let response = builder
            .timeout(req.timeout)
            .send()
            .await
            .map_err(|err| map_reqwest_error(&err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| map_reqwest_error(&err))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TimeoutSnafu.build()
    } else if err.is_connect() {
        ConnectSnafu {
            message: err.to_string(),
        }
        .build()
    } else {
        OtherSnafu {
            message: err.to_string(),
        }
        .build()
    }
}

type RouteHandler =
    Box<dyn Fn(&HttpRequest) -> TransportResult<HttpResponse> + Send + Sync + 'static>;

/// In-memory executor for tests and local experimentation.
///
/// Routes are matched by method and URL-path prefix, in registration
/// order. Every executed request is recorded for later inspection.
#[derive(Default)]
pub struct MemoryExecutor {
    routes: Mutex<Vec<(Method, String, RouteHandler)>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for requests whose URL path starts with
    /// `path_prefix`.
    pub fn on(
        &self,
        method: Method,
        path_prefix: impl Into<String>,
        handler: impl Fn(&HttpRequest) -> TransportResult<HttpResponse> + Send + Sync + 'static,
    ) {
        self.routes
            .lock()
            .expect("Locking failed")
            .push((method, path_prefix.into(), Box::new(handler)));
    }

    /// Register a handler returning a fixed JSON body with status 200.
    pub fn on_json(&self, method: Method, path_prefix: impl Into<String>, body: serde_json::Value) {
        self.on(method, path_prefix, move |_req| {
            Ok(HttpResponse::new(200, body.to_string().into_bytes()))
        });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.log.lock().expect("Locking failed").clone()
    }

    /// How many executed requests hit the given path prefix.
    pub fn hits(&self, path_prefix: &str) -> usize {
        self.log
            .lock()
            .expect("Locking failed")
            .iter()
            .filter(|req| path_of(&req.url).starts_with(path_prefix))
            .count()
    }
}

fn path_of(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_owned())
        .unwrap_or_else(|_| url.to_owned())
}

#[async_trait]
impl RequestExecutor for MemoryExecutor {
    async fn execute(&self, req: HttpRequest) -> TransportResult<HttpResponse> {
        self.log.lock().expect("Locking failed").push(req.clone());

        let path = path_of(&req.url);
        let routes = self.routes.lock().expect("Locking failed");
        for (method, prefix, handler) in routes.iter() {
            if *method == req.method && path.starts_with(prefix.as_str()) {
                return handler(&req);
            }
        }

        Ok(HttpResponse::new(404, b"not found".to_vec()))
    }
}

impl TransportError {
    /// Transport failures are always retryable per the error taxonomy.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Map of lower-cased cookie names to values, parsed from a `Cookie`
/// header value.
pub fn parse_cookie_header(value: &str) -> HashMap<String, String> {
    value
        .split(';')
        .filter_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            Some((k.trim().to_ascii_lowercase(), v.trim().to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let resp = HttpResponse::new(302, vec![])
            .with_header("LOCATION", "https://example.com/next")
            .with_header("set-cookie", "a=1")
            .with_header("Set-Cookie", "serviceToken=tok; Path=/");

        assert_eq!(resp.header("location"), Some("https://example.com/next"));
        assert_eq!(resp.headers_all("SET-COOKIE").count(), 2);
        assert!(resp.is_redirect());
    }

    #[test]
    fn cookie_parsing() {
        let cookies = parse_cookie_header("userId=u1; deviceId=wb_x; passToken=p");
        assert_eq!(cookies.get("userid").map(String::as_str), Some("u1"));
        assert_eq!(cookies.get("passtoken").map(String::as_str), Some("p"));
    }

    #[test_log::test(tokio::test)]
    async fn memory_executor_routes_and_logs() {
        let exec = MemoryExecutor::new();
        exec.on_json(
            Method::Get,
            "/note/full/page",
            serde_json::json!({"code": 0}),
        );

        let resp = exec
            .execute(HttpRequest::get("https://i.mi.com/note/full/page?ts=1"))
            .await
            .expect("Executes");
        assert_eq!(resp.status, 200);

        let resp = exec
            .execute(HttpRequest::get("https://i.mi.com/unknown"))
            .await
            .expect("Executes");
        assert_eq!(resp.status, 404);

        assert_eq!(exec.hits("/note/full/page"), 1);
        assert_eq!(exec.requests().len(), 2);
    }
}
