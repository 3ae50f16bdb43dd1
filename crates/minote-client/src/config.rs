use std::time::Duration;

/// Tunables for the sync kernel.
///
/// Defaults match the production service; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,

    /// Per-request transport timeout.
    pub http_timeout: Duration,
    /// Maximum concurrent in-flight requests.
    pub max_concurrent_requests: usize,
    /// Identical requests observed within this window fail fast as
    /// duplicates.
    pub dedup_window: Duration,
    /// TTL for cached GET responses; `None` disables the cache.
    pub get_cache_ttl: Option<Duration>,

    /// Service token is considered fresh for this long.
    pub token_fresh_for: Duration,
    /// Waiters on a token refresh give up after this long.
    pub token_refresh_timeout: Duration,
    /// Consecutive refresh failures before the user must sign in again.
    pub max_refresh_failures: u32,

    /// Operation retry backoff: `base * 2^(retry_count - 1)`, capped.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Attempts before an operation is marked failed.
    pub max_operation_retries: u32,

    /// Page size for list endpoints.
    pub page_limit: usize,

    /// Attachment download retries and their delays.
    pub attachment_retry_delays: Vec<Duration>,

    /// File-id remap: how often and how many times to poll the note
    /// content for the temporary file id.
    pub file_remap_poll_attempts: u32,
    pub file_remap_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://i.mi.com".to_owned(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                         (KHTML, like Gecko) Version/17.4 Safari/605.1.15"
                .to_owned(),
            http_timeout: Duration::from_secs(30),
            max_concurrent_requests: 5,
            dedup_window: Duration::from_millis(500),
            get_cache_ttl: None,
            token_fresh_for: Duration::from_secs(10 * 60),
            token_refresh_timeout: Duration::from_secs(30),
            max_refresh_failures: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            max_operation_retries: 3,
            page_limit: 200,
            attachment_retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ],
            file_remap_poll_attempts: 10,
            file_remap_poll_interval: Duration::from_millis(500),
        }
    }
}
