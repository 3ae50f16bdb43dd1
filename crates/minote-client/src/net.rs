//! Request scheduling above the raw transport.
//!
//! All queueing state lives inside one worker task; callers hand in a
//! request and suspend on a completion channel. The worker orders
//! pending requests by (priority desc, submission order asc), caps
//! in-flight concurrency, fails fast on duplicates inside a small
//! window, optionally caches GET responses, and parks transient
//! failures while offline so they replay on the online edge.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use minote_util_error::FmtCompact as _;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::session::SessionClient;
use crate::transport::{HttpRequest, HttpResponse, Method, RequestExecutor, TransportError};

const LOG_TARGET: &str = "minote::net";

/// Default scheduling priority for interactive calls.
pub const PRIORITY_NORMAL: u8 = 5;
/// Background work (sync pulls, attachment downloads).
pub const PRIORITY_BACKGROUND: u8 = 3;
/// Auth and health probes go first.
pub const PRIORITY_HIGH: u8 = 8;

#[derive(Debug, Snafu)]
pub enum NetError {
    /// Identical (url, method, body) observed within the dedup window.
    #[snafu(display("Duplicate request"))]
    Duplicate {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Transport failure"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Request manager stopped"))]
    Shutdown {
        #[snafu(implicit)]
        location: Location,
    },
}
pub type NetResult<T> = std::result::Result<T, NetError>;

struct Submission {
    req: HttpRequest,
    priority: u8,
    resp_tx: oneshot::Sender<NetResult<HttpResponse>>,
    /// Nonzero once this request has been replayed from the retry queue.
    replays: u32,
    /// The 401 refresh-and-retry resends the same bytes on purpose; it
    /// must not trip the duplicate window.
    bypass_dedup: bool,
}

enum Command {
    Submit(Submission),
    OnlineChanged(bool),
}

type DedupKey = (Method, String, Option<Vec<u8>>);

pub struct NetworkRequestManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    session: Arc<OnceLock<Weak<SessionClient>>>,
}

impl NetworkRequestManager {
    pub fn new(transport: Arc<dyn RequestExecutor>, config: ClientConfig) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let session = Arc::new(OnceLock::new());

        let worker = Worker {
            transport,
            config,
            done_tx,
            session: session.clone(),
            pending: BTreeMap::new(),
            dedup: HashMap::new(),
            get_cache: HashMap::new(),
            retry_queue: vec![],
            in_flight: 0,
            next_seq: 0,
            online: true,
        };
        tokio::spawn(worker.run(cmd_rx, done_rx));

        Arc::new(Self { cmd_tx, session })
    }

    /// Two-phase wiring: the session client is constructed after the
    /// manager but replayed requests need its current cookie, so the
    /// reference is injected back once it exists.
    pub fn set_session(&self, session: Weak<SessionClient>) {
        let _ = self.session.set(session);
    }

    /// Submit a request and suspend until it completes.
    pub async fn execute(&self, req: HttpRequest, priority: u8) -> NetResult<HttpResponse> {
        self.submit(req, priority, false).await
    }

    /// Like [`Self::execute`], but exempt from duplicate detection.
    pub async fn execute_nodedup(&self, req: HttpRequest, priority: u8) -> NetResult<HttpResponse> {
        self.submit(req, priority, true).await
    }

    async fn submit(
        &self,
        req: HttpRequest,
        priority: u8,
        bypass_dedup: bool,
    ) -> NetResult<HttpResponse> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit(Submission {
                req,
                priority,
                resp_tx,
                replays: 0,
                bypass_dedup,
            }))
            .map_err(|_| ShutdownSnafu.build())?;

        resp_rx.await.map_err(|_| ShutdownSnafu.build())?
    }

    /// Called on every edge of the aggregate online flag.
    pub fn notify_online(&self, online: bool) {
        let _ = self.cmd_tx.send(Command::OnlineChanged(online));
    }
}

type Completion = (Submission, NetResult<HttpResponse>);

struct Worker {
    transport: Arc<dyn RequestExecutor>,
    config: ClientConfig,
    done_tx: mpsc::UnboundedSender<Completion>,
    session: Arc<OnceLock<Weak<SessionClient>>>,

    /// (priority desc, submission order asc) → submission.
    pending: BTreeMap<(Reverse<u8>, u64), Submission>,
    dedup: HashMap<DedupKey, Instant>,
    get_cache: HashMap<String, (Instant, HttpResponse)>,
    retry_queue: Vec<Submission>,
    in_flight: usize,
    next_seq: u64,
    online: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut cmd_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if cmd_open => match cmd {
                    Some(Command::Submit(submission)) => self.on_submit(submission),
                    Some(Command::OnlineChanged(online)) => self.on_online_changed(online),
                    None => cmd_open = false,
                },
                completion = done_rx.recv() => {
                    // The worker holds a sender, so the channel outlives it.
                    let Some((submission, outcome)) = completion else { break };
                    self.on_completed(submission, outcome);
                }
            }

            self.dispatch();

            if !cmd_open && self.in_flight == 0 {
                break;
            }
        }
        debug!(target: LOG_TARGET, "Request manager stopped");
    }

    fn on_submit(&mut self, submission: Submission) {
        let now = Instant::now();
        self.dedup
            .retain(|_k, seen| now.duration_since(*seen) < self.config.dedup_window);

        if !submission.bypass_dedup {
            let key: DedupKey = (
                submission.req.method,
                submission.req.url.clone(),
                submission.req.body.clone(),
            );
            if self.dedup.contains_key(&key) {
                trace!(target: LOG_TARGET, url = %submission.req.url, "Duplicate request");
                let _ = submission.resp_tx.send(DuplicateSnafu.fail());
                return;
            }
            self.dedup.insert(key, now);
        }

        if submission.req.method == Method::Get {
            if let Some(ttl) = self.config.get_cache_ttl {
                if let Some((cached_at, response)) = self.get_cache.get(&submission.req.url) {
                    if now.duration_since(*cached_at) < ttl {
                        trace!(target: LOG_TARGET, url = %submission.req.url, "Cache hit");
                        let _ = submission.resp_tx.send(Ok(response.clone()));
                        return;
                    }
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .insert((Reverse(submission.priority), seq), submission);
    }

    fn on_completed(&mut self, submission: Submission, outcome: NetResult<HttpResponse>) {
        self.in_flight -= 1;

        match outcome {
            Ok(response) => {
                if submission.req.method == Method::Get
                    && self.config.get_cache_ttl.is_some()
                    && response.status == 200
                {
                    self.get_cache
                        .insert(submission.req.url.clone(), (Instant::now(), response.clone()));
                }
                let _ = submission.resp_tx.send(Ok(response));
            }
            Err(err) => {
                let transient =
                    matches!(&err, NetError::Transport { source, .. } if source.is_retryable());
                if transient && !self.online {
                    // Park it; the caller keeps waiting and the request
                    // replays on the next online edge.
                    debug!(
                        target: LOG_TARGET,
                        url = %submission.req.url,
                        err = %err.fmt_compact(),
                        "Parking request until online"
                    );
                    self.retry_queue.push(submission);
                } else {
                    let _ = submission.resp_tx.send(Err(err));
                }
            }
        }
    }

    fn on_online_changed(&mut self, online: bool) {
        let was_online = std::mem::replace(&mut self.online, online);
        if online && !was_online {
            let ready = std::mem::take(&mut self.retry_queue);
            if !ready.is_empty() {
                debug!(target: LOG_TARGET, count = ready.len(), "Replaying parked requests");
            }
            for mut submission in ready {
                submission.replays += 1;
                let seq = self.next_seq;
                self.next_seq += 1;
                self.pending
                    .insert((Reverse(submission.priority), seq), submission);
            }
        }
    }

    fn dispatch(&mut self) {
        while self.in_flight < self.config.max_concurrent_requests {
            let Some(key) = self.pending.keys().next().copied() else {
                break;
            };
            let mut submission = self.pending.remove(&key).expect("Key just observed");

            // A replayed request may carry a cookie that expired while it
            // was parked.
            if 0 < submission.replays {
                if let Some(session) = self.session.get().and_then(Weak::upgrade) {
                    if submission.req.header("cookie").is_some() {
                        if let Some(cookie) = session.current_cookie() {
                            submission.req.set_header("cookie", cookie);
                        }
                    }
                }
            }

            self.in_flight += 1;
            let transport = self.transport.clone();
            let done_tx = self.done_tx.clone();
            tokio::spawn(async move {
                let req = submission.req.clone();
                let outcome = transport.execute(req).await.context(TransportSnafu);
                let _ = done_tx.send((submission, outcome));
            });
        }
    }
}
