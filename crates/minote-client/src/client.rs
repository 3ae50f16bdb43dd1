//! Client assembly and lifetime.
//!
//! Construction is where the dependency cycles get broken: the request
//! manager is built before the session client and receives a weak
//! session reference afterwards; the store and the sync engine receive
//! the processor the same way. No component holds a strong reference to
//! the client itself; background tasks carry a [`ClientHandle`] and
//! stop when the client is dropped.

use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::{fmt, ops};

use minote_client_db::Database;
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use tracing::debug;

use crate::LOG_TARGET;
use crate::auth::{Credentials, TokenManager};
use crate::blob::BlobStore;
use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::handlers::{HandlerContext, handler_map};
use crate::id_map::IdMappingRegistry;
use crate::net::NetworkRequestManager;
use crate::online::OnlineState;
use crate::processor::OperationProcessor;
use crate::queue::OperationQueue;
use crate::session::SessionClient;
use crate::startup::{StartupReport, StartupSequencer};
use crate::store::NoteStore;
use crate::sync::attachments::AttachmentResolver;
use crate::sync::{SyncEngine, SyncGuard, SyncStateManager};
use crate::task::online_watcher::OnlineWatcher;
use crate::task::queue_drainer::QueueDrainer;
use crate::task::store_loop::StoreIntentLoop;
use crate::transport::RequestExecutor;

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("Could not prepare data directory"))]
    DataDir { source: io::Error },
}
pub type InitResult<T> = std::result::Result<T, InitError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[snafu(display("Client already stopped"))]
pub struct ClientStoppedError {
    #[snafu(implicit)]
    location: snafu::Location,
}

/// Weak handle to [`Client`]; what background tasks hold.
#[derive(Debug, Clone)]
pub struct ClientHandle(Weak<Client>);

impl ClientHandle {
    pub fn client_ref(&self) -> Result<ClientRef<'_>, ClientStoppedError> {
        let app = self.0.upgrade().context(ClientStoppedSnafu)?;
        Ok(ClientRef {
            app,
            r: PhantomData,
        })
    }
}

impl From<Weak<Client>> for ClientHandle {
    fn from(value: Weak<Client>) -> Self {
        Self(value)
    }
}

/// A strong reference to [`Client`]
///
/// It contains a phantom reference, to avoid attempts of
/// storing it anywhere.
#[derive(Clone)]
pub struct ClientRef<'r> {
    pub(crate) app: Arc<Client>,
    pub(crate) r: PhantomData<&'r ()>,
}

impl ops::Deref for ClientRef<'_> {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.app
    }
}

pub struct Client {
    /// Weak self-reference that can be given out to components
    handle: ClientHandle,

    config: ClientConfig,
    db: Arc<Database>,
    bus: Arc<EventBus>,
    blob: Arc<BlobStore>,
    tokens: Arc<TokenManager>,
    net: Arc<NetworkRequestManager>,
    session: Arc<SessionClient>,
    online: Arc<OnlineState>,
    queue: Arc<OperationQueue>,
    registry: Arc<IdMappingRegistry>,
    store: Arc<NoteStore>,
    processor: Arc<OperationProcessor>,
    engine: Arc<SyncEngine>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

#[bon::bon]
impl Client {
    #[builder(finish_fn(name = "build"))]
    pub async fn new(
        db: Database,
        transport: Arc<dyn RequestExecutor>,
        data_dir: PathBuf,
        config: Option<ClientConfig>,
        credentials: Option<Credentials>,
        #[builder(default = true)] start_tasks: bool,
    ) -> InitResult<Arc<Self>> {
        let config = config.unwrap_or_default();
        let db = Arc::new(db);
        let bus = Arc::new(EventBus::new());

        let blob = BlobStore::new(&data_dir);
        blob.ensure_dirs().await.context(DataDirSnafu)?;

        let tokens = Arc::new(TokenManager::new(
            transport.clone(),
            bus.clone(),
            config.clone(),
            credentials,
        ));

        // Two-phase: the request manager exists before the session
        // client, then learns about it for cookie-refreshing replays.
        let net = NetworkRequestManager::new(transport.clone(), config.clone());
        let session = SessionClient::new(config.clone(), net.clone(), tokens.clone(), bus.clone());
        net.set_session(Arc::downgrade(&session));

        let online = OnlineState::new(bus.clone());
        let queue = OperationQueue::new(db.clone());
        let registry = IdMappingRegistry::new(db.clone(), bus.clone(), config.clone());
        let store = NoteStore::new(db.clone(), bus.clone(), queue.clone(), blob.clone());

        let handlers = handler_map(Arc::new(HandlerContext {
            session: session.clone(),
            registry: registry.clone(),
            store: store.clone(),
            blob: blob.clone(),
        }));
        let processor = OperationProcessor::new(
            queue.clone(),
            registry.clone(),
            handlers,
            config.clone(),
        );
        store.set_processor(processor.clone());
        store.set_online(online.clone());

        let guard = SyncGuard::new(queue.clone(), store.clone());
        let state = SyncStateManager::new(db.clone());
        let attachments = AttachmentResolver::new(session.clone(), blob.clone(), config.clone());
        let engine = SyncEngine::new(
            session.clone(),
            queue.clone(),
            store.clone(),
            guard,
            state,
            attachments,
            bus.clone(),
            config.clone(),
        );
        engine.set_processor(processor.clone());

        let client = Arc::new_cyclic(|app| Self {
            handle: ClientHandle(app.clone()),
            config,
            db,
            bus,
            blob,
            tokens,
            net,
            session,
            online,
            queue,
            registry,
            store,
            processor,
            engine,
        });

        if start_tasks {
            client.start_store_loop();
            client.start_queue_drainer();
            client.start_online_watcher();
        }

        debug!(target: LOG_TARGET, "Client assembled");
        Ok(client)
    }

    pub(crate) fn start_store_loop(&self) {
        tokio::spawn(StoreIntentLoop::new(self).run());
    }

    pub(crate) fn start_queue_drainer(&self) {
        tokio::spawn(QueueDrainer::new(self).run());
    }

    pub(crate) fn start_online_watcher(&self) {
        tokio::spawn(OnlineWatcher::new(self).run());
    }

    /// Run the three-phase startup sequence.
    pub async fn startup(&self) -> StartupReport {
        StartupSequencer::new(
            self.store.clone(),
            self.registry.clone(),
            self.queue.clone(),
            self.processor.clone(),
            self.engine.clone(),
            self.online.clone(),
            self.bus.clone(),
        )
        .run()
        .await
    }

    /// Input from the OS reachability probe.
    pub fn set_reachable(&self, reachable: bool) {
        self.online.set_reachable(reachable);
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn blob(&self) -> &Arc<BlobStore> {
        &self.blob
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn net(&self) -> &Arc<NetworkRequestManager> {
        &self.net
    }

    pub fn session(&self) -> &Arc<SessionClient> {
        &self.session
    }

    pub fn online(&self) -> &Arc<OnlineState> {
        &self.online
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<IdMappingRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<NoteStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<OperationProcessor> {
        &self.processor
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}
