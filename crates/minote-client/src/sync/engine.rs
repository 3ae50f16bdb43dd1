//! The pull side of synchronization.
//!
//! `perform_sync` is the sole mutating entry and is mutually exclusive;
//! a second call while one runs is refused. The engine never writes the
//! database: every accepted record is published as an intent for the
//! note store to apply.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, OnceLock};

use minote_client_db::DbError;
use minote_core::event::{DeleteOrigin, FolderEvent, NoteEvent, SyncEvent, SyncMode};
use minote_core::{FolderId, NoteId};
use minote_util_error::FmtCompact as _;
use snafu::{Location, ResultExt as _, Snafu};
use tracing::{debug, info, warn};

use crate::api::{self, ApiError, CloudFolder, CloudNoteSummary, SyncPage};
use crate::bus::EventBus;
use crate::config::ClientConfig;
use crate::net::PRIORITY_BACKGROUND;
use crate::processor::OperationProcessor;
use crate::queue::OperationQueue;
use crate::session::SessionClient;
use crate::store::NoteStore;
use crate::sync::attachments::AttachmentResolver;
use crate::sync::guard::SyncGuard;
use crate::sync::state::SyncStateManager;

const LOG_TARGET: &str = "minote::sync";

#[derive(Debug, Snafu)]
pub enum SyncError {
    #[snafu(display("Cloud request failed"))]
    Api {
        source: ApiError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Local storage failed"))]
    Db {
        source: DbError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { downloaded_count: usize },
    /// A sync was already running; nothing happened.
    AlreadySyncing,
}

/// One fetched record set, with whether it covers the *entire* cloud
/// state (only a complete set may drive local-deletion reconciliation).
struct Pulled {
    page: SyncPage,
    complete_set: bool,
}

pub struct SyncEngine {
    session: Arc<SessionClient>,
    queue: Arc<OperationQueue>,
    store: Arc<NoteStore>,
    guard: Arc<SyncGuard>,
    state: Arc<SyncStateManager>,
    attachments: Arc<AttachmentResolver>,
    bus: Arc<EventBus>,
    config: ClientConfig,

    is_syncing: AtomicBool,
    processor: OnceLock<Arc<OperationProcessor>>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionClient>,
        queue: Arc<OperationQueue>,
        store: Arc<NoteStore>,
        guard: Arc<SyncGuard>,
        state: Arc<SyncStateManager>,
        attachments: Arc<AttachmentResolver>,
        bus: Arc<EventBus>,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            queue,
            store,
            guard,
            state,
            attachments,
            bus,
            config,
            is_syncing: AtomicBool::new(false),
            processor: OnceLock::new(),
        })
    }

    /// Two-phase wiring; reconciliation pushes pending creates through
    /// the processor.
    pub fn set_processor(&self, processor: Arc<OperationProcessor>) {
        let _ = self.processor.set(processor);
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(SeqCst)
    }

    pub fn state(&self) -> &SyncStateManager {
        &self.state
    }

    /// Incremental when a committed cursor exists, full otherwise.
    pub async fn smart_sync(&self) -> SyncResult<SyncOutcome> {
        let mode = match self.state.committed_sync_tag().await.context(DbSnafu)? {
            Some(_) => SyncMode::Incremental,
            None => SyncMode::Full {
                force_redownload: false,
            },
        };
        self.perform_sync(mode).await
    }

    pub async fn perform_incremental_sync(&self) -> SyncResult<SyncOutcome> {
        self.perform_sync(SyncMode::Incremental).await
    }

    /// The sole mutating entry; refuses to overlap itself.
    pub async fn perform_sync(&self, mode: SyncMode) -> SyncResult<SyncOutcome> {
        if self.is_syncing.swap(true, SeqCst) {
            warn!(target: LOG_TARGET, ?mode, "Sync already running; refusing");
            return Ok(SyncOutcome::AlreadySyncing);
        }

        self.bus.publish_sync(SyncEvent::Requested { mode });
        let result = self.perform_sync_inner(mode).await;
        self.is_syncing.store(false, SeqCst);

        match result {
            Ok(downloaded_count) => {
                info!(target: LOG_TARGET, ?mode, downloaded_count, "Sync completed");
                self.bus
                    .publish_sync(SyncEvent::Completed { downloaded_count });
                Ok(SyncOutcome::Completed { downloaded_count })
            }
            Err(err) => {
                warn!(target: LOG_TARGET, ?mode, err = %err.fmt_compact(), "Sync failed");
                self.bus.publish_sync(SyncEvent::Failed {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn perform_sync_inner(&self, mode: SyncMode) -> SyncResult<usize> {
        self.bus.publish_sync(SyncEvent::Started { mode });

        match mode {
            SyncMode::Incremental => self.incremental_sync().await,
            SyncMode::Full { force_redownload } => self.full_sync(force_redownload).await,
        }
    }

    // ========================================================================
    // Incremental
    // ========================================================================

    async fn incremental_sync(&self) -> SyncResult<usize> {
        let cursor = self.state.committed_sync_tag().await.context(DbSnafu)?;
        let pulled = self.pull_with_fallback(cursor.as_deref()).await?;

        self.process_folders(&pulled.page.folders);
        let (downloaded, present_notes) = self.process_entries(&pulled.page.entries, false).await?;

        if pulled.complete_set {
            let present_folders: HashSet<FolderId> = pulled
                .page
                .folders
                .iter()
                .filter(|f| !f.deleted)
                .map(|f| f.folder.id.clone())
                .collect();
            self.reconcile_local(&present_notes, &present_folders).await?;
        }

        self.stage_cursor(pulled.page.sync_tag).await?;
        Ok(downloaded)
    }

    /// Three tiers, in order: lightweight (changes since the cursor),
    /// web full sync, legacy pager. Any failure falls through to the
    /// next tier.
    async fn pull_with_fallback(&self, cursor: Option<&str>) -> SyncResult<Pulled> {
        if let Some(cursor) = cursor {
            let data = serde_json::json!({ "syncTag": cursor });
            match self
                .session
                .get_json(
                    &api::web_sync_path(api::ts_now(), &data, 0),
                    PRIORITY_BACKGROUND,
                )
                .await
                .map(|envelope| api::extract_sync_page(&envelope))
            {
                Ok(page) => {
                    debug!(target: LOG_TARGET, entries = page.entries.len(), "Lightweight pull succeeded");
                    return Ok(Pulled {
                        page,
                        complete_set: false,
                    });
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Lightweight pull failed; falling back to web sync"
                    );
                }
            }
        }

        let data = serde_json::json!({});
        match self
            .session
            .get_json(
                &api::web_sync_path(api::ts_now(), &data, 0),
                PRIORITY_BACKGROUND,
            )
            .await
            .map(|envelope| api::extract_sync_page(&envelope))
        {
            Ok(page) if !page.entries.is_empty() || !page.folders.is_empty() || page.sync_tag.is_some() => {
                debug!(target: LOG_TARGET, entries = page.entries.len(), "Web pull succeeded");
                return Ok(Pulled {
                    page,
                    complete_set: true,
                });
            }
            Ok(_) => {
                warn!(target: LOG_TARGET, "Web pull returned an empty shape; falling back to legacy pager");
            }
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Web pull failed; falling back to legacy pager"
                );
            }
        }

        let page = self.pull_legacy_pages(None).await?;
        Ok(Pulled {
            page,
            complete_set: true,
        })
    }

    /// Page through the legacy list endpoint, trusting only the
    /// *response* cursor for pagination.
    async fn pull_legacy_pages(&self, folder: Option<&FolderId>) -> SyncResult<SyncPage> {
        let mut combined = SyncPage::default();
        let mut cursor: Option<String> = None;

        loop {
            let path = match folder {
                Some(folder_id) => api::folder_page_path(
                    api::ts_now(),
                    folder_id,
                    self.config.page_limit,
                    cursor.as_deref(),
                ),
                None => api::page_path(api::ts_now(), self.config.page_limit, cursor.as_deref()),
            };
            let envelope = self
                .session
                .get_json(&path, PRIORITY_BACKGROUND)
                .await
                .context(ApiSnafu)?;
            let page = api::extract_sync_page(&envelope);

            let fetched = page.entries.len();
            combined.entries.extend(page.entries);
            combined.folders.extend(page.folders);
            if page.sync_tag.is_some() {
                combined.sync_tag = page.sync_tag.clone();
            }

            let next_cursor = page.sync_tag;
            let done = fetched < self.config.page_limit
                || next_cursor.is_none()
                || next_cursor == cursor;
            if done {
                break;
            }
            cursor = next_cursor;
        }

        Ok(combined)
    }

    // ========================================================================
    // Full
    // ========================================================================

    async fn full_sync(&self, force_redownload: bool) -> SyncResult<usize> {
        // The cloud re-sends everything; local non-system folders and
        // server-known notes are cleared first. Temporary-id notes are
        // un-pushed local work and always survive.
        self.store.clear_for_full_sync().await.context(DbSnafu)?;

        let page = self.pull_legacy_pages(None).await?;
        self.process_folders(&page.folders);
        let (mut downloaded, _present) = self.process_entries(&page.entries, force_redownload).await?;

        // The private folder is not part of the main listing.
        let private = FolderId::private();
        let private_page = self.pull_legacy_pages(Some(&private)).await?;
        let (private_downloaded, _present) = self
            .process_entries(&private_page.entries, force_redownload)
            .await?;
        downloaded += private_downloaded;

        self.stage_cursor(page.sync_tag).await?;
        Ok(downloaded)
    }

    // ========================================================================
    // Shared plumbing
    // ========================================================================

    fn process_folders(&self, folders: &[CloudFolder]) {
        let mut saved = vec![];
        for cloud_folder in folders {
            if cloud_folder.deleted {
                self.bus.publish_folder(FolderEvent::Deleted {
                    folder_id: cloud_folder.folder.id.clone(),
                    origin: DeleteOrigin::Cloud,
                });
            } else {
                saved.push(cloud_folder.folder.clone());
            }
        }

        match saved.len() {
            0 => {}
            1 => self
                .bus
                .publish_folder(FolderEvent::FolderSaved(saved.remove(0))),
            _ => self.bus.publish_folder(FolderEvent::BatchSaved(saved)),
        }
    }

    /// Guard, fetch detail, resolve attachments, publish. Returns the
    /// download count and the set of note ids the cloud reports as
    /// alive.
    async fn process_entries(
        &self,
        entries: &[CloudNoteSummary],
        force_redownload: bool,
    ) -> SyncResult<(usize, HashSet<NoteId>)> {
        let total = entries.len();
        let mut downloaded = 0;
        let mut present = HashSet::new();

        for (index, entry) in entries.iter().enumerate() {
            if entry.is_deleted() {
                self.bus.publish_note(NoteEvent::Deleted {
                    note_id: entry.id.clone(),
                    origin: DeleteOrigin::Cloud,
                });
                continue;
            }
            present.insert(entry.id.clone());

            if self
                .guard
                .get_skip_reason(&entry.id, entry.modify_date)
                .await
                .context(DbSnafu)?
                .is_some()
            {
                continue;
            }

            let envelope = match self
                .session
                .get_json(
                    &api::note_detail_path(&entry.id, api::ts_now()),
                    PRIORITY_BACKGROUND,
                )
                .await
            {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        note_id = %entry.id,
                        err = %err.fmt_compact(),
                        "Note detail fetch failed; leaving for next sync"
                    );
                    continue;
                }
            };
            let mut note = match api::parse_note_detail(&envelope) {
                Ok(note) => note,
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        note_id = %entry.id,
                        err = %err.fmt_compact(),
                        "Note detail unparsable; leaving for next sync"
                    );
                    continue;
                }
            };

            self.attachments
                .resolve_note_attachments(&mut note, force_redownload)
                .await;

            self.bus.publish_sync(SyncEvent::NoteDownloaded(note));
            downloaded += 1;
            self.bus.publish_sync(SyncEvent::Progress {
                current: index + 1,
                total,
            });
        }

        Ok((downloaded, present))
    }

    /// After consuming a complete cloud set: local rows the cloud does
    /// not know about either still need their create pushed, or the
    /// cloud already forgot them.
    async fn reconcile_local(
        &self,
        cloud_notes: &HashSet<NoteId>,
        cloud_folders: &HashSet<FolderId>,
    ) -> SyncResult<()> {
        let mut push_creates = false;

        for note in self.store.notes() {
            if cloud_notes.contains(&note.id) {
                continue;
            }
            if self
                .queue
                .has_pending_note_create(&note.id)
                .await
                .context(DbSnafu)?
            {
                push_creates = true;
                continue;
            }
            if note.id.is_temporary() {
                // No pending create but also not uploadable as-is; the
                // mapping recovery owns this case.
                continue;
            }
            debug!(target: LOG_TARGET, note_id = %note.id, "Cloud forgot note; deleting locally");
            self.bus.publish_note(NoteEvent::Deleted {
                note_id: note.id.clone(),
                origin: DeleteOrigin::Cloud,
            });
        }

        for folder in self.store.folders() {
            if folder.is_system || cloud_folders.contains(&folder.id) {
                continue;
            }
            let queue_id = NoteId::new(folder.id.as_str());
            if self
                .queue
                .has_pending_folder_create(&queue_id)
                .await
                .context(DbSnafu)?
            {
                push_creates = true;
                continue;
            }
            if folder.id.is_temporary() {
                continue;
            }
            debug!(target: LOG_TARGET, folder_id = %folder.id, "Cloud forgot folder; deleting locally");
            self.bus.publish_folder(FolderEvent::Deleted {
                folder_id: folder.id.clone(),
                origin: DeleteOrigin::Cloud,
            });
        }

        if push_creates {
            if let Some(processor) = self.processor.get().cloned() {
                debug!(target: LOG_TARGET, "Pushing pending creates found during reconciliation");
                processor.process_queue().await.context(DbSnafu)?;
            }
        }

        Ok(())
    }

    /// Stage the fresh cursor; it commits durably only once no pending
    /// uploads remain.
    async fn stage_cursor(&self, sync_tag: Option<String>) -> SyncResult<()> {
        let Some(tag) = sync_tag else {
            return Ok(());
        };

        let has_pending = self.queue.has_any_pending_upload().await.context(DbSnafu)?;
        let committed = self
            .state
            .stage_sync_tag(tag.clone(), has_pending)
            .await
            .context(DbSnafu)?;
        if committed {
            self.bus.publish_sync(SyncEvent::TagUpdated { tag });
        }
        Ok(())
    }
}
