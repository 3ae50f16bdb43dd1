//! Sync-cursor staging.
//!
//! A cursor received from the server is only *committed* to durable
//! state once no pending uploads remain; otherwise a crash between a
//! partial upload and the cursor advance would silently drop that
//! upload's changes from the next incremental pull. The staged value is
//! memory-only on purpose: losing it merely re-syncs from the previous
//! committed cursor.

use std::sync::{Arc, Mutex};

use minote_client_db::{Database, DbResult};
use tracing::{debug, info};

const LOG_TARGET: &str = "minote::sync";

pub struct SyncStateManager {
    db: Arc<Database>,
    staged: Mutex<Option<String>>,
}

impl SyncStateManager {
    pub fn new(db: Arc<Database>) -> Arc<Self> {
        Arc::new(Self {
            db,
            staged: Mutex::new(None),
        })
    }

    pub async fn committed_sync_tag(&self) -> DbResult<Option<String>> {
        Ok(self.db.get_sync_status().await?.sync_tag)
    }

    pub fn staged_sync_tag(&self) -> Option<String> {
        self.staged.lock().expect("Locking failed").clone()
    }

    /// Accept a new cursor; commit it durably only when nothing is
    /// waiting to upload. Returns whether the commit happened.
    pub async fn stage_sync_tag(&self, tag: String, has_pending_notes: bool) -> DbResult<bool> {
        if has_pending_notes {
            debug!(target: LOG_TARGET, tag, "Staging sync tag until uploads drain");
            *self.staged.lock().expect("Locking failed") = Some(tag);
            return Ok(false);
        }

        self.commit(tag).await?;
        Ok(true)
    }

    /// Commit the staged cursor if the queue has drained since it was
    /// staged.
    pub async fn commit_staged_if_drained(&self, has_pending_notes: bool) -> DbResult<bool> {
        if has_pending_notes {
            return Ok(false);
        }
        let staged = self.staged.lock().expect("Locking failed").take();
        let Some(tag) = staged else {
            return Ok(false);
        };
        self.commit(tag).await?;
        Ok(true)
    }

    /// Drop the committed cursor, forcing the next smart sync to run
    /// full.
    pub async fn clear(&self) -> DbResult<()> {
        *self.staged.lock().expect("Locking failed") = None;
        self.db.clear_sync_tag().await
    }

    async fn commit(&self, tag: String) -> DbResult<()> {
        self.db.commit_sync_tag(&tag).await?;
        *self.staged.lock().expect("Locking failed") = None;
        info!(target: LOG_TARGET, tag, "Committed sync tag");
        Ok(())
    }
}
