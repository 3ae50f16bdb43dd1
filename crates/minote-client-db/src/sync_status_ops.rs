use minote_core::Timestamp;

use crate::{Database, DbResult, SyncStatusRecord, sync_status};

impl Database {
    pub fn get_sync_status_tx(
        status_table: &impl sync_status::ReadableTable,
    ) -> DbResult<SyncStatusRecord> {
        Ok(status_table.get(&())?.map(|g| g.value()).unwrap_or_default())
    }

    /// Commit a new sync cursor.
    ///
    /// Callers must have verified that no pending uploads remain; the
    /// cursor never regresses past un-pushed local work.
    pub fn commit_sync_tag_tx(
        tag: &str,
        status_table: &mut sync_status::Table,
    ) -> DbResult<()> {
        status_table.insert(
            &(),
            &SyncStatusRecord {
                last_sync_time: Timestamp::now(),
                sync_tag: Some(tag.to_owned()),
            },
        )?;
        Ok(())
    }

    pub fn clear_sync_tag_tx(status_table: &mut sync_status::Table) -> DbResult<()> {
        status_table.insert(
            &(),
            &SyncStatusRecord {
                last_sync_time: Timestamp::now(),
                sync_tag: None,
            },
        )?;
        Ok(())
    }
}

impl Database {
    pub async fn get_sync_status(&self) -> DbResult<SyncStatusRecord> {
        self.read_with(|tx| {
            let status_table = tx.open_table(&sync_status::TABLE)?;
            Self::get_sync_status_tx(&status_table)
        })
        .await
    }

    pub async fn commit_sync_tag(&self, tag: &str) -> DbResult<()> {
        self.write_with(|tx| {
            let mut status_table = tx.open_table(&sync_status::TABLE)?;
            Self::commit_sync_tag_tx(tag, &mut status_table)
        })
        .await
    }

    pub async fn clear_sync_tag(&self) -> DbResult<()> {
        self.write_with(|tx| {
            let mut status_table = tx.open_table(&sync_status::TABLE)?;
            Self::clear_sync_tag_tx(&mut status_table)
        })
        .await
    }
}
