use minote_core::{Folder, FolderId};

use crate::{Database, DbResult, FolderSortRecord, folder_sort_info, folders};

impl Database {
    pub fn get_folder_tx(
        id: &FolderId,
        folders_table: &impl folders::ReadableTable,
    ) -> DbResult<Option<Folder>> {
        Ok(folders_table.get(id)?.map(|g| g.value()))
    }

    pub fn upsert_folder_tx(folder: &Folder, folders_table: &mut folders::Table) -> DbResult<()> {
        folders_table.insert(&folder.id, folder)?;
        Ok(())
    }

    pub fn delete_folder_tx(id: &FolderId, folders_table: &mut folders::Table) -> DbResult<bool> {
        Ok(folders_table.remove(id)?.is_some())
    }

    pub fn list_folders_tx(folders_table: &impl folders::ReadableTable) -> DbResult<Vec<Folder>> {
        Ok(folders_table
            .range::<FolderId>(..)?
            .map(|res| res.map(|(_k, v)| v.value()))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace a folder row's primary key; same new-row-plus-delete
    /// discipline as notes.
    pub fn rename_folder_id_tx(
        old_id: &FolderId,
        new_id: &FolderId,
        folders_table: &mut folders::Table,
    ) -> DbResult<bool> {
        let Some(mut folder) = folders_table.remove(old_id)?.map(|g| g.value()) else {
            return Ok(false);
        };

        folder.id = new_id.clone();
        folders_table.insert(new_id, &folder)?;
        Ok(true)
    }

    pub fn get_folder_sort_tx(
        sort_table: &impl folder_sort_info::ReadableTable,
    ) -> DbResult<FolderSortRecord> {
        Ok(sort_table.get(&())?.map(|g| g.value()).unwrap_or_default())
    }

    pub fn set_folder_sort_tx(
        record: &FolderSortRecord,
        sort_table: &mut folder_sort_info::Table,
    ) -> DbResult<()> {
        sort_table.insert(&(), record)?;
        Ok(())
    }
}

impl Database {
    pub async fn get_folder(&self, id: &FolderId) -> DbResult<Option<Folder>> {
        self.read_with(|tx| {
            let folders_table = tx.open_table(&folders::TABLE)?;
            Self::get_folder_tx(id, &folders_table)
        })
        .await
    }

    pub async fn list_folders(&self) -> DbResult<Vec<Folder>> {
        self.read_with(|tx| {
            let folders_table = tx.open_table(&folders::TABLE)?;
            Self::list_folders_tx(&folders_table)
        })
        .await
    }

    pub async fn upsert_folder(&self, folder: &Folder) -> DbResult<()> {
        self.write_with(|tx| {
            let mut folders_table = tx.open_table(&folders::TABLE)?;
            Self::upsert_folder_tx(folder, &mut folders_table)
        })
        .await
    }

    pub async fn delete_folder(&self, id: &FolderId) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut folders_table = tx.open_table(&folders::TABLE)?;
            Self::delete_folder_tx(id, &mut folders_table)
        })
        .await
    }

    pub async fn get_folder_sort(&self) -> DbResult<FolderSortRecord> {
        self.read_with(|tx| {
            let sort_table = tx.open_table(&folder_sort_info::TABLE)?;
            Self::get_folder_sort_tx(&sort_table)
        })
        .await
    }

    pub async fn set_folder_sort(&self, record: &FolderSortRecord) -> DbResult<()> {
        self.write_with(|tx| {
            let mut sort_table = tx.open_table(&folder_sort_info::TABLE)?;
            Self::set_folder_sort_tx(record, &mut sort_table)
        })
        .await
    }
}
