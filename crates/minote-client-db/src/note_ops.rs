use minote_core::{Folder, FolderId, Note, NoteId};

use crate::{Database, DbResult, notes};

impl Database {
    pub fn get_note_tx(
        id: &NoteId,
        notes_table: &impl notes::ReadableTable,
    ) -> DbResult<Option<Note>> {
        Ok(notes_table.get(id)?.map(|g| g.value()))
    }

    pub fn upsert_note_tx(note: &Note, notes_table: &mut notes::Table) -> DbResult<()> {
        notes_table.insert(&note.id, note)?;
        Ok(())
    }

    pub fn delete_note_tx(id: &NoteId, notes_table: &mut notes::Table) -> DbResult<bool> {
        Ok(notes_table.remove(id)?.is_some())
    }

    pub fn list_notes_tx(notes_table: &impl notes::ReadableTable) -> DbResult<Vec<Note>> {
        Ok(notes_table
            .range::<NoteId>(..)?
            .map(|res| res.map(|(_k, v)| v.value()))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace a note row's primary key.
    ///
    /// The id is never mutated in place: the old row is removed and a
    /// copy with the new id inserted, inside the caller's transaction.
    /// Idempotent: if the old row is already gone, nothing happens.
    pub fn rename_note_id_tx(
        old_id: &NoteId,
        new_id: &NoteId,
        notes_table: &mut notes::Table,
    ) -> DbResult<bool> {
        let Some(note) = notes_table.remove(old_id)?.map(|g| g.value()) else {
            return Ok(false);
        };

        let note = note.with_id(new_id.clone());
        notes_table.insert(new_id, &note)?;
        Ok(true)
    }

    /// Move every note in `old_folder` to `new_folder`; returns how many
    /// rows were rewritten.
    pub fn update_notes_folder_id_tx(
        old_folder: &FolderId,
        new_folder: &FolderId,
        notes_table: &mut notes::Table,
    ) -> DbResult<usize> {
        let affected: Vec<Note> = notes_table
            .range::<NoteId>(..)?
            .map(|res| res.map(|(_k, v)| v.value()))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|note| &note.folder_id == old_folder)
            .collect();

        for mut note in affected.iter().cloned() {
            note.folder_id = new_folder.clone();
            notes_table.insert(&note.id, &note)?;
        }

        Ok(affected.len())
    }
}

impl Database {
    pub async fn get_note(&self, id: &NoteId) -> DbResult<Option<Note>> {
        let id = id.clone();
        self.read_with(|tx| {
            let notes_table = tx.open_table(&notes::TABLE)?;
            Self::get_note_tx(&id, &notes_table)
        })
        .await
    }

    pub async fn list_notes(&self) -> DbResult<Vec<Note>> {
        self.read_with(|tx| {
            let notes_table = tx.open_table(&notes::TABLE)?;
            Self::list_notes_tx(&notes_table)
        })
        .await
    }

    pub async fn upsert_note(&self, note: &Note) -> DbResult<()> {
        self.write_with(|tx| {
            let mut notes_table = tx.open_table(&notes::TABLE)?;
            Self::upsert_note_tx(note, &mut notes_table)
        })
        .await
    }

    pub async fn delete_note(&self, id: &NoteId) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut notes_table = tx.open_table(&notes::TABLE)?;
            Self::delete_note_tx(id, &mut notes_table)
        })
        .await
    }

    /// Load both caches in one read snapshot.
    pub async fn load_all(&self) -> DbResult<(Vec<Note>, Vec<Folder>)> {
        self.read_with(|tx| {
            let notes_table = tx.open_table(&notes::TABLE)?;
            let folders_table = tx.open_table(&crate::folders::TABLE)?;
            Ok((
                Self::list_notes_tx(&notes_table)?,
                Self::list_folders_tx(&folders_table)?,
            ))
        })
        .await
    }
}
