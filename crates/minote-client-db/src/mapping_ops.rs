use minote_core::{EntityKind, Timestamp};

use crate::{Database, DbResult, IdMappingRecord, id_mappings};

impl Database {
    pub fn get_mapping_tx(
        local_id: &str,
        mappings_table: &impl id_mappings::ReadableTable,
    ) -> DbResult<Option<IdMappingRecord>> {
        Ok(mappings_table
            .get(&local_id.to_owned())?
            .map(|g| g.value()))
    }

    /// Insert or refresh a mapping; idempotent for the same pair.
    ///
    /// A re-registration of the same `(local, server)` pair keeps the
    /// existing record (including its completion state).
    pub fn register_mapping_tx(
        local_id: &str,
        server_id: &str,
        entity: EntityKind,
        mappings_table: &mut id_mappings::Table,
    ) -> DbResult<bool> {
        if let Some(existing) = mappings_table.get(&local_id.to_owned())?.map(|g| g.value()) {
            if existing.server_id == server_id {
                return Ok(false);
            }
        }

        mappings_table.insert(
            &local_id.to_owned(),
            &IdMappingRecord {
                server_id: server_id.to_owned(),
                entity,
                created_at: Timestamp::now(),
                completed: false,
            },
        )?;
        Ok(true)
    }

    pub fn mark_mapping_completed_tx(
        local_id: &str,
        mappings_table: &mut id_mappings::Table,
    ) -> DbResult<bool> {
        let Some(mut record) = mappings_table.get(&local_id.to_owned())?.map(|g| g.value()) else {
            return Ok(false);
        };
        record.completed = true;
        mappings_table.insert(&local_id.to_owned(), &record)?;
        Ok(true)
    }

    /// All mappings whose reference rewrite may not have finished.
    pub fn incomplete_mappings_tx(
        mappings_table: &impl id_mappings::ReadableTable,
    ) -> DbResult<Vec<(String, IdMappingRecord)>> {
        Ok(mappings_table
            .range::<String>(..)?
            .map(|res| res.map(|(k, v)| (k.value(), v.value())))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(_k, record)| !record.completed)
            .collect())
    }

    /// Drop completed mappings; they are pure garbage once every
    /// reference is rewritten.
    pub fn gc_completed_mappings_tx(mappings_table: &mut id_mappings::Table) -> DbResult<usize> {
        let doomed: Vec<String> = mappings_table
            .range::<String>(..)?
            .map(|res| res.map(|(k, v)| (k.value(), v.value())))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|(_k, record)| record.completed)
            .map(|(k, _record)| k)
            .collect();

        for key in &doomed {
            mappings_table.remove(key)?;
        }
        Ok(doomed.len())
    }
}

impl Database {
    pub async fn get_mapping(&self, local_id: &str) -> DbResult<Option<IdMappingRecord>> {
        self.read_with(|tx| {
            let mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Self::get_mapping_tx(local_id, &mappings_table)
        })
        .await
    }

    pub async fn register_mapping(
        &self,
        local_id: &str,
        server_id: &str,
        entity: EntityKind,
    ) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Self::register_mapping_tx(local_id, server_id, entity, &mut mappings_table)
        })
        .await
    }

    pub async fn mark_mapping_completed(&self, local_id: &str) -> DbResult<bool> {
        self.write_with(|tx| {
            let mut mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Self::mark_mapping_completed_tx(local_id, &mut mappings_table)
        })
        .await
    }

    pub async fn incomplete_mappings(&self) -> DbResult<Vec<(String, IdMappingRecord)>> {
        self.read_with(|tx| {
            let mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Self::incomplete_mappings_tx(&mappings_table)
        })
        .await
    }

    pub async fn all_mappings(&self) -> DbResult<Vec<(String, IdMappingRecord)>> {
        self.read_with(|tx| {
            let mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Ok(mappings_table
                .range::<String>(..)?
                .map(|res| res.map(|(k, v)| (k.value(), v.value())))
                .collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn gc_completed_mappings(&self) -> DbResult<usize> {
        self.write_with(|tx| {
            let mut mappings_table = tx.open_table(&id_mappings::TABLE)?;
            Self::gc_completed_mappings_tx(&mut mappings_table)
        })
        .await
    }
}
