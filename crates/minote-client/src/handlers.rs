//! Typed handlers for each operation kind.
//!
//! Handlers translate queue rows into cloud calls and fold the server's
//! acknowledgements back into local state. The create handlers own the
//! id cutover: a create is not "done" until every local reference to the
//! temporary id has been rewritten.

use std::sync::Arc;

use async_trait::async_trait;
use minote_core::{EntityKind, FileId, Folder, FolderId, Note, NoteId, NoteOperation, OperationKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{self, ApiResult, DecodeSnafu, UploadGrant};
use crate::blob::BlobStore;
use crate::id_map::IdMappingRegistry;
use crate::net::PRIORITY_NORMAL;
use crate::processor::{HandlerMap, OperationHandler};
use crate::session::SessionClient;
use crate::store::NoteStore;

const LOG_TARGET: &str = "minote::handlers";

/// Block size for the chunked upload phase.
const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeletePayload {
    pub tag: String,
    pub purge: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderRenamePayload {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FolderDeletePayload {
    pub tag: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileUploadPayload {
    pub file_id: FileId,
    pub mime_type: String,
}

fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> ApiResult<T> {
    serde_json::from_slice(data).map_err(|err| {
        DecodeSnafu {
            message: format!("operation payload: {err}"),
        }
        .build()
    })
}

/// Everything the handlers share.
pub struct HandlerContext {
    pub session: Arc<SessionClient>,
    pub registry: Arc<IdMappingRegistry>,
    pub store: Arc<NoteStore>,
    pub blob: Arc<BlobStore>,
}

pub fn handler_map(ctx: Arc<HandlerContext>) -> HandlerMap {
    let mut map = HandlerMap::new();
    map.insert(
        OperationKind::NoteCreate,
        Arc::new(NoteCreateHandler { ctx: ctx.clone() }) as Arc<dyn OperationHandler>,
    );
    map.insert(
        OperationKind::CloudUpload,
        Arc::new(CloudUploadHandler { ctx: ctx.clone() }),
    );
    map.insert(
        OperationKind::CloudDelete,
        Arc::new(CloudDeleteHandler { ctx: ctx.clone() }),
    );
    map.insert(
        OperationKind::ImageUpload,
        Arc::new(FileUploadHandler {
            ctx: ctx.clone(),
            file_type: "note_img",
        }),
    );
    map.insert(
        OperationKind::AudioUpload,
        Arc::new(FileUploadHandler {
            ctx: ctx.clone(),
            file_type: "note_audio",
        }),
    );
    map.insert(
        OperationKind::FolderCreate,
        Arc::new(FolderCreateHandler { ctx: ctx.clone() }),
    );
    map.insert(
        OperationKind::FolderRename,
        Arc::new(FolderRenameHandler { ctx: ctx.clone() }),
    );
    map.insert(OperationKind::FolderDelete, Arc::new(FolderDeleteHandler { ctx }));
    map
}

// ============================================================================
// Notes
// ============================================================================

struct NoteCreateHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for NoteCreateHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: Note = decode_payload(&op.data)?;
        let local_id = payload.id.clone();

        // A previous run may have created the note server-side and
        // crashed before finishing the cutover; the mapping tells us.
        if local_id.is_temporary() && self.ctx.registry.has_mapping(local_id.as_str()) {
            let server_id = self.ctx.registry.resolve_id(local_id.as_str());
            info!(
                target: LOG_TARGET,
                local_id = %local_id,
                server_id,
                "Create already acknowledged; finishing cutover"
            );
            self.ctx
                .registry
                .update_all_references(local_id.as_str(), &server_id)
                .await
                .map_err(into_api_error)?;
            self.ctx
                .registry
                .mark_completed(local_id.as_str())
                .await
                .map_err(into_api_error)?;
            return Ok(());
        }

        // Send the freshest content we have, not the snapshot from
        // enqueue time.
        let note = self.ctx.store.note(&local_id).unwrap_or(payload);
        let mut entry = api::note_entry_json(&note);
        if let Some(entry) = entry.as_object_mut() {
            entry.remove("id");
        }

        let token = current_token(&self.ctx.session);
        let envelope = self
            .ctx
            .session
            .post_form(
                &api::note_create_path(),
                api::entry_form_body(&entry, &token),
                PRIORITY_NORMAL,
            )
            .await?;
        let (server_id, tag) = api::parse_entry_ack(&envelope)?;

        info!(
            target: LOG_TARGET,
            local_id = %local_id,
            server_id = %server_id,
            "Note created server-side"
        );

        self.ctx
            .registry
            .register_mapping(local_id.as_str(), &server_id, EntityKind::Note)
            .await
            .map_err(into_api_error)?;
        self.ctx
            .registry
            .update_all_references(local_id.as_str(), &server_id)
            .await
            .map_err(into_api_error)?;
        self.ctx
            .registry
            .mark_completed(local_id.as_str())
            .await
            .map_err(into_api_error)?;

        if let Some(tag) = tag {
            self.ctx
                .store
                .set_note_server_tag(&NoteId::new(server_id), tag)
                .await
                .map_err(into_api_error)?;
        }
        Ok(())
    }
}

struct CloudUploadHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for CloudUploadHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        // Prefer the live row: it carries the server tag minted by the
        // create that necessarily completed before us.
        let note = match self.ctx.store.note(&op.note_id) {
            Some(note) => note,
            None => {
                let mut payload: Note = decode_payload(&op.data)?;
                payload.id = op.note_id.clone();
                payload
            }
        };

        let entry = api::note_entry_json(&note);
        let token = current_token(&self.ctx.session);
        let envelope = self
            .ctx
            .session
            .post_form(
                &api::note_update_path(&op.note_id),
                api::entry_form_body(&entry, &token),
                PRIORITY_NORMAL,
            )
            .await?;
        let (_id, tag) = api::parse_entry_ack(&envelope)?;

        debug!(target: LOG_TARGET, note_id = %op.note_id, "Note uploaded");
        if let Some(tag) = tag {
            self.ctx
                .store
                .set_note_server_tag(&op.note_id, tag)
                .await
                .map_err(into_api_error)?;
        }
        Ok(())
    }
}

struct CloudDeleteHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for CloudDeleteHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: DeletePayload = decode_payload(&op.data)?;

        self.ctx
            .session
            .post_form(
                &api::note_delete_path(&op.note_id),
                api::kv_form_body(&[
                    ("tag", payload.tag.as_str()),
                    ("purge", if payload.purge { "true" } else { "false" }),
                ]),
                PRIORITY_NORMAL,
            )
            .await?;

        debug!(target: LOG_TARGET, note_id = %op.note_id, "Note deleted server-side");
        Ok(())
    }
}

// ============================================================================
// Files
// ============================================================================

struct FileUploadHandler {
    ctx: Arc<HandlerContext>,
    file_type: &'static str,
}

#[async_trait]
impl OperationHandler for FileUploadHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: FileUploadPayload = decode_payload(&op.data)?;

        let Some((_ext, bytes)) = self
            .ctx
            .blob
            .read_pending(&payload.file_id)
            .await
            .ok()
            .flatten()
        else {
            // The staged bytes are gone (user deleted the note, cache
            // cleared); nothing to push.
            warn!(
                target: LOG_TARGET,
                file_id = %payload.file_id,
                "No staged bytes for file upload; dropping operation"
            );
            return Ok(());
        };

        let token = current_token(&self.ctx.session);
        let request = serde_json::json!({
            "type": self.file_type,
            "mimeType": payload.mime_type,
            "size": bytes.len(),
        });
        let envelope = self
            .ctx
            .session
            .post_form(
                &api::file_request_upload_path(),
                api::data_form_body(&request, &token),
                PRIORITY_NORMAL,
            )
            .await?;

        let server_file_id = match api::parse_upload_grant(&envelope)? {
            UploadGrant::CacheHit { file_id } => {
                debug!(target: LOG_TARGET, file_id = %file_id, "Upload cache hit");
                file_id
            }
            UploadGrant::CacheMiss {
                upload_id,
                node_url,
            } => {
                for (pos, chunk) in bytes.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
                    let chunk_url = format!(
                        "{node_url}/upload_block_chunk?chunk_pos={pos}&file_meta={}&block_meta={pos}",
                        urlencoding::encode(&upload_id)
                    );
                    self.ctx
                        .session
                        .post_bytes_absolute(&chunk_url, chunk.to_vec(), PRIORITY_NORMAL)
                        .await?;
                }

                let commit = serde_json::json!({
                    "uploadId": upload_id,
                    "type": self.file_type,
                });
                let envelope = self
                    .ctx
                    .session
                    .post_form(
                        &api::file_commit_path(),
                        api::data_form_body(&commit, &token),
                        PRIORITY_NORMAL,
                    )
                    .await?;
                api::parse_commit_ack(&envelope)?
            }
        };

        let server_file = FileId::new(server_file_id);
        info!(
            target: LOG_TARGET,
            local_file = %payload.file_id,
            server_file = %server_file,
            "File uploaded"
        );

        self.ctx
            .registry
            .register_mapping(payload.file_id.as_str(), server_file.as_str(), EntityKind::File)
            .await
            .map_err(into_api_error)?;

        if let Err(err) = self
            .ctx
            .blob
            .promote_pending(&payload.file_id, &server_file)
            .await
        {
            warn!(target: LOG_TARGET, err = %err, "Failed to promote staged upload");
        }

        // The editor save races the upload; this polls until the
        // temporary id shows up in the content, then re-queues the note.
        self.ctx
            .registry
            .remap_file_references(&op.note_id, &payload.file_id, &server_file, &self.ctx.store)
            .await
            .map_err(into_api_error)?;
        self.ctx
            .registry
            .mark_completed(payload.file_id.as_str())
            .await
            .map_err(into_api_error)?;

        Ok(())
    }
}

// ============================================================================
// Folders
// ============================================================================

struct FolderCreateHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for FolderCreateHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: Folder = decode_payload(&op.data)?;
        let local_id = payload.id.clone();

        if local_id.is_temporary() && self.ctx.registry.has_mapping(local_id.as_str()) {
            let server_id = self.ctx.registry.resolve_id(local_id.as_str());
            self.ctx
                .registry
                .update_all_references(local_id.as_str(), &server_id)
                .await
                .map_err(into_api_error)?;
            self.ctx
                .registry
                .mark_completed(local_id.as_str())
                .await
                .map_err(into_api_error)?;
            return Ok(());
        }

        let name = self
            .ctx
            .store
            .folder(&local_id)
            .map(|f| f.name)
            .unwrap_or(payload.name);
        let entry: Value = serde_json::json!({ "subject": name });

        let token = current_token(&self.ctx.session);
        let envelope = self
            .ctx
            .session
            .post_form(
                &api::folder_create_path(),
                api::entry_form_body(&entry, &token),
                PRIORITY_NORMAL,
            )
            .await?;
        let (server_id, tag) = api::parse_entry_ack(&envelope)?;

        info!(
            target: LOG_TARGET,
            local_id = %local_id,
            server_id = %server_id,
            "Folder created server-side"
        );

        self.ctx
            .registry
            .register_mapping(local_id.as_str(), &server_id, EntityKind::Folder)
            .await
            .map_err(into_api_error)?;
        self.ctx
            .registry
            .update_all_references(local_id.as_str(), &server_id)
            .await
            .map_err(into_api_error)?;
        self.ctx
            .registry
            .mark_completed(local_id.as_str())
            .await
            .map_err(into_api_error)?;

        if let Some(tag) = tag {
            self.ctx
                .store
                .set_folder_server_tag(&FolderId::new(server_id), tag)
                .await
                .map_err(into_api_error)?;
        }
        Ok(())
    }
}

struct FolderRenameHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for FolderRenameHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: FolderRenamePayload = decode_payload(&op.data)?;
        let folder_id = FolderId::new(op.note_id.as_str());

        // The rename needs the folder's current version tag; the create
        // that minted it necessarily completed before us.
        let tag = self.ctx.store.folder(&folder_id).and_then(|f| f.tag);
        let mut entry = serde_json::json!({ "subject": payload.name });
        if let Some(tag) = &tag {
            entry["tag"] = Value::String(tag.clone());
        }

        let token = current_token(&self.ctx.session);
        let envelope = self
            .ctx
            .session
            .post_form(
                &api::folder_update_path(&folder_id),
                api::entry_form_body(&entry, &token),
                PRIORITY_NORMAL,
            )
            .await?;
        let (_id, tag) = api::parse_entry_ack(&envelope)?;

        debug!(target: LOG_TARGET, folder_id = %folder_id, "Folder renamed server-side");
        if let Some(tag) = tag {
            self.ctx
                .store
                .set_folder_server_tag(&folder_id, tag)
                .await
                .map_err(into_api_error)?;
        }
        Ok(())
    }
}

struct FolderDeleteHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl OperationHandler for FolderDeleteHandler {
    async fn execute(&self, op: &NoteOperation) -> ApiResult<()> {
        let payload: FolderDeletePayload = decode_payload(&op.data)?;
        let folder_id = FolderId::new(op.note_id.as_str());

        self.ctx
            .session
            .post_form(
                &api::folder_delete_path(&folder_id),
                api::kv_form_body(&[("tag", payload.tag.as_str()), ("purge", "false")]),
                PRIORITY_NORMAL,
            )
            .await?;

        debug!(target: LOG_TARGET, folder_id = %folder_id, "Folder deleted server-side");
        Ok(())
    }
}

/// The form-body token mirrors the cookie; a missing one is fine here
/// because the session layer refreshes before the request goes out.
fn current_token(session: &SessionClient) -> String {
    session.tokens().cached_service_token().unwrap_or_default()
}

fn into_api_error(err: minote_client_db::DbError) -> crate::api::ApiError {
    DecodeSnafu {
        message: format!("local state update failed: {err}"),
    }
    .build()
}
