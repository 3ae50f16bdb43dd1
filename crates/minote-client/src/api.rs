//! Cloud API bindings: paths, form bodies, and tolerant response
//! extraction.
//!
//! The service speaks a browser-era envelope: every response is JSON
//! with a `code` field (`0` means success) and a `data` payload whose
//! exact shape varies per endpoint *and* per endpoint generation. The
//! extractors here probe every shape observed in the wild rather than
//! assuming one.

use minote_core::{AttachmentRef, Folder, FolderId, Note, NoteId, Timestamp};
use serde_json::Value;
use snafu::{Location, OptionExt as _, Snafu};

use crate::auth::AuthError;
use crate::transport::TransportError;

pub const ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

/// The error taxonomy every outbound call funnels into.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ApiError {
    /// Timeout, connection reset, DNS failure. Retryable.
    #[snafu(display("Transport failure"))]
    Transport {
        source: TransportError,
        #[snafu(implicit)]
        location: Location,
    },
    /// 401/403 whose refresh-and-retry already failed.
    #[snafu(display("Not authenticated"))]
    Auth {
        source: AuthError,
        #[snafu(implicit)]
        location: Location,
    },
    /// Second identical request within the dedup window.
    #[snafu(display("Duplicate request"))]
    Duplicate {
        #[snafu(implicit)]
        location: Location,
    },
    /// 5xx or 429. Retryable.
    #[snafu(display("Server error status {status}"))]
    Server {
        status: u16,
        #[snafu(implicit)]
        location: Location,
    },
    /// Any other 4xx. Not retryable.
    #[snafu(display("Request rejected with status {status}"))]
    Client {
        status: u16,
        #[snafu(implicit)]
        location: Location,
    },
    /// `code != 0` in the response body. Not retryable.
    #[snafu(display("Server rejected request (code {code}): {message}"))]
    Business {
        code: i64,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Malformed response: {message}"))]
    Decode {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport { .. } | ApiError::Server { .. })
    }
}

/// Parse the response envelope; `code == 0` yields the whole JSON value,
/// anything else is a business failure carrying the server's description.
pub fn decode_envelope(body: &[u8]) -> ApiResult<Value> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        DecodeSnafu {
            message: err.to_string(),
        }
        .build()
    })?;

    let code = value["code"].as_i64().context(DecodeSnafu {
        message: "missing `code` field".to_owned(),
    })?;

    if code != 0 {
        let message = value["description"]
            .as_str()
            .or_else(|| value["message"].as_str())
            .unwrap_or_default()
            .to_owned();
        return BusinessSnafu { code, message }.fail();
    }

    Ok(value)
}

// ============================================================================
// Paths & bodies
// ============================================================================

pub fn ts_now() -> u64 {
    Timestamp::now().as_millis()
}

pub fn page_path(ts: u64, limit: usize, sync_tag: Option<&str>) -> String {
    // The server is known to ignore the request-side syncTag; it is
    // attached for wire fidelity but pagination always trusts the
    // response's value.
    match sync_tag {
        Some(tag) => format!(
            "/note/full/page?ts={ts}&limit={limit}&syncTag={}",
            urlencoding::encode(tag)
        ),
        None => format!("/note/full/page?ts={ts}&limit={limit}"),
    }
}

pub fn folder_page_path(ts: u64, folder_id: &FolderId, limit: usize, sync_tag: Option<&str>) -> String {
    let base = format!(
        "/note/full/folder?ts={ts}&folderId={}&limit={limit}",
        urlencoding::encode(folder_id.as_str())
    );
    match sync_tag {
        Some(tag) => format!("{base}&syncTag={}", urlencoding::encode(tag)),
        None => base,
    }
}

pub fn note_detail_path(id: &NoteId, ts: u64) -> String {
    format!("/note/note/{}/?ts={ts}", urlencoding::encode(id.as_str()))
}

pub fn note_create_path() -> String {
    "/note/note".to_owned()
}

pub fn note_update_path(id: &NoteId) -> String {
    format!("/note/note/{}", urlencoding::encode(id.as_str()))
}

pub fn note_delete_path(id: &NoteId) -> String {
    format!("/note/full/{}/delete", urlencoding::encode(id.as_str()))
}

pub fn note_restore_path(id: &NoteId) -> String {
    format!("/note/note/{}/restore", urlencoding::encode(id.as_str()))
}

pub fn folder_create_path() -> String {
    "/note/folder".to_owned()
}

pub fn folder_update_path(id: &FolderId) -> String {
    format!("/note/folder/{}", urlencoding::encode(id.as_str()))
}

pub fn folder_delete_path(id: &FolderId) -> String {
    format!("/note/full/{}/delete", urlencoding::encode(id.as_str()))
}

pub fn web_sync_path(ts: u64, data: &Value, inactive_time: u64) -> String {
    format!(
        "/note/sync/full/?ts={ts}&data={}&inactiveTime={inactive_time}",
        urlencoding::encode(&data.to_string())
    )
}

pub fn file_request_upload_path() -> String {
    "/file/v2/user/request_upload_file".to_owned()
}

pub fn file_commit_path() -> String {
    "/file/v2/user/commit".to_owned()
}

pub fn file_download_path(ts: u64, file_type: &str, file_id: &str) -> String {
    format!(
        "/file/full/v2?ts={ts}&type={file_type}&fileid={}",
        urlencoding::encode(file_id)
    )
}

pub fn common_check_path(ts: u64) -> String {
    format!("/common/check?ts={ts}")
}

pub fn profile_path(ts: u64) -> String {
    format!("/status/lite/profile?ts={ts}")
}

/// Standard POST body: `entry=<json>&serviceToken=<token>`.
pub fn entry_form_body(entry: &Value, service_token: &str) -> Vec<u8> {
    format!(
        "entry={}&serviceToken={}",
        urlencoding::encode(&entry.to_string()),
        urlencoding::encode(service_token)
    )
    .into_bytes()
}

/// File-request POST body: `data=<json>&serviceToken=<token>`.
pub fn data_form_body(data: &Value, service_token: &str) -> Vec<u8> {
    format!(
        "data={}&serviceToken={}",
        urlencoding::encode(&data.to_string()),
        urlencoding::encode(service_token)
    )
    .into_bytes()
}

/// Plain key-value POST body (`tag=…&purge=…`).
pub fn kv_form_body(pairs: &[(&str, &str)]) -> Vec<u8> {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
        .into_bytes()
}

// ============================================================================
// Record extraction
// ============================================================================

/// A note as it appears in list responses; details are fetched per note.
#[derive(Clone, Debug)]
pub struct CloudNoteSummary {
    pub id: NoteId,
    pub folder_id: FolderId,
    pub modify_date: Timestamp,
    pub tag: Option<String>,
    pub status: String,
}

impl CloudNoteSummary {
    pub fn is_deleted(&self) -> bool {
        self.status == Note::STATUS_DELETED
    }
}

/// A folder as it appears in list responses.
#[derive(Clone, Debug)]
pub struct CloudFolder {
    pub folder: Folder,
    pub deleted: bool,
}

/// One logical page of sync results, however it was shaped on the wire.
#[derive(Clone, Debug, Default)]
pub struct SyncPage {
    pub entries: Vec<CloudNoteSummary>,
    pub folders: Vec<CloudFolder>,
    pub sync_tag: Option<String>,
}

/// Containers the record set has been observed under, newest first.
fn record_containers(envelope: &Value) -> [&Value; 3] {
    [
        &envelope["data"],
        &envelope["note_view"]["data"],
        &envelope["data"]["note_view"]["data"],
    ]
}

/// Extract entries/folders/syncTag from any of the observed response
/// shapes: the legacy page envelope (`data.entries` + top-level
/// `syncTag`) and both web-sync variants (`note_view.data.*`, nested or
/// not).
pub fn extract_sync_page(envelope: &Value) -> SyncPage {
    let mut page = SyncPage::default();

    for container in record_containers(envelope) {
        if let Some(entries) = container["entries"].as_array() {
            page.entries = entries.iter().filter_map(parse_note_summary).collect();
        }
        if let Some(folders) = container["folders"].as_array() {
            page.folders = folders.iter().filter_map(parse_folder).collect();
        }
        if !page.entries.is_empty() || !page.folders.is_empty() {
            break;
        }
    }

    page.sync_tag = extract_sync_tag(envelope);
    page
}

/// The cursor has been observed both top-level and nested; trust
/// whichever is present, preferring the top level.
pub fn extract_sync_tag(envelope: &Value) -> Option<String> {
    let candidates = [
        &envelope["syncTag"],
        &envelope["data"]["syncTag"],
        &envelope["note_view"]["data"]["syncTag"],
        &envelope["data"]["note_view"]["data"]["syncTag"],
    ];

    candidates.iter().find_map(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_note_summary(value: &Value) -> Option<CloudNoteSummary> {
    let id = value["id"].as_str()?;
    Some(CloudNoteSummary {
        id: NoteId::new(id),
        folder_id: FolderId::new(value["folderId"].as_str().unwrap_or(FolderId::ALL)),
        modify_date: Timestamp::from(value["modifyDate"].as_u64().unwrap_or_default()),
        tag: value["tag"].as_str().map(str::to_owned),
        status: value["status"]
            .as_str()
            .unwrap_or(Note::STATUS_NORMAL)
            .to_owned(),
    })
}

pub fn parse_folder(value: &Value) -> Option<CloudFolder> {
    let id = value["id"].as_str()?;
    let folder_id = FolderId::new(id);
    let is_system = folder_id.is_system();
    Some(CloudFolder {
        deleted: value["status"].as_str() == Some(Note::STATUS_DELETED),
        folder: Folder {
            id: folder_id,
            name: value["subject"].as_str().unwrap_or_default().to_owned(),
            count: value["count"].as_u64().unwrap_or_default(),
            is_system,
            is_pinned: value["pinned"].as_bool().unwrap_or_default(),
            created_at: Timestamp::from(value["createDate"].as_u64().unwrap_or_default()),
            tag: value["tag"].as_str().map(str::to_owned),
        },
    })
}

/// Parse a full note out of a detail response (`data.entry`).
pub fn parse_note_detail(envelope: &Value) -> ApiResult<Note> {
    let entry = &envelope["data"]["entry"];
    let id = entry["id"].as_str().context(DecodeSnafu {
        message: "note detail missing `data.entry.id`".to_owned(),
    })?;

    let created_at = Timestamp::from(entry["createDate"].as_u64().unwrap_or_default());
    let updated_at = Timestamp::from(
        entry["modifyDate"]
            .as_u64()
            .unwrap_or(created_at.as_millis()),
    );

    let attachments: Vec<AttachmentRef> = entry["setting"]["data"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(Note {
        id: NoteId::new(id),
        title: entry["subject"].as_str().unwrap_or_default().to_owned(),
        content: entry["content"].as_str().unwrap_or_default().to_owned(),
        folder_id: FolderId::new(entry["folderId"].as_str().unwrap_or(FolderId::ALL)),
        is_starred: entry["starred"].as_bool().unwrap_or_default(),
        color_id: entry["colorId"].as_i64().unwrap_or_default(),
        status: entry["status"]
            .as_str()
            .unwrap_or(Note::STATUS_NORMAL)
            .to_owned(),
        tags: entry["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default(),
        created_at,
        updated_at: updated_at.max(created_at),
        server_tag: entry["tag"].as_str().map(str::to_owned),
        attachments,
    })
}

/// Serialize a note for create/update requests.
pub fn note_entry_json(note: &Note) -> Value {
    let mut entry = serde_json::json!({
        "id": note.id.as_str(),
        "subject": note.title,
        "content": note.content,
        "folderId": note.folder_id.as_str(),
        "starred": note.is_starred,
        "colorId": note.color_id,
        "status": note.status,
        "tags": note.tags,
        "createDate": note.created_at.as_millis(),
        "modifyDate": note.updated_at.as_millis(),
        "setting": { "data": note.attachments },
    });
    if let Some(tag) = &note.server_tag {
        entry["tag"] = Value::String(tag.clone());
    }
    entry
}

/// The id (and optional version tag) a create/update response carries.
pub fn parse_entry_ack(envelope: &Value) -> ApiResult<(String, Option<String>)> {
    let entry = &envelope["data"]["entry"];
    let id = entry["id"]
        .as_str()
        .map(str::to_owned)
        .or_else(|| entry["id"].as_u64().map(|n| n.to_string()))
        .context(DecodeSnafu {
            message: "ack missing `data.entry.id`".to_owned(),
        })?;
    Ok((id, entry["tag"].as_str().map(str::to_owned)))
}

// ============================================================================
// Files
// ============================================================================

/// Answer to `request_upload_file`: either the blob already exists
/// server-side (dedup by hash) or we are granted an upload session.
#[derive(Clone, Debug)]
pub enum UploadGrant {
    CacheHit {
        file_id: String,
    },
    CacheMiss {
        upload_id: String,
        node_url: String,
    },
}

pub fn parse_upload_grant(envelope: &Value) -> ApiResult<UploadGrant> {
    let data = &envelope["data"];
    if let Some(file_id) = data["fileId"].as_str() {
        return Ok(UploadGrant::CacheHit {
            file_id: file_id.to_owned(),
        });
    }

    let storage = &data["storage"];
    let upload_id = storage["uploadId"].as_str().context(DecodeSnafu {
        message: "upload grant missing `fileId` and `storage.uploadId`".to_owned(),
    })?;
    let node_url = storage["kss"]["node_urls"][0]
        .as_str()
        .or_else(|| storage["kss"]["nodeUrl"].as_str())
        .context(DecodeSnafu {
            message: "upload grant missing kss node url".to_owned(),
        })?;

    Ok(UploadGrant::CacheMiss {
        upload_id: upload_id.to_owned(),
        node_url: node_url.to_owned(),
    })
}

pub fn parse_commit_ack(envelope: &Value) -> ApiResult<String> {
    envelope["data"]["fileId"]
        .as_str()
        .map(str::to_owned)
        .context(DecodeSnafu {
            message: "commit ack missing `data.fileId`".to_owned(),
        })
}

/// Where to fetch an attachment's bytes from.
#[derive(Clone, Debug)]
pub enum DownloadSource {
    Direct {
        url: String,
    },
    /// KSS block storage: fetch each block url in order, concatenate.
    Kss {
        urls: Vec<String>,
        secure_key: Option<String>,
    },
}

pub fn parse_download_source(envelope: &Value) -> ApiResult<DownloadSource> {
    let data = &envelope["data"];

    if let Some(url) = data["url"].as_str() {
        return Ok(DownloadSource::Direct {
            url: url.to_owned(),
        });
    }

    let urls: Vec<String> = data["kss"]["block_urls"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|u| u.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    if urls.is_empty() {
        return DecodeSnafu {
            message: "download source missing both `url` and `kss.block_urls`".to_owned(),
        }
        .fail();
    }

    Ok(DownloadSource::Kss {
        urls,
        secure_key: data["kss"]["secure_key"].as_str().map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_and_failure() {
        let ok = decode_envelope(br#"{"code":0,"data":{"x":1}}"#).expect("code 0 is success");
        assert_eq!(ok["data"]["x"], 1);

        let err = decode_envelope(br#"{"code":10,"description":"bad tag"}"#).unwrap_err();
        match err {
            ApiError::Business { code, message, .. } => {
                assert_eq!(code, 10);
                assert_eq!(message, "bad tag");
            }
            other => panic!("Expected business error, got {other:?}"),
        }

        assert!(matches!(
            decode_envelope(b"not json").unwrap_err(),
            ApiError::Decode { .. }
        ));
    }

    #[test]
    fn sync_page_from_legacy_shape() {
        let envelope = serde_json::json!({
            "code": 0,
            "data": {
                "entries": [
                    {"id": "n1", "folderId": "0", "modifyDate": 5, "tag": "t1", "status": "normal"},
                    {"id": "n2", "status": "deleted"},
                ],
                "folders": [
                    {"id": "f1", "subject": "Work", "createDate": 3, "tag": "ft"},
                ],
            },
            "syncTag": "T2",
        });

        let page = extract_sync_page(&envelope);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].id.as_str(), "n1");
        assert!(!page.entries[0].is_deleted());
        assert!(page.entries[1].is_deleted());
        assert_eq!(page.folders.len(), 1);
        assert_eq!(page.folders[0].folder.name, "Work");
        assert_eq!(page.sync_tag.as_deref(), Some("T2"));
    }

    #[test]
    fn sync_page_from_web_shape_both_tag_variants() {
        let nested = serde_json::json!({
            "code": 0,
            "note_view": {
                "data": {
                    "entries": [{"id": "n1", "modifyDate": 9}],
                    "folders": [],
                    "syncTag": "T9",
                }
            }
        });
        let page = extract_sync_page(&nested);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.sync_tag.as_deref(), Some("T9"));

        let top_level = serde_json::json!({
            "code": 0,
            "syncTag": "T10",
            "note_view": {
                "data": { "entries": [{"id": "n1"}], "folders": [] }
            }
        });
        let page = extract_sync_page(&top_level);
        assert_eq!(page.sync_tag.as_deref(), Some("T10"));
    }

    #[test]
    fn note_detail_roundtrip() {
        let note = Note::new_offline("Title", "<text>body</text>", FolderId::new("f1"));
        let entry = note_entry_json(&note);
        let envelope = serde_json::json!({"code": 0, "data": {"entry": entry}});

        let parsed = parse_note_detail(&envelope).expect("Parses");
        assert_eq!(parsed.id, note.id);
        assert_eq!(parsed.title, note.title);
        assert_eq!(parsed.content, note.content);
        assert_eq!(parsed.folder_id, note.folder_id);
        assert_eq!(parsed.created_at, note.created_at);
        assert_eq!(parsed.updated_at, note.updated_at);
        assert_eq!(parsed.server_tag, None);
    }

    #[test]
    fn updated_at_never_precedes_created_at() {
        let envelope = serde_json::json!({
            "code": 0,
            "data": {"entry": {"id": "n1", "createDate": 100, "modifyDate": 50}}
        });
        let parsed = parse_note_detail(&envelope).expect("Parses");
        assert_eq!(parsed.updated_at, parsed.created_at);
    }

    #[test]
    fn upload_grant_shapes() {
        let hit = serde_json::json!({"code": 0, "data": {"fileId": "F1"}});
        assert!(matches!(
            parse_upload_grant(&hit).expect("Parses"),
            UploadGrant::CacheHit { file_id } if file_id == "F1"
        ));

        let miss = serde_json::json!({
            "code": 0,
            "data": {"storage": {"uploadId": "U1", "kss": {"node_urls": ["https://kss/1"]}}}
        });
        assert!(matches!(
            parse_upload_grant(&miss).expect("Parses"),
            UploadGrant::CacheMiss { upload_id, node_url }
                if upload_id == "U1" && node_url == "https://kss/1"
        ));
    }

    #[test]
    fn download_source_shapes() {
        let direct = serde_json::json!({"code": 0, "data": {"url": "https://cdn/x.png"}});
        assert!(matches!(
            parse_download_source(&direct).expect("Parses"),
            DownloadSource::Direct { url } if url == "https://cdn/x.png"
        ));

        let kss = serde_json::json!({
            "code": 0,
            "data": {"kss": {"block_urls": ["https://kss/a", "https://kss/b"], "secure_key": "k"}}
        });
        match parse_download_source(&kss).expect("Parses") {
            DownloadSource::Kss { urls, secure_key } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(secure_key.as_deref(), Some("k"));
            }
            other => panic!("Expected kss source, got {other:?}"),
        }
    }

    #[test]
    fn form_bodies_are_urlencoded() {
        let entry = serde_json::json!({"id": "a&b"});
        let body = String::from_utf8(entry_form_body(&entry, "tok=1")).expect("Utf8");
        assert!(body.starts_with("entry=%7B"));
        assert!(body.ends_with("&serviceToken=tok%3D1"));

        let kv = String::from_utf8(kv_form_body(&[("tag", "t 1"), ("purge", "false")])).expect("Utf8");
        assert_eq!(kv, "tag=t%201&purge=false");
    }
}
