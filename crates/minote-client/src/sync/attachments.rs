//! Attachment discovery and download.
//!
//! A note references files four ways: the structured `setting.data`
//! array, legacy inline `☺ <fileId><0/></>` markers, `<img fileid>`
//! tags, and `<sound fileid>` tags. The union of all four, deduplicated
//! by file id, is what must exist locally before the note is handed to
//! the store. File bytes carry no trustworthy content-type, so the
//! extension is chosen by magic-byte sniffing.

use std::sync::Arc;
use std::sync::LazyLock;

use minote_core::{AttachmentRef, FileId, Note};
use minote_util_error::FmtCompact as _;
use regex::Regex;
use tracing::{debug, warn};

use crate::api::{self, ApiResult, DownloadSource};
use crate::blob::BlobStore;
use crate::config::ClientConfig;
use crate::net::PRIORITY_BACKGROUND;
use crate::session::SessionClient;

const LOG_TARGET: &str = "minote::sync";

static IMG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<img[^>]*?\bfileid="([^"]+)""#).expect("Valid regex")
});
static SOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<sound[^>]*?\bfileid="([^"]+)""#).expect("Valid regex")
});
static LEGACY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"☺ ([^<\s]+)<0/></>").expect("Valid regex"));

/// Union of every file id the note references, in first-seen order.
pub fn extract_file_ids(note: &Note) -> Vec<FileId> {
    let mut ids: Vec<FileId> = vec![];
    let mut push = |id: &str| {
        let id = FileId::new(id);
        if !ids.contains(&id) {
            ids.push(id);
        }
    };

    for attachment in &note.attachments {
        push(attachment.file_id.as_str());
    }
    for re in [&*LEGACY_RE, &*IMG_RE, &*SOUND_RE] {
        for capture in re.captures_iter(&note.content) {
            push(&capture[1]);
        }
    }

    ids
}

pub fn sniff_image_ext(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        Some("jpg")
    } else {
        None
    }
}

pub fn sniff_audio_ext(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"#!AMR") {
        Some("amr")
    } else if bytes.starts_with(b"ID3")
        || (bytes.len() >= 2 && bytes[0] == 0xff && (bytes[1] & 0xe0) == 0xe0)
    {
        Some("mp3")
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        Some("m4a")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        Some("wav")
    } else {
        None
    }
}

fn sniff_ext(bytes: &[u8]) -> &'static str {
    sniff_image_ext(bytes)
        .or_else(|| sniff_audio_ext(bytes))
        .unwrap_or("bin")
}

fn mime_for_ext(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "jpg" => "image/jpeg",
        "amr" => "audio/amr",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

pub struct AttachmentResolver {
    session: Arc<SessionClient>,
    blob: Arc<BlobStore>,
    config: ClientConfig,
}

impl AttachmentResolver {
    pub fn new(session: Arc<SessionClient>, blob: Arc<BlobStore>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            session,
            blob,
            config,
        })
    }

    /// Make every referenced attachment available locally, updating the
    /// note's `setting.data` entries for anything freshly downloaded.
    /// Returns how many files were fetched.
    ///
    /// Download failures degrade to a log line; the note itself still
    /// syncs.
    pub async fn resolve_note_attachments(&self, note: &mut Note, force: bool) -> usize {
        let mut downloaded = 0;

        for file_id in extract_file_ids(note) {
            // A temporary file id belongs to an upload that has not
            // committed yet; there is nothing to download.
            if file_id.is_temporary() {
                continue;
            }
            if !force && self.blob.has_attachment(&file_id).await {
                continue;
            }

            match self.download_with_retries(&file_id).await {
                Ok(bytes) => {
                    let ext = sniff_ext(&bytes);
                    if let Err(err) = self.blob.save_attachment(&file_id, ext, &bytes).await {
                        warn!(
                            target: LOG_TARGET,
                            file_id = %file_id,
                            err = %err,
                            "Failed to store attachment"
                        );
                        continue;
                    }

                    if !note.attachments.iter().any(|a| a.file_id == file_id) {
                        note.attachments.push(AttachmentRef {
                            file_id: file_id.clone(),
                            mime_type: mime_for_ext(ext).to_owned(),
                            size: bytes.len() as u64,
                        });
                    }
                    downloaded += 1;
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        file_id = %file_id,
                        err = %err.fmt_compact(),
                        "Attachment download failed"
                    );
                }
            }
        }

        downloaded
    }

    async fn download_with_retries(&self, file_id: &FileId) -> ApiResult<Vec<u8>> {
        let delays = &self.config.attachment_retry_delays;
        let mut last_err = None;

        for (attempt, delay) in std::iter::once(None)
            .chain(delays.iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                tokio::time::sleep(*delay).await;
            }
            match self.download(file_id).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        target: LOG_TARGET,
                        file_id = %file_id,
                        attempt,
                        err = %err.fmt_compact(),
                        "Attachment download attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.expect("At least one attempt ran"))
    }

    async fn download(&self, file_id: &FileId) -> ApiResult<Vec<u8>> {
        let envelope = self
            .session
            .get_json(
                &api::file_download_path(api::ts_now(), "note_img", file_id.as_str()),
                PRIORITY_BACKGROUND,
            )
            .await?;

        match api::parse_download_source(&envelope)? {
            DownloadSource::Direct { url } => {
                self.session
                    .get_bytes_absolute(&url, PRIORITY_BACKGROUND)
                    .await
            }
            DownloadSource::Kss { urls, secure_key } => {
                let mut bytes = vec![];
                for url in urls {
                    let url = match &secure_key {
                        Some(key) => {
                            let sep = if url.contains('?') { '&' } else { '?' };
                            format!("{url}{sep}secure_key={}", urlencoding::encode(key))
                        }
                        None => url,
                    };
                    bytes.extend(
                        self.session
                            .get_bytes_absolute(&url, PRIORITY_BACKGROUND)
                            .await?,
                    );
                }
                Ok(bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use minote_core::FolderId;

    use super::*;

    fn note_with_content(content: &str) -> Note {
        Note::new_offline("t", content, FolderId::all())
    }

    #[test]
    fn extracts_and_dedups_all_marker_forms() {
        let mut note = note_with_content(
            "intro ☺ f-legacy<0/></> mid <img fileid=\"f-img\"/> \
             <sound fileid=\"f-sound\"/> again <img src=\"x\" fileid=\"f-img\"/>",
        );
        note.attachments.push(AttachmentRef {
            file_id: FileId::new("f-setting"),
            mime_type: "image/png".into(),
            size: 1,
        });

        let ids: Vec<String> = extract_file_ids(&note)
            .into_iter()
            .map(|id| id.into_string())
            .collect();
        assert_eq!(ids, vec!["f-setting", "f-legacy", "f-img", "f-sound"]);
    }

    #[test]
    fn image_sniffing() {
        assert_eq!(sniff_image_ext(b"\x89PNG\r\n\x1a\nrest"), Some("png"));
        assert_eq!(sniff_image_ext(b"GIF89a...."), Some("gif"));
        assert_eq!(sniff_image_ext(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_image_ext(b"\xff\xd8\xff\xe0JFIF"), Some("jpg"));
        assert_eq!(sniff_image_ext(b"plain text"), None);
    }

    #[test]
    fn audio_sniffing() {
        assert_eq!(sniff_audio_ext(b"#!AMR\n data"), Some("amr"));
        assert_eq!(sniff_audio_ext(b"ID3\x04\x00rest"), Some("mp3"));
        assert_eq!(sniff_audio_ext(b"\xff\xfb\x90\x00frame"), Some("mp3"));
        assert_eq!(sniff_audio_ext(b"\x00\x00\x00\x20ftypM4A \x00\x00"), Some("m4a"));
        assert_eq!(sniff_audio_ext(b"RIFF\x24\x00\x00\x00WAVEfmt "), Some("wav"));
        assert_eq!(sniff_audio_ext(b"plain"), None);
    }

    #[test]
    fn sniff_falls_back_to_bin() {
        assert_eq!(sniff_ext(b"who knows"), "bin");
        assert_eq!(mime_for_ext("bin"), "application/octet-stream");
    }
}
