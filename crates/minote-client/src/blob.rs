//! Local attachment storage.
//!
//! Layout under the application-support directory:
//! `images/<fileId>.<ext>` for downloaded attachments,
//! `pending_uploads/<tempFileId>.<ext>` for attachments awaiting their
//! upload commit, and `audio/<folderId>/` as the audio cache subtree.
//! Extensions are chosen by content sniffing, so lookups match on the
//! file stem.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use minote_core::{FileId, FolderId};
use tracing::debug;

const LOG_TARGET: &str = "minote::blob";

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending_uploads")
    }

    pub fn audio_dir(&self, folder_id: &FolderId) -> PathBuf {
        self.root.join("audio").join(folder_id.as_str())
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.images_dir()).await?;
        tokio::fs::create_dir_all(self.pending_dir()).await?;
        tokio::fs::create_dir_all(self.root.join("audio")).await?;
        Ok(())
    }

    /// Whether a downloaded attachment with this id exists, any
    /// extension.
    pub async fn has_attachment(&self, file_id: &FileId) -> bool {
        find_by_stem(&self.images_dir(), file_id.as_str())
            .await
            .ok()
            .flatten()
            .is_some()
    }

    pub async fn save_attachment(
        &self,
        file_id: &FileId,
        ext: &str,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(self.images_dir()).await?;
        let path = self.images_dir().join(format!("{file_id}.{ext}"));
        tokio::fs::write(&path, bytes).await?;
        debug!(target: LOG_TARGET, path = %path.display(), "Saved attachment");
        Ok(path)
    }

    pub async fn read_attachment(&self, file_id: &FileId) -> io::Result<Option<Vec<u8>>> {
        match find_by_stem(&self.images_dir(), file_id.as_str()).await? {
            Some(path) => Ok(Some(tokio::fs::read(path).await?)),
            None => Ok(None),
        }
    }

    /// Stage bytes for an attachment that has not been committed
    /// server-side yet.
    pub async fn stage_pending(
        &self,
        file_id: &FileId,
        ext: &str,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(self.pending_dir()).await?;
        let path = self.pending_dir().join(format!("{file_id}.{ext}"));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    pub async fn read_pending(&self, file_id: &FileId) -> io::Result<Option<(String, Vec<u8>)>> {
        match find_by_stem(&self.pending_dir(), file_id.as_str()).await? {
            Some(path) => {
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Some((ext, tokio::fs::read(path).await?)))
            }
            None => Ok(None),
        }
    }

    /// Move a staged upload into the downloaded set under its
    /// server-issued id.
    pub async fn promote_pending(
        &self,
        local_id: &FileId,
        server_id: &FileId,
    ) -> io::Result<Option<PathBuf>> {
        let Some(pending) = find_by_stem(&self.pending_dir(), local_id.as_str()).await? else {
            return Ok(None);
        };

        let ext = pending
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        tokio::fs::create_dir_all(self.images_dir()).await?;
        let target = self.images_dir().join(format!("{server_id}.{ext}"));
        tokio::fs::rename(&pending, &target).await?;
        debug!(
            target: LOG_TARGET,
            from = %pending.display(),
            to = %target.display(),
            "Promoted pending upload"
        );
        Ok(Some(target))
    }

    /// Rename the audio cache subtree when a folder's id migrates.
    pub async fn rename_folder_dir(
        &self,
        old_id: &FolderId,
        new_id: &FolderId,
    ) -> io::Result<bool> {
        let old_dir = self.audio_dir(old_id);
        if !old_dir.exists() {
            return Ok(false);
        }
        let new_dir = self.audio_dir(new_id);
        tokio::fs::rename(&old_dir, &new_dir).await?;
        debug!(
            target: LOG_TARGET,
            from = %old_dir.display(),
            to = %new_dir.display(),
            "Renamed folder attachment directory"
        );
        Ok(true)
    }
}

async fn find_by_stem(dir: &Path, stem: &str) -> io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.file_stem().map(|s| s.to_string_lossy() == stem) == Some(true) {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn attachment_roundtrip_and_promotion() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let blob = BlobStore::new(dir.path());
        blob.ensure_dirs().await.expect("Dirs created");

        let local = FileId::new("local_f1");
        assert!(!blob.has_attachment(&local).await);

        blob.stage_pending(&local, "png", b"\x89PNGdata")
            .await
            .expect("Staged");
        let (ext, bytes) = blob
            .read_pending(&local)
            .await
            .expect("Readable")
            .expect("Present");
        assert_eq!(ext, "png");
        assert_eq!(bytes, b"\x89PNGdata");

        let server = FileId::new("F9");
        blob.promote_pending(&local, &server)
            .await
            .expect("Promoted")
            .expect("Was pending");

        assert!(blob.has_attachment(&server).await);
        assert!(blob.read_pending(&local).await.expect("Readable").is_none());
        assert_eq!(
            blob.read_attachment(&server)
                .await
                .expect("Readable")
                .expect("Present"),
            b"\x89PNGdata"
        );
    }

    #[test_log::test(tokio::test)]
    async fn folder_dir_rename() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let blob = BlobStore::new(dir.path());

        let old_id = FolderId::new("local_fold");
        let new_id = FolderId::new("42");

        // Nothing to rename yet.
        assert!(
            !blob
                .rename_folder_dir(&old_id, &new_id)
                .await
                .expect("No-op rename")
        );

        tokio::fs::create_dir_all(blob.audio_dir(&old_id))
            .await
            .expect("Dir created");
        assert!(
            blob.rename_folder_dir(&old_id, &new_id)
                .await
                .expect("Renamed")
        );
        assert!(blob.audio_dir(&new_id).exists());
    }
}
