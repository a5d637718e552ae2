//! Local-filesystem archive backend
//!
//! Archive paths are resolved under a root directory. Objects are written to a
//! hidden sibling temp file and renamed into place, so a reader never sees a
//! partially written object.

use super::ArchiveStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct LocalArchive {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl LocalArchive {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Map an archive path onto the local tree, refusing `..` escapes
    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();

        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(StoreError::InvalidPath(path.to_string())),
            }
        }

        Ok(resolved)
    }
}

#[async_trait]
impl ArchiveStore for LocalArchive {
    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let local = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&local).await?)
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        let local = self.resolve(dir)?;
        let mut entries = match tokio::fs::read_dir(&local).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(dir.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-flight temp files are not part of the namespace
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn write(&self, path: &str, bytes: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let local = self.resolve(path)?;

        if !overwrite && tokio::fs::try_exists(&local).await? {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }

        let parent = local
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = local
            .file_name()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?
            .to_string_lossy()
            .into_owned();
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp_path = parent.join(format!(".{}.{}.{}.tmp", file_name, std::process::id(), seq));

        if let Err(e) = tokio::fs::write(&tmp_path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &local).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let local = self.resolve(path)?;
        match tokio::fs::read(&local).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(&self, path: &str, local_path: &Path) -> Result<(), StoreError> {
        let bytes = self.read(path).await?;
        tokio::fs::write(local_path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<bool, StoreError> {
        let local = self.resolve(path)?;
        match tokio::fs::remove_file(&local).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn makedirs(&self, path: &str) -> Result<(), StoreError> {
        let local = self.resolve(path)?;
        tokio::fs::create_dir_all(&local).await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read_list_delete() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());

        archive.makedirs("/iot-data/incoming").await.unwrap();
        assert!(archive.exists("/iot-data/incoming").await.unwrap());

        archive
            .write("/iot-data/incoming/batch_2.jsonl", b"two\n", false)
            .await
            .unwrap();
        archive
            .write("/iot-data/incoming/batch_1.jsonl", b"one\n", false)
            .await
            .unwrap();

        assert_eq!(
            archive.list("/iot-data/incoming").await.unwrap(),
            vec!["batch_1.jsonl".to_string(), "batch_2.jsonl".to_string()]
        );
        assert_eq!(archive.read("/iot-data/incoming/batch_2.jsonl").await.unwrap(), b"two\n");

        assert!(archive.delete("/iot-data/incoming/batch_1.jsonl").await.unwrap());
        assert!(!archive.delete("/iot-data/incoming/batch_1.jsonl").await.unwrap());
        assert!(!archive.exists("/iot-data/incoming/batch_1.jsonl").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_flag() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());

        archive.write("/models/discard_stats.json", b"a", false).await.unwrap();
        assert!(matches!(
            archive.write("/models/discard_stats.json", b"b", false).await,
            Err(StoreError::AlreadyExists(_))
        ));

        archive.write("/models/discard_stats.json", b"c", true).await.unwrap();
        assert_eq!(archive.read("/models/discard_stats.json").await.unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_paths() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path());

        assert!(matches!(archive.read("/models/model.json").await, Err(StoreError::NotFound(_))));
        assert!(matches!(archive.list("/nope").await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            archive.write("/../escape.json", b"x", true).await,
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_download_to_local_file() {
        let dir = tempdir().unwrap();
        let archive = LocalArchive::new(dir.path().join("archive"));
        archive.write("/models/model.json", b"{}", true).await.unwrap();

        let target = dir.path().join("model.local");
        archive.download("/models/model.json", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{}");
    }
}
