//! Local filesystem acting as remote storage.
//!
//! The backup tree already lives on local disk, so "uploading" is a copy
//! under the configured root; mostly useful for tests and for keeping a
//! second on-host copy on another filesystem.

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use crate::{Listing, RemotePath, RemoteStorage, StorageError};

#[derive(Clone)]
pub struct LocalFs {
    root: Utf8PathBuf,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self { root })
    }

    fn resolve(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.root)
    }
}

impl RemoteStorage for LocalFs {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        _cancel: &CancellationToken,
    ) -> Result<Listing, StorageError> {
        let base = match prefix {
            Some(p) => self.resolve(p),
            None => self.root.clone(),
        };
        let mut listing = Listing::default();
        if !base.exists() {
            return Ok(listing);
        }
        for entry in walkdir::WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.map_err(|e| StorageError::Other(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| StorageError::Other(anyhow::anyhow!("non-utf8 path")))?;
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|e| StorageError::Other(e.into()))?;
            listing
                .keys
                .push(RemotePath::new(relative).map_err(StorageError::Other)?);
        }
        Ok(listing)
    }

    async fn upload(
        &self,
        from: &Utf8Path,
        to: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let target = self.resolve(to);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // copy through a temp name so a crashed copy is never mistaken for
        // a complete file
        let tmp = target.with_extension("tmp");
        tokio::fs::copy(from, &tmp).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn download(
        &self,
        from: &RemotePath,
        to: &Utf8Path,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let source = self.resolve(from);
        if !source.exists() {
            return Err(StorageError::FileMissing(source.to_string()));
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, to).await?;
        Ok(())
    }

    async fn delete(
        &self,
        path: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let target = self.resolve(path);
        if !target.exists() {
            return Err(StorageError::FileMissing(target.to_string()));
        }
        tokio::fs::remove_file(target).await?;
        Ok(())
    }

    async fn link(
        &self,
        existing: &RemotePath,
        new: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let source = self.resolve(existing);
        let target = self.resolve(new);
        if !source.exists() {
            return Err(StorageError::FileMissing(source.to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if target.exists() {
            tokio::fs::remove_file(&target).await?;
        }
        tokio::fs::symlink(&source, &target).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_list_download_delete() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let storage_root = scratch.path().join("storage");
        let storage = LocalFs::new(storage_root).unwrap();
        let cancel = CancellationToken::new();

        let src = scratch.path().join("input");
        std::fs::write(&src, b"payload").unwrap();
        let key = RemotePath::from_string("srv/wal/000000010000000000000001").unwrap();
        storage.upload(&src, &key, &cancel).await.unwrap();

        let listing = storage
            .list(Some(&RemotePath::from_string("srv").unwrap()), &cancel)
            .await
            .unwrap();
        assert_eq!(listing.keys, vec![key.clone()]);

        let dst = scratch.path().join("output");
        storage.download(&key, &dst, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");

        storage.delete(&key, &cancel).await.unwrap();
        assert!(matches!(
            storage.download(&key, &dst, &cancel).await,
            Err(StorageError::FileMissing(_))
        ));
    }
}
