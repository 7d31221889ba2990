//! A set of generic storage abstractions for shipping backups and WAL to
//! tiered storage.
//!
//! [`RemoteStorage`] is a CRUD-like generic abstraction with a few
//! implementations:
//!   * [`local_fs`] keeps everything on the local file system
//!   * [`sftp`] ships over SSH/SFTP with symlink deduplication
//!   * [`s3_bucket`] talks to AWS S3 (or any S3-compatible endpoint)
//!
//! All backends deal in whole files addressed by [`RemotePath`]s relative to
//! a backend-configured root.

mod local_fs;
mod s3_bucket;
mod sftp;

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use local_fs::LocalFs;
pub use s3_bucket::{S3Bucket, S3Config};
pub use sftp::{SshConfig, SshStorage, SshWalFile};

/// Path on the remote storage, relative to some inner root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(path))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }
}

/// Everything that can go wrong when talking to a storage tier.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("remote file missing: {0}")]
    FileMissing(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("S3 request failed with HTTP status {0}")]
    S3HttpStatus(u16),
    #[error("SSH authentication failed: {0}")]
    SshAuth(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
pub struct Listing {
    pub keys: Vec<RemotePath>,
}

/// Storage (potentially remote) API to manage its state.
///
/// Implementations move whole files; the caller owns tree layout, hashing and
/// retention decisions.
#[allow(async_fn_in_trait)]
pub trait RemoteStorage: Send + Sync + 'static {
    /// List keys under the given prefix.
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Listing, StorageError>;

    /// Upload the local file `from` to the remote location `to`.
    async fn upload(
        &self,
        from: &Utf8Path,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Download the remote file `from` into the local path `to`.
    async fn download(
        &self,
        from: &RemotePath,
        to: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Delete a single remote file.
    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken)
        -> Result<(), StorageError>;

    /// Make `new` refer to the content already stored at `existing` without
    /// re-transmitting it: a symlink on filesystem-like backends, a
    /// server-side copy on S3.
    async fn link(
        &self,
        existing: &RemotePath,
        new: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;
}

/// Static configuration for one storage tier.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStorageKind {
    LocalFs { root: Utf8PathBuf },
    Ssh(SshConfig),
    AwsS3(S3Config),
}

/// Every storage, currently supported. Serves as a simple way to pass around
/// the [`RemoteStorage`] without dealing with generics.
#[derive(Clone)]
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
    Ssh(Arc<SshStorage>),
    AwsS3(Arc<S3Bucket>),
}

impl GenericRemoteStorage {
    pub fn from_config(kind: &RemoteStorageKind) -> anyhow::Result<Self> {
        Ok(match kind {
            RemoteStorageKind::LocalFs { root } => {
                tracing::info!("Using fs root '{root}' as a remote storage");
                GenericRemoteStorage::LocalFs(LocalFs::new(root.clone())?)
            }
            RemoteStorageKind::Ssh(conf) => {
                tracing::info!(
                    "Using ssh target {}@{}:{} as a remote storage",
                    conf.user,
                    conf.host,
                    conf.base_dir
                );
                GenericRemoteStorage::Ssh(Arc::new(SshStorage::new(conf.clone())))
            }
            RemoteStorageKind::AwsS3(conf) => {
                tracing::info!(
                    "Using s3 bucket '{}' in region '{}' as a remote storage",
                    conf.bucket,
                    conf.region
                );
                GenericRemoteStorage::AwsS3(Arc::new(S3Bucket::new(conf.clone())?))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            GenericRemoteStorage::LocalFs(_) => "local",
            GenericRemoteStorage::Ssh(_) => "ssh",
            GenericRemoteStorage::AwsS3(_) => "s3",
        }
    }

    /// Open the session the backend needs (SSH handshake, HTTP pool warmup).
    /// LocalFs has nothing to open.
    pub async fn setup(&self) -> Result<(), StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(_) => Ok(()),
            GenericRemoteStorage::Ssh(s) => s.connect().await,
            GenericRemoteStorage::AwsS3(_) => Ok(()),
        }
    }

    /// Release sessions.
    pub async fn teardown(&self) {
        if let GenericRemoteStorage::Ssh(s) = self {
            s.disconnect().await;
        }
    }

    pub async fn list(
        &self,
        prefix: Option<&RemotePath>,
        cancel: &CancellationToken,
    ) -> Result<Listing, StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(s) => s.list(prefix, cancel).await,
            GenericRemoteStorage::Ssh(s) => s.list(prefix, cancel).await,
            GenericRemoteStorage::AwsS3(s) => s.list(prefix, cancel).await,
        }
    }

    pub async fn upload(
        &self,
        from: &Utf8Path,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(s) => s.upload(from, to, cancel).await,
            GenericRemoteStorage::Ssh(s) => s.upload(from, to, cancel).await,
            GenericRemoteStorage::AwsS3(s) => s.upload(from, to, cancel).await,
        }
    }

    pub async fn download(
        &self,
        from: &RemotePath,
        to: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(s) => s.download(from, to, cancel).await,
            GenericRemoteStorage::Ssh(s) => s.download(from, to, cancel).await,
            GenericRemoteStorage::AwsS3(s) => s.download(from, to, cancel).await,
        }
    }

    pub async fn delete(
        &self,
        path: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(s) => s.delete(path, cancel).await,
            GenericRemoteStorage::Ssh(s) => s.delete(path, cancel).await,
            GenericRemoteStorage::AwsS3(s) => s.delete(path, cancel).await,
        }
    }

    pub async fn link(
        &self,
        existing: &RemotePath,
        new: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        match self {
            GenericRemoteStorage::LocalFs(s) => s.link(existing, new, cancel).await,
            GenericRemoteStorage::Ssh(s) => s.link(existing, new, cancel).await,
            GenericRemoteStorage::AwsS3(s) => s.link(existing, new, cancel).await,
        }
    }
}

/// Upload a local directory tree, deduplicating against the previous backup
/// of the same server.
///
/// `previous` maps relative paths of the previous backup to their SHA-256;
/// when the file about to be uploaded matches, the backend links the already
/// stored object under `previous_root` instead of re-transmitting the bytes.
/// Returns (files uploaded, files deduplicated).
pub async fn upload_tree(
    storage: &GenericRemoteStorage,
    local_root: &Utf8Path,
    remote_root: &RemotePath,
    previous: Option<(&RemotePath, &HashMap<String, String>)>,
    cancel: &CancellationToken,
) -> Result<(usize, usize), StorageError> {
    let mut uploaded = 0;
    let mut deduplicated = 0;
    for entry in walkdir::WalkDir::new(local_root).sort_by_file_name() {
        let entry = entry.map_err(|e| StorageError::Other(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("non-utf8 path {entry:?}")))?;
        let relative = path
            .strip_prefix(local_root)
            .map_err(|e| StorageError::Other(e.into()))?;
        let target = remote_root.join(relative);

        let mut linked = false;
        if let Some((previous_root, hashes)) = previous {
            if let Some(prev_digest) = hashes.get(relative.as_str()) {
                let digest = file_sha256(path).await?;
                if digest == *prev_digest {
                    storage
                        .link(&previous_root.join(relative), &target, cancel)
                        .await?;
                    deduplicated += 1;
                    linked = true;
                }
            }
        }
        if !linked {
            storage.upload(path, &target, cancel).await?;
            uploaded += 1;
        }
    }
    Ok((uploaded, deduplicated))
}

/// SHA-256 of a file's contents, as lowercase hex.
pub async fn file_sha256(path: &Utf8Path) -> Result<String, StorageError> {
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_validation() {
        RemotePath::from_string("some/path").unwrap();
        RemotePath::from_string("/absolute").unwrap_err();
        assert_eq!(
            RemotePath::from_string("a/b").unwrap().join("c").to_string(),
            "a/b/c"
        );
    }

    #[tokio::test]
    async fn upload_tree_dedups_unchanged_files() {
        let local = camino_tempfile::tempdir().unwrap();
        let remote = camino_tempfile::tempdir().unwrap();
        let storage = GenericRemoteStorage::from_config(&RemoteStorageKind::LocalFs {
            root: remote.path().to_path_buf(),
        })
        .unwrap();
        let cancel = CancellationToken::new();

        std::fs::create_dir_all(local.path().join("data")).unwrap();
        std::fs::write(local.path().join("data/unchanged"), b"same bytes").unwrap();
        std::fs::write(local.path().join("data/changed"), b"new bytes").unwrap();

        // "previous backup": same content for one file, different for the other
        let prev_root = RemotePath::from_string("server/backup/20250101").unwrap();
        std::fs::create_dir_all(prev_root.with_base(remote.path()).join("data")).unwrap();
        std::fs::write(
            prev_root.with_base(remote.path()).join("data/unchanged"),
            b"same bytes",
        )
        .unwrap();
        let mut hashes = HashMap::new();
        hashes.insert(
            "data/unchanged".to_string(),
            file_sha256(&local.path().join("data/unchanged")).await.unwrap(),
        );
        hashes.insert("data/changed".to_string(), "0".repeat(64));

        let new_root = RemotePath::from_string("server/backup/20250102").unwrap();
        let (uploaded, deduplicated) = upload_tree(
            &storage,
            local.path(),
            &new_root,
            Some((&prev_root, &hashes)),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(uploaded, 1);
        assert_eq!(deduplicated, 1);

        let linked = new_root.with_base(remote.path()).join("data/unchanged");
        assert!(linked.is_symlink() || linked.exists());
        assert_eq!(std::fs::read(linked).unwrap(), b"same bytes");
    }
}
