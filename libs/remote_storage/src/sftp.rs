//! SSH/SFTP storage backend.
//!
//! One SSH session per backend instance, opened by `connect` and reused for
//! every transfer. Authentication is public-key only; the remote host key is
//! checked against `~/.ssh/known_hosts` and auto-added on first contact.
//! libssh2 calls are blocking, so every operation runs under
//! `spawn_blocking` with the session temporarily moved into the closure.

use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use ssh2::{CheckResult, KnownHostFileKind, MethodType, OpenFlags, OpenType};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{Listing, RemotePath, RemoteStorage, StorageError};

fn default_port() -> u16 {
    22
}

#[derive(Clone, Debug, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    /// Remote directory everything is stored under.
    pub base_dir: Utf8PathBuf,
    /// Private key; `<identity>.pub` must sit next to it. Defaults to
    /// `~/.ssh/id_rsa`.
    pub identity: Option<Utf8PathBuf>,
    /// Preferred cipher list for the transport, e.g.
    /// "aes256-ctr,aes192-ctr,aes128-ctr".
    pub ciphers: Option<String>,
    pub known_hosts: Option<Utf8PathBuf>,
}

struct SshSession {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

pub struct SshStorage {
    conf: SshConfig,
    inner: Mutex<Option<SshSession>>,
}

fn home_path(file: &str) -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    Path::new(&home).join(".ssh").join(file)
}

impl SshStorage {
    pub fn new(conf: SshConfig) -> SshStorage {
        SshStorage {
            conf,
            inner: Mutex::new(None),
        }
    }

    /// Perform the TCP connect, handshake, host-key check and public-key
    /// authentication.
    pub async fn connect(&self) -> Result<(), StorageError> {
        let conf = self.conf.clone();
        let session = tokio::task::spawn_blocking(move || open_session(&conf))
            .await
            .map_err(|e| StorageError::Other(e.into()))??;
        *self.inner.lock().await = Some(session);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(sess) = guard.take() {
            let _ = tokio::task::spawn_blocking(move || {
                let _ = sess.session.disconnect(None, "bye", None);
            })
            .await;
        }
    }

    async fn with_session<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&SshSession) -> Result<T, StorageError> + Send + 'static,
    {
        let mut guard = self.inner.lock().await;
        let sess = guard
            .take()
            .ok_or_else(|| StorageError::Network("ssh session is not connected".to_string()))?;
        let (sess, result) = tokio::task::spawn_blocking(move || {
            let result = f(&sess);
            (sess, result)
        })
        .await
        .map_err(|e| StorageError::Other(e.into()))?;
        *guard = Some(sess);
        result
    }

    fn remote(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.conf.base_dir)
    }

    /// Open a WAL segment file on the remote side for streaming writes: the
    /// file is created under its `.partial` name, padded to the full segment
    /// size and rewound to the start.
    pub async fn wal_open(
        self: &Arc<Self>,
        wal_dir: &RemotePath,
        segment_name: &str,
        seg_size: usize,
    ) -> Result<SshWalFile, StorageError> {
        let dir = self.remote(wal_dir);
        let partial = dir.join(format!("{segment_name}.partial"));
        let sealed = dir.join(segment_name);
        let partial_for_open = partial.clone();
        let file = self
            .with_session(move |sess| {
                mkdir_p(&sess.sftp, partial_for_open.parent().unwrap())?;
                let mut file = sess
                    .sftp
                    .open_mode(
                        partial_for_open.as_std_path(),
                        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                        0o600,
                        OpenType::File,
                    )
                    .map_err(|e| StorageError::Network(e.to_string()))?;
                let zeros = vec![0u8; 128 * 1024];
                let mut written = 0;
                while written < seg_size {
                    let n = std::cmp::min(zeros.len(), seg_size - written);
                    file.write_all(&zeros[..n])?;
                    written += n;
                }
                file.seek(SeekFrom::Start(0))?;
                Ok(file)
            })
            .await?;
        Ok(SshWalFile {
            storage: Arc::clone(self),
            file: Some(file),
            partial,
            sealed,
        })
    }
}

fn open_session(conf: &SshConfig) -> Result<SshSession, StorageError> {
    let tcp = TcpStream::connect((conf.host.as_str(), conf.port))
        .map_err(|e| StorageError::Network(format!("connect {}:{}: {e}", conf.host, conf.port)))?;
    let mut session =
        ssh2::Session::new().map_err(|e| StorageError::Network(e.to_string()))?;
    if let Some(ciphers) = &conf.ciphers {
        session
            .method_pref(MethodType::CryptCs, ciphers)
            .map_err(|e| StorageError::Network(e.to_string()))?;
        session
            .method_pref(MethodType::CryptSc, ciphers)
            .map_err(|e| StorageError::Network(e.to_string()))?;
    }
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| StorageError::Network(format!("ssh handshake: {e}")))?;

    check_known_hosts(conf, &session)?;

    let identity = conf
        .identity
        .clone()
        .map(Utf8PathBuf::into_std_path_buf)
        .unwrap_or_else(|| home_path("id_rsa"));
    let identity_pub = identity.with_extension("pub");
    session
        .userauth_pubkey_file(&conf.user, Some(&identity_pub), &identity, None)
        .map_err(|e| StorageError::SshAuth(e.to_string()))?;
    if !session.authenticated() {
        return Err(StorageError::SshAuth(format!(
            "public key authentication failed for {}",
            conf.user
        )));
    }

    let sftp = session
        .sftp()
        .map_err(|e| StorageError::Network(e.to_string()))?;
    Ok(SshSession { session, sftp })
}

fn check_known_hosts(conf: &SshConfig, session: &ssh2::Session) -> Result<(), StorageError> {
    let path = conf
        .known_hosts
        .clone()
        .map(Utf8PathBuf::into_std_path_buf)
        .unwrap_or_else(|| home_path("known_hosts"));
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| StorageError::Network(e.to_string()))?;
    // A missing file means first contact with any host from this machine.
    let _ = known_hosts.read_file(&path, KnownHostFileKind::OpenSSH);

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| StorageError::Network("server offered no host key".to_string()))?;
    match known_hosts.check_port(&conf.host, conf.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(StorageError::SshAuth(format!(
            "host key for {} changed; refusing to connect",
            conf.host
        ))),
        CheckResult::NotFound | CheckResult::Failure => {
            // auto-add on first contact
            known_hosts
                .add(&conf.host, key, "added by pgvault", key_type.into())
                .map_err(|e| StorageError::Network(e.to_string()))?;
            known_hosts
                .write_file(&path, KnownHostFileKind::OpenSSH)
                .map_err(|e| StorageError::Network(e.to_string()))?;
            Ok(())
        }
    }
}

fn mkdir_p(sftp: &ssh2::Sftp, dir: &Utf8Path) -> Result<(), StorageError> {
    let mut current = Utf8PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(current.as_std_path()).is_err() {
            // Racing creators are fine; only fail if the dir is still absent.
            if sftp.mkdir(current.as_std_path(), 0o700).is_err()
                && sftp.stat(current.as_std_path()).is_err()
            {
                return Err(StorageError::Network(format!(
                    "could not create remote directory {current}"
                )));
            }
        }
    }
    Ok(())
}

fn walk_remote(
    sftp: &ssh2::Sftp,
    dir: &Utf8Path,
    root: &Utf8Path,
    keys: &mut Vec<RemotePath>,
) -> Result<(), StorageError> {
    let entries = match sftp.readdir(dir.as_std_path()) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // absent prefix lists as empty
    };
    for (path, stat) in entries {
        let Some(path) = Utf8Path::from_path(&path).map(Utf8Path::to_path_buf) else {
            continue;
        };
        if stat.is_dir() {
            walk_remote(sftp, &path, root, keys)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| StorageError::Other(e.into()))?;
            keys.push(RemotePath::new(relative).map_err(StorageError::Other)?);
        }
    }
    Ok(())
}

impl RemoteStorage for SshStorage {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        _cancel: &CancellationToken,
    ) -> Result<Listing, StorageError> {
        let base = match prefix {
            Some(p) => self.remote(p),
            None => self.conf.base_dir.clone(),
        };
        let root = self.conf.base_dir.clone();
        self.with_session(move |sess| {
            let mut keys = Vec::new();
            walk_remote(&sess.sftp, &base, &root, &mut keys)?;
            keys.sort();
            Ok(Listing { keys })
        })
        .await
    }

    async fn upload(
        &self,
        from: &Utf8Path,
        to: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let target = self.remote(to);
        let source = from.to_path_buf();
        self.with_session(move |sess| {
            mkdir_p(&sess.sftp, target.parent().unwrap())?;
            let mut local = std::fs::File::open(&source)?;
            let mut remote = sess
                .sftp
                .create(target.as_std_path())
                .map_err(|e| StorageError::Network(e.to_string()))?;
            std::io::copy(&mut local, &mut remote)?;
            Ok(())
        })
        .await
    }

    async fn download(
        &self,
        from: &RemotePath,
        to: &Utf8Path,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let source = self.remote(from);
        let target = to.to_path_buf();
        self.with_session(move |sess| {
            let mut remote = sess
                .sftp
                .open(source.as_std_path())
                .map_err(|_| StorageError::FileMissing(source.to_string()))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut local = std::fs::File::create(&target)?;
            let mut buf = vec![0u8; 128 * 1024];
            loop {
                let n = remote.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                local.write_all(&buf[..n])?;
            }
            Ok(())
        })
        .await
    }

    async fn delete(
        &self,
        path: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let target = self.remote(path);
        self.with_session(move |sess| {
            sess.sftp
                .unlink(target.as_std_path())
                .map_err(|_| StorageError::FileMissing(target.to_string()))
        })
        .await
    }

    async fn link(
        &self,
        existing: &RemotePath,
        new: &RemotePath,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        let source = self.remote(existing);
        let target = self.remote(new);
        self.with_session(move |sess| {
            mkdir_p(&sess.sftp, target.parent().unwrap())?;
            let _ = sess.sftp.unlink(target.as_std_path());
            sess.sftp
                .symlink(source.as_std_path(), target.as_std_path())
                .map_err(|e| StorageError::Network(e.to_string()))
        })
        .await
    }
}

/// A WAL segment file being streamed to the SSH tier, mirroring the local
/// segment lifecycle: preallocated `.partial`, sequential writes, sealed by
/// rename.
pub struct SshWalFile {
    storage: Arc<SshStorage>,
    file: Option<ssh2::File>,
    partial: Utf8PathBuf,
    sealed: Utf8PathBuf,
}

impl SshWalFile {
    pub async fn write(&mut self, data: Vec<u8>) -> Result<(), StorageError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StorageError::Network("remote WAL file already closed".to_string()))?;
        let (file, result) = tokio::task::spawn_blocking(move || {
            let result = file.write_all(&data).map_err(StorageError::Io);
            (file, result)
        })
        .await
        .map_err(|e| StorageError::Other(e.into()))?;
        self.file = Some(file);
        result
    }

    /// Close the remote file; a completed segment loses its `.partial`
    /// suffix, an interrupted one keeps it.
    pub async fn close(mut self, partial: bool) -> Result<(), StorageError> {
        if let Some(file) = self.file.take() {
            drop(file); // closes the remote handle
        }
        if !partial {
            let from = self.partial.clone();
            let to = self.sealed.clone();
            self.storage
                .with_session(move |sess| {
                    let _ = sess.sftp.unlink(to.as_std_path());
                    sess.sftp
                        .rename(from.as_std_path(), to.as_std_path(), None)
                        .map_err(|e| StorageError::Network(e.to_string()))
                })
                .await?;
        }
        Ok(())
    }
}
