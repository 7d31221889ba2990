//!
//! Consume a BASE_BACKUP replication stream into a backup directory.
//!
//! The server multiplexes everything through CopyData frames whose first
//! byte selects the channel: `'n'` starts a new per-tablespace tar archive,
//! `'m'` starts the backup manifest, `'d'` carries payload bytes for
//! whichever of the two is open, and `'p'` reports progress. Each finished
//! archive is extracted in place and the tar file removed.
//!
//! Disk and network I/O are throttled by two independent token buckets; a
//! refused request sleeps and retries inside [`TokenBucket::consume`].
//!

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;
use bytes::{Buf, Bytes};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pq_proto::framed::Framed;
use pq_proto::BeMessage;
use utils::rate_limit::TokenBucket;

/// The two 512-byte blocks of zeros terminating a tar archive. The server
/// omits them for plain (client-compressed) archives, so the receiver
/// appends them; server-side compressed archives arrive complete.
const TAR_TRAILER: [u8; 1024] = [0u8; 1024];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerCompression {
    None,
    Gzip,
    Zstd,
}

impl ServerCompression {
    pub fn from_config(s: Option<&str>) -> anyhow::Result<ServerCompression> {
        match s {
            None | Some("none") => Ok(ServerCompression::None),
            Some("gzip") => Ok(ServerCompression::Gzip),
            Some("zstd") => Ok(ServerCompression::Zstd),
            Some(other) => anyhow::bail!("unsupported base backup compression '{other}'"),
        }
    }

    /// The archive file extension the server-side setting produces.
    pub fn extension(self) -> &'static str {
        match self {
            ServerCompression::None => "tar",
            ServerCompression::Gzip => "tar.gz",
            ServerCompression::Zstd => "tar.zstd",
        }
    }
}

/// Base backup progress counters; shared with whoever reports status.
#[derive(Default)]
pub struct Progress {
    pub bytes_done: AtomicI64,
    pub bytes_total: AtomicI64,
}

impl Progress {
    pub fn set_total(&self, total: i64) {
        self.bytes_total.store(total, Ordering::Relaxed);
    }

    /// Record a 'p' frame: done advances, and the total is revised upward
    /// when the server turns out to have more data than first estimated.
    pub fn update(&self, done: i64) {
        self.bytes_done.store(done, Ordering::Relaxed);
        self.bytes_total.fetch_max(done, Ordering::Relaxed);
    }
}

/// One archive announced by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedArchive {
    /// Archive name as announced, e.g. `base.tar.gz` or `16385.tar`.
    pub name: String,
    /// Tablespace path on the database server; empty for the main data dir.
    pub server_path: String,
    /// Directory the archive was extracted into.
    pub dest: Utf8PathBuf,
}

impl ReceivedArchive {
    pub fn is_base(&self) -> bool {
        self.name.starts_with("base.tar")
    }

    /// The tablespace OID encoded in the archive name, for non-base archives.
    pub fn tablespace_oid(&self) -> Option<u32> {
        self.name.split('.').next()?.parse().ok()
    }
}

enum Output {
    Idle,
    Archive {
        file: tokio::fs::File,
        tar_path: Utf8PathBuf,
        dest: Utf8PathBuf,
        index: usize,
    },
    Manifest {
        file: tokio::fs::File,
    },
}

/// Receive the archive stream into `backup_dir`, returning the archives in
/// the order the server sent them. The caller has already issued
/// BASE_BACKUP and seen the CopyOutResponse.
pub async fn receive_base_backup<S>(
    framed: &mut Framed<S>,
    backup_dir: &Utf8Path,
    compression: ServerCompression,
    disk_bucket: &TokenBucket,
    network_bucket: &TokenBucket,
    progress: &Progress,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<ReceivedArchive>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut archives: Vec<ReceivedArchive> = Vec::new();
    let mut output = Output::Idle;

    loop {
        if cancel.is_cancelled() {
            anyhow::bail!("base backup cancelled");
        }
        let msg = framed
            .read_message()
            .await
            .context("reading base backup stream")?
            .context("base backup stream closed mid-backup")?;
        match msg {
            BeMessage::CopyData(mut frame) => {
                if frame.is_empty() {
                    anyhow::bail!("empty CopyData frame in base backup stream");
                }
                let kind = frame.get_u8();
                match kind {
                    b'n' => {
                        finish_output(&mut output, &mut archives, compression).await?;
                        let name = read_cstring(&mut frame)?;
                        let server_path = read_cstring(&mut frame)?;
                        output =
                            open_archive(backup_dir, &name, &server_path, &mut archives).await?;
                    }
                    b'm' => {
                        finish_output(&mut output, &mut archives, compression).await?;
                        let manifest_path = backup_dir.join("data").join("backup_manifest");
                        tokio::fs::create_dir_all(manifest_path.parent().unwrap()).await?;
                        info!("receiving backup manifest");
                        output = Output::Manifest {
                            file: tokio::fs::File::create(&manifest_path).await?,
                        };
                    }
                    b'd' => {
                        if !network_bucket.consume(frame.len(), cancel).await
                            || !disk_bucket.consume(frame.len(), cancel).await
                        {
                            anyhow::bail!("base backup cancelled while rate limited");
                        }
                        match &mut output {
                            Output::Idle => {
                                anyhow::bail!("data frame before any archive was announced")
                            }
                            Output::Archive { file, .. } | Output::Manifest { file } => {
                                file.write_all(&frame).await?;
                            }
                        }
                    }
                    b'p' => {
                        if frame.len() < 8 {
                            anyhow::bail!("short progress frame");
                        }
                        progress.update(frame.get_i64());
                    }
                    other => {
                        anyhow::bail!("unrecognized archive stream frame {:?}", char::from(other))
                    }
                }
            }
            BeMessage::CopyDone => {
                finish_output(&mut output, &mut archives, compression).await?;
                break;
            }
            BeMessage::ErrorResponse(err) => {
                anyhow::bail!("server aborted base backup: {err}");
            }
            BeMessage::NoticeResponse(notice) => {
                warn!("server notice during base backup: {notice}");
            }
            // Command completion chatter after CopyDone is handled by the
            // caller; anything else here is a protocol violation.
            other => anyhow::bail!(
                "unexpected message {:?} in base backup stream",
                char::from(other.kind())
            ),
        }
    }

    Ok(archives)
}

async fn open_archive(
    backup_dir: &Utf8Path,
    name: &str,
    server_path: &str,
    archives: &mut Vec<ReceivedArchive>,
) -> anyhow::Result<Output> {
    let (dest, tar_path) = if name.starts_with("base.tar") {
        let dest = backup_dir.join("data");
        (dest.clone(), dest.join(name))
    } else {
        let stem = name.split('.').next().unwrap_or(name);
        let dest = backup_dir.join(format!("tblspc_{stem}"));
        (dest.clone(), dest.join(name))
    };
    tokio::fs::create_dir_all(&dest).await?;
    info!("receiving archive {name} into {dest}");
    let file = tokio::fs::File::create(&tar_path).await?;
    archives.push(ReceivedArchive {
        name: name.to_string(),
        server_path: server_path.to_string(),
        dest: dest.clone(),
    });
    Ok(Output::Archive {
        file,
        tar_path,
        dest,
        index: archives.len() - 1,
    })
}

async fn finish_output(
    output: &mut Output,
    archives: &mut [ReceivedArchive],
    compression: ServerCompression,
) -> anyhow::Result<()> {
    match std::mem::replace(output, Output::Idle) {
        Output::Idle => Ok(()),
        Output::Manifest { mut file } => {
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        Output::Archive {
            mut file,
            tar_path,
            dest,
            index,
        } => {
            if compression == ServerCompression::None {
                file.write_all(&TAR_TRAILER).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            debug!("extracting {tar_path}");
            let tar_path_blocking = tar_path.clone();
            let dest_blocking = dest.clone();
            tokio::task::spawn_blocking(move || {
                extract_archive(&tar_path_blocking, &dest_blocking, compression)
            })
            .await
            .context("extraction task panicked")??;
            tokio::fs::remove_file(&tar_path).await?;
            debug!("extracted archive {} into {dest}", archives[index].name);
            Ok(())
        }
    }
}

fn extract_archive(
    tar_path: &Utf8Path,
    dest: &Utf8Path,
    compression: ServerCompression,
) -> anyhow::Result<()> {
    let file = std::fs::File::open(tar_path)?;
    match compression {
        ServerCompression::None => {
            let mut archive = tar::Archive::new(file);
            archive.set_unpack_xattrs(false);
            archive.unpack(dest)?;
        }
        ServerCompression::Gzip => {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            archive.unpack(dest)?;
        }
        ServerCompression::Zstd => {
            let mut archive = tar::Archive::new(zstd::stream::read::Decoder::new(file)?);
            archive.unpack(dest)?;
        }
    }
    Ok(())
}

fn read_cstring(buf: &mut Bytes) -> anyhow::Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .context("unterminated string in archive frame")?;
    let s = buf.split_to(pos);
    buf.advance(1);
    Ok(String::from_utf8(s.to_vec())?)
}

/// Recreate `data/pg_tblspc/<oid>` symlinks to the per-tablespace trees,
/// replacing whatever the extracted base archive contained.
pub fn fixup_tablespace_links(
    backup_dir: &Utf8Path,
    archives: &[ReceivedArchive],
) -> anyhow::Result<()> {
    let link_dir = backup_dir.join("data").join("pg_tblspc");
    std::fs::create_dir_all(&link_dir)?;
    for archive in archives.iter().filter(|a| !a.is_base()) {
        let Some(oid) = archive.tablespace_oid() else {
            warn!("archive {} has no tablespace oid in its name", archive.name);
            continue;
        };
        let link = link_dir.join(oid.to_string());
        match std::fs::symlink_metadata(&link) {
            Ok(_) => std::fs::remove_file(&link)?,
            Err(_) => {}
        }
        let target = Utf8PathBuf::from("../..").join(archive.dest.file_name().unwrap());
        std::os::unix::fs::symlink(&target, &link)
            .with_context(|| format!("creating tablespace symlink {link}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio::io::AsyncWriteExt as _;

    fn copy_frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'd');
        buf.put_u32(4 + payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    fn tar_with_file(name: &str, content: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_path(name).unwrap();
        header.set_mode(0o600);
        header.set_cksum();
        builder.append(&header, content).unwrap();
        // into_inner finishes the archive with the zero trailer; the server
        // strips it for plain archives, and so do we here.
        let mut bytes = builder.into_inner().unwrap();
        bytes.truncate(bytes.len() - 1024);
        bytes
    }

    #[tokio::test]
    async fn receive_archives_manifest_and_progress() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let backup_dir = scratch.path().join("20250101000000");

        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut framed = Framed::new(client);

        let server_task = tokio::spawn(async move {
            // base archive
            let mut frame = BytesMut::new();
            frame.put_u8(b'n');
            frame.put_slice(b"base.tar\0\0");
            server.write_all(&copy_frame(&frame)).await.unwrap();
            let tar = tar_with_file("PG_VERSION", b"16\n");
            server.write_all(&copy_frame(&[&[b'd'][..], &tar[..]].concat())).await.unwrap();

            let mut progress = BytesMut::new();
            progress.put_u8(b'p');
            progress.put_i64(tar.len() as i64);
            server.write_all(&copy_frame(&progress)).await.unwrap();

            // tablespace archive
            let mut frame = BytesMut::new();
            frame.put_u8(b'n');
            frame.put_slice(b"16385.tar\0/mnt/ts1\0");
            server.write_all(&copy_frame(&frame)).await.unwrap();
            let ts_tar = tar_with_file("16400", b"relation bytes");
            server
                .write_all(&copy_frame(&[&[b'd'][..], &ts_tar[..]].concat()))
                .await
                .unwrap();

            // manifest
            let mut frame = BytesMut::new();
            frame.put_u8(b'm');
            server.write_all(&copy_frame(&frame)).await.unwrap();
            server
                .write_all(&copy_frame(b"d{\"PostgreSQL-Backup-Manifest-Version\": 1, \"Files\": []}"))
                .await
                .unwrap();

            // CopyDone
            server.write_all(&[b'c', 0, 0, 0, 4]).await.unwrap();
        });

        let progress = Progress::default();
        let cancel = CancellationToken::new();
        let archives = receive_base_backup(
            &mut framed,
            &backup_dir,
            ServerCompression::None,
            &TokenBucket::unlimited(),
            &TokenBucket::unlimited(),
            &progress,
            &cancel,
        )
        .await
        .unwrap();
        server_task.await.unwrap();

        assert_eq!(archives.len(), 2);
        assert!(archives[0].is_base());
        assert_eq!(archives[1].tablespace_oid(), Some(16385));
        assert_eq!(archives[1].server_path, "/mnt/ts1");

        // archives extracted, tar files gone
        assert_eq!(
            std::fs::read(backup_dir.join("data/PG_VERSION")).unwrap(),
            b"16\n"
        );
        assert_eq!(
            std::fs::read(backup_dir.join("tblspc_16385/16400")).unwrap(),
            b"relation bytes"
        );
        assert!(!backup_dir.join("data/base.tar").exists());
        assert!(backup_dir.join("data/backup_manifest").exists());
        assert!(progress.bytes_done.load(Ordering::Relaxed) > 0);

        fixup_tablespace_links(&backup_dir, &archives).unwrap();
        let link = backup_dir.join("data/pg_tblspc/16385");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            std::path::PathBuf::from("../../tblspc_16385")
        );
    }

    #[test]
    fn compression_options() {
        assert_eq!(
            ServerCompression::from_config(Some("zstd")).unwrap().extension(),
            "tar.zstd"
        );
        assert_eq!(ServerCompression::from_config(None).unwrap().extension(), "tar");
        assert!(ServerCompression::from_config(Some("lz4")).is_err());
    }

    #[test]
    fn progress_total_revises_upward_only() {
        let progress = Progress::default();
        progress.set_total(1000);
        progress.update(500);
        assert_eq!(progress.bytes_total.load(Ordering::Relaxed), 1000);
        progress.update(1500);
        assert_eq!(progress.bytes_total.load(Ordering::Relaxed), 1500);
        assert_eq!(progress.bytes_done.load(Ordering::Relaxed), 1500);
    }
}
