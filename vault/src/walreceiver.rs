//!
//! The WAL streaming client: one long-running task per server.
//!
//! Handshake: authenticate, IDENTIFY_SYSTEM, pick the starting point (local
//! WAL on disk, then the replication slot on PG 15+, then the server's
//! current position truncated to a segment boundary), then START_REPLICATION
//! and a plain read-dispatch loop over the CopyBoth stream. Segment files
//! live under their `.partial` name, preallocated to the full segment size,
//! and are atomically renamed once the last byte they cover is fsynced.
//! When the server ends a timeline, the loop picks the next (timeline,
//! position) out of the end-of-timeline result set and starts over.
//!

use std::sync::Arc;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use postgres_ffi::xlog_utils::get_current_timestamp;
use postgres_ffi::{
    IsPartialXLogFileName, IsXLogFileName, PgMajorVersion, TimeLineID, TimelineHistoryFileName,
    XLogFileName, XLogFromFileName,
};
use pq_proto::framed::Framed;
use pq_proto::{
    md5_password, BeMessage, FeMessage, PrimaryKeepalive, StandbyStatusUpdate, XLogDataHeader,
};
use remote_storage::{GenericRemoteStorage, RemotePath, SshWalFile};
use utils::backoff;
use utils::lsn::Lsn;

use crate::config::ServerConf;
use crate::metrics::{WAL_BYTES_RECEIVED, WAL_SEGMENTS_SEALED};
use crate::state::ProcessState;

/// Result set of a simple-protocol command.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn get(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}

/// A replication-protocol session over any async byte stream.
pub struct ReplicationClient<S> {
    framed: Framed<S>,
}

impl ReplicationClient<TcpStream> {
    pub async fn connect(conf: &ServerConf) -> anyhow::Result<ReplicationClient<TcpStream>> {
        let stream = TcpStream::connect((conf.host.as_str(), conf.port))
            .await
            .with_context(|| format!("connecting to {}:{}", conf.host, conf.port))?;
        stream.set_nodelay(true)?;
        ReplicationClient::handshake(stream, &conf.user, conf.password.as_deref()).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReplicationClient<S> {
    /// Startup and authentication: trust, cleartext and md5 are supported.
    pub async fn handshake(
        stream: S,
        user: &str,
        password: Option<&str>,
    ) -> anyhow::Result<ReplicationClient<S>> {
        let mut framed = Framed::new(stream);
        framed
            .send(&FeMessage::StartupMessage(&[
                ("user", user),
                ("replication", "true"),
                ("application_name", "pgvault"),
            ]))
            .await?;

        loop {
            let msg = framed
                .read_message()
                .await?
                .context("connection closed during authentication")?;
            match msg {
                BeMessage::AuthenticationOk => break,
                BeMessage::AuthenticationCleartextPassword => {
                    let password =
                        password.context("server wants a password but none is configured")?;
                    framed.send(&FeMessage::PasswordMessage(password)).await?;
                }
                BeMessage::AuthenticationMd5Password(salt) => {
                    let password =
                        password.context("server wants a password but none is configured")?;
                    let response = md5_password(user, password, salt);
                    framed.send(&FeMessage::PasswordMessage(&response)).await?;
                }
                BeMessage::AuthenticationSasl(mechanisms) => {
                    bail!(
                        "server demands SASL authentication ({}); only trust, password and md5 are supported",
                        mechanisms.join(",")
                    );
                }
                BeMessage::ErrorResponse(err) => bail!("authentication failed: {err}"),
                _ => {} // NoticeResponse and friends
            }
        }

        // drain parameter status chatter until ReadyForQuery
        loop {
            let msg = framed
                .read_message()
                .await?
                .context("connection closed after authentication")?;
            match msg {
                BeMessage::ReadyForQuery(_) => break,
                BeMessage::ErrorResponse(err) => bail!("session setup failed: {err}"),
                _ => {}
            }
        }

        Ok(ReplicationClient { framed })
    }

    /// Run one simple-protocol command and collect its single result set.
    pub async fn simple_query(&mut self, sql: &str) -> anyhow::Result<QueryResult> {
        self.framed.send(&FeMessage::Query(sql)).await?;
        let mut result = QueryResult::default();
        loop {
            let msg = self
                .framed
                .read_message()
                .await?
                .context("connection closed mid-query")?;
            match msg {
                BeMessage::RowDescription(fields) => result.fields = fields,
                BeMessage::DataRow(cols) => {
                    result.rows.push(
                        cols.into_iter()
                            .map(|col| {
                                col.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                            })
                            .collect(),
                    );
                }
                BeMessage::CommandComplete(_) | BeMessage::EmptyQueryResponse => {}
                BeMessage::ReadyForQuery(_) => return Ok(result),
                BeMessage::ErrorResponse(err) => {
                    // consume the trailing ReadyForQuery before reporting
                    loop {
                        match self.framed.read_message().await? {
                            Some(BeMessage::ReadyForQuery(_)) | None => break,
                            _ => {}
                        }
                    }
                    bail!("query '{sql}' failed: {err}");
                }
                other => bail!("unexpected message {:?} in query response", other.kind()),
            }
        }
    }

    /// IDENTIFY_SYSTEM: (system id, current timeline, current write position).
    pub async fn identify_system(&mut self) -> anyhow::Result<(String, TimeLineID, Lsn)> {
        let result = self.simple_query("IDENTIFY_SYSTEM").await?;
        let systemid = result
            .get(0, 0)
            .context("IDENTIFY_SYSTEM returned no system id")?
            .to_string();
        let tli: TimeLineID = result
            .get(0, 1)
            .context("IDENTIFY_SYSTEM returned no timeline")?
            .parse()
            .context("IDENTIFY_SYSTEM timeline is not a number")?;
        anyhow::ensure!(tli >= 1, "timeline should at least be 1, got {tli}");
        let xlogpos: Lsn = result
            .get(0, 2)
            .context("IDENTIFY_SYSTEM returned no xlogpos")?
            .parse()
            .map_err(|e| anyhow::anyhow!("bad xlogpos: {e:?}"))?;
        Ok((systemid, tli, xlogpos))
    }

    /// READ_REPLICATION_SLOT, available from PG 15. Returns the slot's
    /// restart position and timeline if the slot exists and has them.
    pub async fn read_replication_slot(
        &mut self,
        slot: &str,
    ) -> anyhow::Result<Option<(Lsn, TimeLineID)>> {
        let result = self
            .simple_query(&format!("READ_REPLICATION_SLOT {slot}"))
            .await?;
        let (Some(restart_lsn), Some(restart_tli)) = (result.get(0, 1), result.get(0, 2)) else {
            return Ok(None);
        };
        let lsn: Lsn = restart_lsn
            .parse()
            .map_err(|e| anyhow::anyhow!("bad restart_lsn: {e:?}"))?;
        let tli: TimeLineID = restart_tli.parse().context("bad restart_tli")?;
        Ok(Some((lsn, tli)))
    }

    /// TIMELINE_HISTORY: the history file's name and content.
    pub async fn timeline_history(
        &mut self,
        tli: TimeLineID,
    ) -> anyhow::Result<(String, String)> {
        let result = self.simple_query(&format!("TIMELINE_HISTORY {tli}")).await?;
        let filename = result
            .get(0, 0)
            .context("TIMELINE_HISTORY returned no filename")?
            .to_string();
        let content = result
            .get(0, 1)
            .context("TIMELINE_HISTORY returned no content")?
            .to_string();
        Ok((filename, content))
    }
}

/// Where to begin streaming, in priority order: resume from the WAL already
/// on disk, else ask the replication slot (PG 15+), else the server's
/// current position truncated to a segment boundary.
pub async fn determine_start<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ReplicationClient<S>,
    wal_dir: &Utf8PathBuf,
    slot: &str,
    seg_size: usize,
    pg_version: PgMajorVersion,
) -> anyhow::Result<(TimeLineID, Lsn)> {
    let (_sysid, cur_tli, xlogpos) = client.identify_system().await?;

    if let Some((tli, lsn)) = find_streaming_start(wal_dir, seg_size)? {
        info!("resuming WAL streaming at {lsn} on timeline {tli}");
        return Ok((tli, lsn));
    }

    if pg_version >= PgMajorVersion::V15 {
        match client.read_replication_slot(slot).await {
            Ok(Some((restart_lsn, tli))) => {
                let lsn = restart_lsn.segment_lsn(seg_size);
                info!("starting WAL streaming at slot position {lsn} on timeline {tli}");
                return Ok((tli, lsn));
            }
            Ok(None) => {}
            Err(e) => warn!("READ_REPLICATION_SLOT failed, falling back: {e:#}"),
        }
    }

    let lsn = xlogpos.segment_lsn(seg_size);
    info!("cold-starting WAL streaming at {lsn} on timeline {cur_tli}");
    Ok((cur_tli, lsn))
}

/// Scan the server's WAL directory for the highest segment present. A
/// complete segment resumes at the next one; a partial segment is streamed
/// again from its start.
pub fn find_streaming_start(
    wal_dir: &Utf8PathBuf,
    seg_size: usize,
) -> anyhow::Result<Option<(TimeLineID, Lsn)>> {
    let mut high: Option<(u64, TimeLineID, bool)> = None;
    if !wal_dir.exists() {
        return Ok(None);
    }
    for entry in wal_dir.read_dir_utf8()? {
        let entry = entry?;
        let fname = entry.file_name();
        let ispartial = IsPartialXLogFileName(fname);
        if !ispartial && !IsXLogFileName(fname) {
            continue;
        }
        let base = if ispartial {
            &fname[..fname.len() - ".partial".len()]
        } else {
            fname
        };
        let (segno, tli) = XLogFromFileName(base, seg_size)?;
        let better = match high {
            None => true,
            Some((high_segno, high_tli, high_partial)) => {
                segno > high_segno
                    || (segno == high_segno && tli > high_tli)
                    || (segno == high_segno && tli == high_tli && high_partial && !ispartial)
            }
        };
        if better {
            high = Some((segno, tli, ispartial));
        }
    }
    Ok(high.map(|(segno, tli, ispartial)| {
        let segno = if ispartial { segno } else { segno + 1 };
        (tli, Lsn(segno * seg_size as u64))
    }))
}

/// The open `.partial` segment file plus its duplicates: the optional
/// staging directory copy and the optional live SSH remote.
struct OpenSegment {
    file: tokio::fs::File,
    name: String,
    staging_file: Option<tokio::fs::File>,
    ssh_file: Option<SshWalFile>,
}

/// Owns the local (and duplicated) WAL segment files of one streaming
/// session.
pub struct WalSegmentWriter {
    wal_dir: Utf8PathBuf,
    staging_dir: Option<Utf8PathBuf>,
    storage: Option<GenericRemoteStorage>,
    server_name: String,
    seg_size: usize,
    tli: TimeLineID,
    open: Option<OpenSegment>,
    cancel: CancellationToken,
}

impl WalSegmentWriter {
    pub fn new(
        wal_dir: Utf8PathBuf,
        staging_dir: Option<Utf8PathBuf>,
        storage: Option<GenericRemoteStorage>,
        server_name: String,
        seg_size: usize,
        tli: TimeLineID,
        cancel: CancellationToken,
    ) -> WalSegmentWriter {
        WalSegmentWriter {
            wal_dir,
            staging_dir,
            storage,
            server_name,
            seg_size,
            tli,
            open: None,
            cancel,
        }
    }

    pub fn set_timeline(&mut self, tli: TimeLineID) {
        self.tli = tli;
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Open `<name>.partial`: preallocate to exactly the segment size when
    /// absent, accept an existing preallocated file, refuse anything else.
    async fn open_segment(&mut self, segno: u64) -> anyhow::Result<()> {
        let name = XLogFileName(self.tli, segno, self.seg_size);
        let path = self.wal_dir.join(format!("{name}.partial"));
        tokio::fs::create_dir_all(&self.wal_dir).await?;

        let file = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.len() == self.seg_size as u64 => {
                let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
                file.seek(std::io::SeekFrom::Start(0)).await?;
                file
            }
            Ok(metadata) if metadata.len() != 0 => {
                bail!(
                    "existing WAL file {path} has size {}, expected 0 or {}",
                    metadata.len(),
                    self.seg_size
                );
            }
            _ => {
                let mut file = tokio::fs::File::create(&path).await?;
                let zeros = vec![0u8; 128 * 1024];
                let mut written = 0;
                while written < self.seg_size {
                    let n = std::cmp::min(zeros.len(), self.seg_size - written);
                    file.write_all(&zeros[..n]).await?;
                    written += n;
                }
                file.sync_all().await?;
                file.seek(std::io::SeekFrom::Start(0)).await?;
                file
            }
        };

        let staging_file = match &self.staging_dir {
            Some(dir) => match self.open_staging(dir.clone(), &name).await {
                Ok(file) => Some(file),
                Err(e) => {
                    // staged writes never block the authoritative local write
                    warn!("could not open WAL staging copy for {name}: {e:#}");
                    None
                }
            },
            None => None,
        };

        let ssh_file = match &self.storage {
            Some(GenericRemoteStorage::Ssh(ssh)) => {
                let wal_root = RemotePath::from_string(&format!("{}/wal", self.server_name))?;
                match ssh.wal_open(&wal_root, &name, self.seg_size).await {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!("could not open remote WAL copy for {name}: {e:#}");
                        None
                    }
                }
            }
            _ => None,
        };

        info!("opened WAL segment {name}.partial");
        self.open = Some(OpenSegment {
            file,
            name,
            staging_file,
            ssh_file,
        });
        Ok(())
    }

    async fn open_staging(
        &self,
        dir: Utf8PathBuf,
        name: &str,
    ) -> anyhow::Result<tokio::fs::File> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(tokio::fs::File::create(dir.join(format!("{name}.partial"))).await?)
    }

    /// Write one XLogData payload starting at `start`. The payload may cross
    /// segment boundaries; each boundary seals the finished segment and the
    /// remainder starts the next one.
    pub async fn write(&mut self, start: Lsn, data: &[u8]) -> anyhow::Result<Lsn> {
        let mut xlogptr = start;
        let mut xlogoff = xlogptr.segment_offset(self.seg_size);

        if self.open.is_none() {
            if xlogoff != 0 {
                bail!("received WAL at offset {xlogoff} with no file open");
            }
            self.open_segment(xlogptr.segment_number(self.seg_size)).await?;
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            if self.open.is_none() {
                self.open_segment(xlogptr.segment_number(self.seg_size)).await?;
            }
            // do not write across the segment boundary
            let until_boundary = self.seg_size - xlogoff;
            let n = std::cmp::min(remaining.len(), until_boundary);
            let chunk = &remaining[..n];

            let segment = self.open.as_mut().unwrap();
            segment.file.write_all(chunk).await?;
            if let Some(staging) = &mut segment.staging_file {
                if let Err(e) = staging.write_all(chunk).await {
                    warn!("WAL staging write failed, dropping the copy: {e:#}");
                    segment.staging_file = None;
                }
            }
            if let Some(ssh) = &mut segment.ssh_file {
                if let Err(e) = ssh.write(chunk.to_vec()).await {
                    warn!("remote WAL write failed, dropping the copy: {e:#}");
                    segment.ssh_file = None;
                }
            }

            remaining = &remaining[n..];
            xlogptr += n as u64;
            xlogoff += n;

            if xlogoff == self.seg_size {
                self.seal(false).await?;
                xlogoff = 0;
            }
        }
        Ok(xlogptr)
    }

    /// Close the open segment. A completed segment is fsynced and loses its
    /// `.partial` suffix; an interrupted one keeps it.
    pub async fn seal(&mut self, partial: bool) -> anyhow::Result<()> {
        let Some(segment) = self.open.take() else {
            return Ok(());
        };
        let OpenSegment {
            mut file,
            name,
            staging_file,
            ssh_file,
        } = segment;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let partial_path = self.wal_dir.join(format!("{name}.partial"));
        if !partial {
            let sealed_path = self.wal_dir.join(&name);
            tokio::fs::rename(&partial_path, &sealed_path).await?;
            WAL_SEGMENTS_SEALED.inc();
            info!("sealed WAL segment {name}");
        } else {
            info!("leaving WAL segment {name}.partial in place");
        }

        if let Some(mut staging) = staging_file {
            let _ = staging.flush().await;
            let _ = staging.sync_all().await;
            if !partial {
                if let Some(dir) = &self.staging_dir {
                    let _ = tokio::fs::rename(
                        dir.join(format!("{name}.partial")),
                        dir.join(&name),
                    )
                    .await;
                }
            }
        }
        if let Some(ssh) = ssh_file {
            if let Err(e) = ssh.close(partial).await {
                warn!("closing remote WAL copy failed: {e:#}");
            }
        }

        // Non-SSH storage tiers receive whole sealed segments.
        if !partial {
            if let Some(storage) = &self.storage {
                if !matches!(storage, GenericRemoteStorage::Ssh(_)) {
                    let local = self.wal_dir.join(&name);
                    let remote =
                        RemotePath::from_string(&format!("{}/wal/{name}", self.server_name))?;
                    if let Err(e) = storage.upload(&local, &remote, &self.cancel).await {
                        crate::metrics::STORAGE_ERRORS
                            .with_label_values(&[storage.name()])
                            .inc();
                        warn!("uploading sealed segment {name} failed: {e:#}");
                    }
                }
            }
        }
        Ok(())
    }
}

/// One complete streaming session against a connected server. Returns when
/// cancelled or when the connection fails.
pub async fn stream_wal<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ReplicationClient<S>,
    state: &ProcessState,
    server_name: &str,
    storage: Option<GenericRemoteStorage>,
) -> anyhow::Result<()> {
    let conf = state.conf.server(server_name)?;
    let seg_size = conf.wal_segment_size;
    let wal_dir = state.conf.wal_dir(server_name);
    let pg_version = PgMajorVersion::from_major(conf.pg_version)
        .context("unsupported server version")?;
    let runtime = state
        .server_runtime(server_name)
        .context("unknown server runtime slot")?;
    let cancel = &state.cancel;

    tokio::fs::create_dir_all(&wal_dir).await?;
    let (mut tli, mut start_lsn) =
        determine_start(client, &wal_dir, &conf.slot, seg_size, pg_version).await?;

    let mut writer = WalSegmentWriter::new(
        wal_dir.clone(),
        conf.wal_shipping.clone(),
        storage,
        server_name.to_string(),
        seg_size,
        tli,
        cancel.clone(),
    );

    'timelines: loop {
        if cancel.is_cancelled() {
            break;
        }
        // Fetch the history file of this timeline if we don't have it yet.
        if tli > 1 {
            let history_path = wal_dir.join(TimelineHistoryFileName(tli));
            if !history_path.exists() {
                let (_name, content) = client.timeline_history(tli).await?;
                tokio::fs::write(&history_path, content).await?;
                info!("wrote timeline history file {history_path}");
            }
        }
        writer.set_timeline(tli);

        let cmd = format!(
            "START_REPLICATION SLOT {} PHYSICAL {} TIMELINE {}",
            conf.slot, start_lsn, tli
        );
        info!("starting replication: {cmd}");
        client.framed.send(&FeMessage::Query(&cmd)).await?;

        // wait for the CopyBothResponse
        loop {
            let msg = client
                .framed
                .read_message()
                .await?
                .context("connection closed awaiting CopyBothResponse")?;
            match msg {
                BeMessage::CopyBothResponse => break,
                BeMessage::ErrorResponse(err) => bail!("START_REPLICATION failed: {err}"),
                _ => {}
            }
        }

        let mut xlogptr = start_lsn;
        // stream this timeline's WAL
        loop {
            if cancel.is_cancelled() {
                // Graceful stop: tell the server, seal what we have as
                // partial, and leave.
                client.framed.send(&FeMessage::CopyDone).await?;
                writer.seal(true).await?;
                break 'timelines;
            }
            let msg = tokio::select! {
                msg = client.framed.read_message() => msg?,
                _ = cancel.cancelled() => continue,
            };
            let Some(msg) = msg else {
                writer.seal(true).await?;
                bail!("replication connection closed unexpectedly");
            };
            match msg {
                BeMessage::CopyData(mut payload) => match payload.first().copied() {
                    Some(pq_proto::XLOG_DATA_TAG) => {
                        let header = XLogDataHeader::parse(&mut payload)?;
                        WAL_BYTES_RECEIVED.inc_by(payload.len() as u64);
                        xlogptr = writer.write(Lsn(header.wal_start), &payload).await?;
                        runtime.update_wal_lsn(xlogptr);
                        send_status_update(client, xlogptr).await?;
                    }
                    Some(pq_proto::KEEPALIVE_TAG) => {
                        let _keepalive = PrimaryKeepalive::parse(&mut payload)?;
                        runtime.update_wal_lsn(xlogptr);
                        send_status_update(client, xlogptr).await?;
                    }
                    other => bail!("unrecognized CopyData type {other:?}"),
                },
                BeMessage::CopyDone => {
                    // Timeline switch: acknowledge, and the segment is
                    // complete as far as this timeline is concerned.
                    client.framed.send(&FeMessage::CopyDone).await?;
                    if writer.is_open() {
                        writer.seal(false).await?;
                    }
                    break;
                }
                BeMessage::ErrorResponse(err) => {
                    writer.seal(true).await?;
                    bail!("replication stream error: {err}");
                }
                _ => {}
            }
        }

        // After CopyDone the server reports the next timeline and the switch
        // position in a DataRow, then CommandComplete and ReadyForQuery.
        let mut next: Option<(TimeLineID, Lsn)> = None;
        loop {
            let msg = client
                .framed
                .read_message()
                .await?
                .context("connection closed at end of timeline")?;
            match msg {
                BeMessage::DataRow(cols) => {
                    let tli_text = cols
                        .first()
                        .and_then(|c| c.as_ref())
                        .context("end-of-timeline row has no timeline")?;
                    let pos_text = cols
                        .get(1)
                        .and_then(|c| c.as_ref())
                        .context("end-of-timeline row has no position")?;
                    let next_tli: TimeLineID =
                        String::from_utf8_lossy(tli_text).trim().parse()?;
                    let next_lsn: Lsn = String::from_utf8_lossy(pos_text)
                        .parse()
                        .map_err(|e| anyhow::anyhow!("bad switch position: {e:?}"))?;
                    next = Some((next_tli, next_lsn.segment_lsn(seg_size)));
                }
                BeMessage::ReadyForQuery(_) => break,
                BeMessage::ErrorResponse(err) => bail!("end-of-timeline report failed: {err}"),
                _ => {}
            }
        }
        let (next_tli, next_lsn) = next.context("server ended timeline without a successor")?;
        info!("timeline switch: {tli} -> {next_tli} at {next_lsn}");
        tli = next_tli;
        start_lsn = next_lsn;
    }

    Ok(())
}

async fn send_status_update<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ReplicationClient<S>,
    lsn: Lsn,
) -> anyhow::Result<()> {
    let update = StandbyStatusUpdate {
        write_lsn: lsn.0,
        flush_lsn: lsn.0,
        apply_lsn: 0,
        timestamp: get_current_timestamp(),
        reply_requested: false,
    };
    client
        .framed
        .send(&FeMessage::CopyData(&update.encode()))
        .await?;
    Ok(())
}

/// Supervisor: keep one streaming session per server alive, reconnecting
/// with backoff until shutdown.
pub async fn run_for_server(
    state: Arc<ProcessState>,
    server_name: String,
    storage: Option<GenericRemoteStorage>,
) {
    let span = info_span!("wal_receiver", server = %server_name);
    async {
        let runtime = match state.server_runtime(&server_name) {
            Some(runtime) => runtime,
            None => {
                error!("no runtime slot for server");
                return;
            }
        };
        let mut attempt = 0u32;
        while !state.cancel.is_cancelled() {
            runtime
                .wal_streaming
                .store(true, std::sync::atomic::Ordering::SeqCst);
            let conf = match state.conf.server(&server_name) {
                Ok(conf) => conf,
                Err(e) => {
                    error!("{e:#}");
                    break;
                }
            };
            let result = async {
                let mut client = ReplicationClient::connect(conf).await?;
                stream_wal(&mut client, &state, &server_name, storage.clone()).await
            }
            .await;
            runtime
                .wal_streaming
                .store(false, std::sync::atomic::Ordering::SeqCst);
            match result {
                Ok(()) => break,
                Err(e) => {
                    if state.cancel.is_cancelled() {
                        break;
                    }
                    warn!("WAL streaming failed, will reconnect: {e:#}");
                    attempt = attempt.saturating_add(1);
                    backoff::exponential_backoff(attempt, 0.5, 30.0, &state.cancel).await;
                }
            }
        }
        info!("WAL receiver exiting");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio::io::AsyncWriteExt as _;

    const SEG: usize = 64 * 1024;

    fn writer(dir: &camino_tempfile::Utf8TempDir) -> WalSegmentWriter {
        WalSegmentWriter::new(
            dir.path().join("wal"),
            None,
            None,
            "srv".to_string(),
            SEG,
            1,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn segment_lifecycle_and_boundary_split() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut w = writer(&dir);

        // fill most of segment 5, then cross into segment 6
        let start = Lsn(5 * SEG as u64);
        let end = w.write(start, &vec![0xAA; SEG - 100]).await.unwrap();
        assert_eq!(end, start + (SEG as u64 - 100));
        assert!(dir.path().join("wal/000000010000000000000005.partial").exists());

        let end = w.write(end, &vec![0xBB; 300]).await.unwrap();
        assert_eq!(end, Lsn(6 * SEG as u64 + 200));

        // segment 5 sealed with the full size, segment 6 still partial
        let sealed = dir.path().join("wal/000000010000000000000005");
        assert_eq!(std::fs::metadata(&sealed).unwrap().len(), SEG as u64);
        assert!(dir.path().join("wal/000000010000000000000006.partial").exists());
        let sealed_bytes = std::fs::read(&sealed).unwrap();
        assert_eq!(sealed_bytes[SEG - 100], 0xBB);
        assert_eq!(sealed_bytes[SEG - 101], 0xAA);

        // shutdown: the in-progress segment keeps its .partial name
        w.seal(true).await.unwrap();
        assert!(dir.path().join("wal/000000010000000000000006.partial").exists());
        assert!(!dir.path().join("wal/000000010000000000000006").exists());
    }

    #[tokio::test]
    async fn mid_segment_start_without_open_file_is_refused() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut w = writer(&dir);
        assert!(w.write(Lsn(12345), b"data").await.is_err());
    }

    #[test]
    fn streaming_start_resume_rules() {
        let dir = camino_tempfile::tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        std::fs::create_dir_all(&wal_dir).unwrap();

        // nothing on disk yet
        assert_eq!(find_streaming_start(&wal_dir, SEG).unwrap(), None);

        // one complete segment: resume at the next one
        std::fs::write(wal_dir.join("000000010000000000000005"), b"").unwrap();
        let (tli, lsn) = find_streaming_start(&wal_dir, SEG).unwrap().unwrap();
        assert_eq!((tli, lsn), (1, Lsn(6 * SEG as u64)));

        // a higher partial segment: restart that segment from its start
        std::fs::write(wal_dir.join("000000010000000000000007.partial"), b"").unwrap();
        let (tli, lsn) = find_streaming_start(&wal_dir, SEG).unwrap().unwrap();
        assert_eq!((tli, lsn), (1, Lsn(7 * SEG as u64)));

        // junk is ignored
        std::fs::write(wal_dir.join("notawalfile"), b"").unwrap();
        find_streaming_start(&wal_dir, SEG).unwrap().unwrap();
    }

    /// Scripted server: authentication, IDENTIFY_SYSTEM, then a CopyBoth
    /// session delivering one segment of WAL and a keepalive before shutdown.
    #[tokio::test]
    async fn handshake_and_simple_query() {
        let (client_io, mut server_io) = tokio::io::duplex(256 * 1024);

        let server = tokio::spawn(async move {
            let mut buf = BytesMut::new();

            // consume the startup packet (length-prefixed, no tag byte)
            let mut len4 = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut len4)
                .await
                .unwrap();
            let startup_len = u32::from_be_bytes(len4) as usize - 4;
            let mut startup = vec![0u8; startup_len];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut startup)
                .await
                .unwrap();

            // md5 challenge, then Ok + ReadyForQuery
            buf.put_u8(b'R');
            buf.put_u32(12);
            buf.put_u32(5);
            buf.put_slice(&[1, 2, 3, 4]);
            server_io.write_all(&buf).await.unwrap();
            buf.clear();

            // read the password message (tag 'p')
            let mut pw = vec![0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut pw)
                .await
                .unwrap();
            assert_eq!(pw[0], b'p');
            let len = u32::from_be_bytes(pw[1..5].try_into().unwrap()) as usize - 4;
            let mut pw_body = vec![0u8; len];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut pw_body)
                .await
                .unwrap();
            assert!(pw_body.starts_with(b"md5"));

            buf.put_u8(b'R');
            buf.put_u32(8);
            buf.put_u32(0);
            buf.put_u8(b'Z');
            buf.put_u32(5);
            buf.put_u8(b'I');
            server_io.write_all(&buf).await.unwrap();
            buf.clear();

            // IDENTIFY_SYSTEM arrives as a Query message; skip reading its text
            let mut hdr = vec![0u8; 5];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut hdr)
                .await
                .unwrap();
            assert_eq!(hdr[0], b'Q');
            let qlen = u32::from_be_bytes(hdr[1..5].try_into().unwrap()) as usize - 4;
            let mut q = vec![0u8; qlen];
            tokio::io::AsyncReadExt::read_exact(&mut server_io, &mut q)
                .await
                .unwrap();
            assert!(q.starts_with(b"IDENTIFY_SYSTEM"));

            // RowDescription with 4 fields
            let mut body = BytesMut::new();
            body.put_u16(4);
            for name in ["systemid", "timeline", "xlogpos", "dbname"] {
                body.put_slice(name.as_bytes());
                body.put_u8(0);
                body.put_slice(&[0u8; 18]);
            }
            buf.put_u8(b'T');
            buf.put_u32(4 + body.len() as u32);
            buf.put_slice(&body);

            // DataRow
            let mut body = BytesMut::new();
            body.put_u16(4);
            for value in ["7365112183763249", "2", "5/5000000"] {
                body.put_i32(value.len() as i32);
                body.put_slice(value.as_bytes());
            }
            body.put_i32(-1);
            buf.put_u8(b'D');
            buf.put_u32(4 + body.len() as u32);
            buf.put_slice(&body);

            buf.put_u8(b'C');
            buf.put_u32(4 + "IDENTIFY_SYSTEM\0".len() as u32);
            buf.put_slice(b"IDENTIFY_SYSTEM\0");
            buf.put_u8(b'Z');
            buf.put_u32(5);
            buf.put_u8(b'I');
            server_io.write_all(&buf).await.unwrap();
        });

        let mut client = ReplicationClient::handshake(client_io, "repl", Some("secret"))
            .await
            .unwrap();
        let (systemid, tli, xlogpos) = client.identify_system().await.unwrap();
        assert_eq!(systemid, "7365112183763249");
        assert_eq!(tli, 2);
        assert_eq!(xlogpos, Lsn(0x5_0500_0000));
        server.await.unwrap();
    }

    #[test]
    fn literals_are_quoted() {
        use pq_proto::quote_literal;
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
