//!
//! The management wire protocol: length-prefixed JSON envelopes between the
//! control CLI and the daemon.
//!
//! An envelope has `Header`, `Request`, `Response` and `Outcome` sections.
//! The JSON body is optionally gzip-compressed, then optionally
//! AES-encrypted, then base64-encoded whenever either of the header's
//! `Compression`/`Encryption` bytes is non-zero; those two bytes travel in
//! the first two bytes of the frame so the peer knows how to unwrap the
//! rest.
//!

use std::io::{Read, Write};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use utils::crypto::{self, AesMode};

/// Management error codes. One number per failure site, and unlike the
/// obvious temptation, no two commands share a number.
pub mod err {
    pub const BAD_PAYLOAD: i32 = 1;
    pub const UNKNOWN_COMMAND: i32 = 2;
    pub const ALLOCATION: i32 = 3;

    pub const BACKUP_INVALID: i32 = 100;
    pub const BACKUP_WAL: i32 = 101;
    pub const BACKUP_ACTIVE: i32 = 102;
    pub const BACKUP_NOBACKUPS: i32 = 103;
    pub const BACKUP_NOCHILD: i32 = 104;
    pub const BACKUP_ALREADYCHILD: i32 = 105;
    pub const BACKUP_SETUP: i32 = 106;
    pub const BACKUP_EXECUTE: i32 = 107;
    pub const BACKUP_TEARDOWN: i32 = 108;
    pub const BACKUP_NETWORK: i32 = 109;
    pub const BACKUP_OFFLINE: i32 = 110;
    pub const BACKUP_NOSERVER: i32 = 111;
    pub const BACKUP_ERROR: i32 = 112;
    pub const BACKUP_NOFORK: i32 = 113;

    pub const RESTORE_NOBACKUP: i32 = 600;
    pub const RESTORE_NODISK: i32 = 601;
    pub const RESTORE_NOSERVER: i32 = 602;
    pub const RESTORE_SETUP: i32 = 603;
    pub const RESTORE_EXECUTE: i32 = 604;
    pub const RESTORE_TEARDOWN: i32 = 605;

    pub const VERIFY_NOBACKUP: i32 = 700;
    pub const VERIFY_EXECUTE: i32 = 701;

    pub const DELETE_NOSERVER: i32 = 403;
    pub const DELETE_ERROR: i32 = 406;
    pub const DELETE_RETAINED: i32 = 407;

    pub const RETAIN_NOBACKUP: i32 = 800;
    pub const RETAIN_ALREADY: i32 = 801;
    pub const EXPUNGE_NOBACKUP: i32 = 810;
    pub const EXPUNGE_NOTRETAINED: i32 = 811;

    pub const INFO_NOBACKUP: i32 = 900;
    pub const ANNOTATE_ERROR: i32 = 910;
}

/// Command numbers carried in `Header.Command`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Command {
    Backup = 1,
    Restore = 2,
    Archive = 3,
    Verify = 4,
    Delete = 5,
    Retain = 6,
    Expunge = 7,
    Info = 8,
    Annotate = 9,
    ListBackup = 10,
    Status = 11,
    StatusDetails = 12,
    Ping = 13,
    Reload = 14,
}

impl Command {
    pub fn from_i32(v: i32) -> Option<Command> {
        Some(match v {
            1 => Command::Backup,
            2 => Command::Restore,
            3 => Command::Archive,
            4 => Command::Verify,
            5 => Command::Delete,
            6 => Command::Retain,
            7 => Command::Expunge,
            8 => Command::Info,
            9 => Command::Annotate,
            10 => Command::ListBackup,
            11 => Command::Status,
            12 => Command::StatusDetails,
            13 => Command::Ping,
            14 => Command::Reload,
            _ => return None,
        })
    }
}

/// Compression byte values.
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_GZIP: u8 = 1;

/// Encryption byte values; the value selects both key size and mode.
pub const ENCRYPTION_NONE: u8 = 0;
pub const ENCRYPTION_AES256_CBC: u8 = 1;
pub const ENCRYPTION_AES192_CBC: u8 = 2;
pub const ENCRYPTION_AES128_CBC: u8 = 3;
pub const ENCRYPTION_AES256_CTR: u8 = 4;
pub const ENCRYPTION_AES192_CTR: u8 = 5;
pub const ENCRYPTION_AES128_CTR: u8 = 6;

fn encryption_params(encryption: u8) -> anyhow::Result<(usize, AesMode)> {
    Ok(match encryption {
        ENCRYPTION_AES256_CBC => (32, AesMode::Cbc),
        ENCRYPTION_AES192_CBC => (24, AesMode::Cbc),
        ENCRYPTION_AES128_CBC => (16, AesMode::Cbc),
        ENCRYPTION_AES256_CTR => (32, AesMode::Ctr),
        ENCRYPTION_AES192_CTR => (24, AesMode::Ctr),
        ENCRYPTION_AES128_CTR => (16, AesMode::Ctr),
        other => anyhow::bail!("unknown encryption byte {other}"),
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Header {
    #[serde(rename = "Command")]
    pub command: i32,
    #[serde(rename = "ClientVersion")]
    pub client_version: String,
    #[serde(rename = "Output")]
    pub output: u8,
    /// YYYYMMDDHHMMSS
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Compression")]
    pub compression: u8,
    #[serde(rename = "Encryption")]
    pub encryption: u8,
}

impl Header {
    pub fn new(command: Command, compression: u8, encryption: u8) -> Header {
        Header {
            command: command as i32,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            output: 0,
            timestamp: chrono::Utc::now().format("%Y%m%d%H%M%S").to_string(),
            compression,
            encryption,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "Header")]
    pub header: Header,
    #[serde(rename = "Request", default, skip_serializing_if = "Value::is_null")]
    pub request: Value,
    #[serde(rename = "Response", default, skip_serializing_if = "Value::is_null")]
    pub response: Value,
    #[serde(rename = "Outcome", default, skip_serializing_if = "Value::is_null")]
    pub outcome: Value,
}

impl Envelope {
    pub fn request(command: Command, request: Value) -> Envelope {
        Envelope {
            header: Header::new(command, COMPRESSION_NONE, ENCRYPTION_NONE),
            request,
            response: Value::Null,
            outcome: Value::Null,
        }
    }

    /// The canonical failure shape shown to operators.
    pub fn failure(command: Command, code: i32, workflow: Option<&str>) -> Envelope {
        Envelope {
            header: Header::new(command, COMPRESSION_NONE, ENCRYPTION_NONE),
            request: Value::Null,
            response: Value::Null,
            outcome: serde_json::json!({
                "status": false,
                "error": code,
                "workflow": workflow,
            }),
        }
    }

    pub fn success(command: Command, response: Value) -> Envelope {
        Envelope {
            header: Header::new(command, COMPRESSION_NONE, ENCRYPTION_NONE),
            request: Value::Null,
            response,
            outcome: serde_json::json!({ "status": true }),
        }
    }
}

/// Frame an envelope: 2 bytes of wrap flags, then the (possibly gzipped,
/// encrypted, base64ed) JSON body, all behind a u32 length prefix.
pub fn encode_envelope(envelope: &Envelope, key: Option<&[u8]>) -> anyhow::Result<Vec<u8>> {
    let compression = envelope.header.compression;
    let encryption = envelope.header.encryption;
    let mut body = serde_json::to_vec(envelope)?;

    if compression == COMPRESSION_GZIP {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&body)?;
        body = encoder.finish()?;
    } else if compression != COMPRESSION_NONE {
        anyhow::bail!("unknown compression byte {compression}");
    }

    if encryption != ENCRYPTION_NONE {
        let key = key.context("encryption requested but no key configured")?;
        let (key_len, mode) = encryption_params(encryption)?;
        anyhow::ensure!(
            key.len() == key_len,
            "configured key has {} bytes, encryption byte {encryption} wants {key_len}",
            key.len()
        );
        body = crypto::encrypt(&body, key, mode)?;
    }

    if compression != COMPRESSION_NONE || encryption != ENCRYPTION_NONE {
        body = base64::encode(&body).into_bytes();
    }

    let mut frame = Vec::with_capacity(4 + 2 + body.len());
    frame.extend_from_slice(&(2 + body.len() as u32).to_be_bytes());
    frame.push(compression);
    frame.push(encryption);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Inverse of [`encode_envelope`], minus the length prefix (already consumed
/// by the framing reader).
pub fn decode_envelope(frame: &[u8], key: Option<&[u8]>) -> anyhow::Result<Envelope> {
    anyhow::ensure!(frame.len() >= 2, "management frame too short");
    let compression = frame[0];
    let encryption = frame[1];
    let mut body = frame[2..].to_vec();

    if compression != COMPRESSION_NONE || encryption != ENCRYPTION_NONE {
        body = base64::decode(&body).context("management frame is not valid base64")?;
    }

    if encryption != ENCRYPTION_NONE {
        let key = key.context("encrypted envelope but no key configured")?;
        let (key_len, mode) = encryption_params(encryption)?;
        anyhow::ensure!(
            key.len() == key_len,
            "configured key has {} bytes, encryption byte {encryption} wants {key_len}",
            key.len()
        );
        body = crypto::decrypt(&body, key, mode)?;
    }

    if compression == COMPRESSION_GZIP {
        let mut decoder = flate2::read::GzDecoder::new(body.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        body = out;
    }

    Ok(serde_json::from_slice(&body)?)
}

pub async fn write_envelope<S: AsyncWrite + Unpin>(
    stream: &mut S,
    envelope: &Envelope,
    key: Option<&[u8]>,
) -> anyhow::Result<()> {
    let frame = encode_envelope(envelope, key)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_envelope<S: AsyncRead + Unpin>(
    stream: &mut S,
    key: Option<&[u8]>,
) -> anyhow::Result<Envelope> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    anyhow::ensure!(len <= 64 * 1024 * 1024, "management frame of {len} bytes");
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    decode_envelope(&frame, key)
}

//
// Request dispatch for the catalog-level commands. Backup/restore/archive
// are long-running workflows owned by the daemon's per-server tasks; the
// commands handled here run inline against the catalog.
//

use crate::catalog::{Catalog, CatalogError};

fn backup_json(backup: &crate::catalog::Backup) -> Value {
    serde_json::json!({
        "label": backup.label,
        "valid": backup.valid,
        "type": backup.backup_type.to_string(),
        "parent": backup.parent,
        "keep": backup.keep,
        "wal": backup.wal,
        "backup_size": backup.backup_size,
        "restore_size": backup.restore_size,
        "start_lsn": backup.start_lsn.to_string(),
        "end_lsn": backup.end_lsn.to_string(),
        "major_version": backup.major_version,
        "comments": backup.comments,
    })
}

fn catalog_code(command: Command, e: &CatalogError) -> i32 {
    match (command, e) {
        (_, CatalogError::BackupNotFound(_)) => match command {
            Command::Retain => err::RETAIN_NOBACKUP,
            Command::Expunge => err::EXPUNGE_NOBACKUP,
            Command::Info => err::INFO_NOBACKUP,
            Command::Delete => err::DELETE_ERROR,
            _ => err::BACKUP_NOBACKUPS,
        },
        (_, CatalogError::AlreadyRetained(_)) => err::RETAIN_ALREADY,
        (_, CatalogError::NotRetained(_)) => err::EXPUNGE_NOTRETAINED,
        (_, CatalogError::Retained(_)) => err::DELETE_RETAINED,
        _ => err::BACKUP_ERROR,
    }
}

/// Handle one inline management request against a server's catalog.
pub fn handle_catalog_request(catalog: &Catalog, envelope: &Envelope) -> Envelope {
    let Some(command) = Command::from_i32(envelope.header.command) else {
        return Envelope::failure(Command::Ping, err::UNKNOWN_COMMAND, None);
    };
    let ident = envelope
        .request
        .get("backup")
        .and_then(Value::as_str)
        .unwrap_or("newest");

    let result: Result<Value, (i32, String)> = match command {
        Command::Ping => Ok(serde_json::json!({ "pong": true })),
        Command::ListBackup => catalog
            .scan()
            .map(|backups| Value::Array(backups.iter().map(backup_json).collect()))
            .map_err(|e| (err::BACKUP_ERROR, e.to_string())),
        Command::Info => catalog
            .resolve(ident, true)
            .map(|b| backup_json(&b))
            .map_err(|e| (catalog_code(command, &e), e.to_string())),
        Command::Retain => catalog
            .resolve(ident, true)
            .and_then(|b| catalog.retain(&b.label))
            .map(|_| Value::Null)
            .map_err(|e| (catalog_code(command, &e), e.to_string())),
        Command::Expunge => catalog
            .resolve(ident, true)
            .and_then(|b| catalog.expunge(&b.label))
            .map(|_| Value::Null)
            .map_err(|e| (catalog_code(command, &e), e.to_string())),
        Command::Delete => {
            let force = envelope
                .request
                .get("force")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            catalog
                .resolve(ident, true)
                .and_then(|b| catalog.delete(&b.label, force))
                .map(|_| Value::Null)
                .map_err(|e| (catalog_code(command, &e), e.to_string()))
        }
        Command::Annotate => {
            let key = envelope.request.get("key").and_then(Value::as_str);
            let value = envelope
                .request
                .get("comment")
                .and_then(Value::as_str)
                .unwrap_or("");
            match key {
                None => Err((err::BAD_PAYLOAD, "annotate needs a key".to_string())),
                Some(key) => catalog
                    .resolve(ident, true)
                    .and_then(|b| catalog.annotate(&b.label, key, value))
                    .map(|_| Value::Null)
                    .map_err(|e| (err::ANNOTATE_ERROR, e.to_string())),
            }
        }
        _ => Err((
            err::UNKNOWN_COMMAND,
            format!("command {command:?} is not an inline catalog command"),
        )),
    };

    match result {
        Ok(response) => Envelope::success(command, response),
        Err((code, message)) => {
            tracing::warn!("management command {command:?} failed: {message}");
            Envelope::failure(command, code, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::request(
            Command::Info,
            serde_json::json!({ "backup": "20250101000000" }),
        )
    }

    #[test]
    fn plain_round_trip() {
        let envelope = sample();
        let frame = encode_envelope(&envelope, None).unwrap();
        let decoded = decode_envelope(&frame[4..], None).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn compressed_and_encrypted_round_trip() {
        let key = vec![9u8; 32];
        for (compression, encryption) in [
            (COMPRESSION_GZIP, ENCRYPTION_NONE),
            (COMPRESSION_NONE, ENCRYPTION_AES256_CBC),
            (COMPRESSION_GZIP, ENCRYPTION_AES256_CTR),
        ] {
            let mut envelope = sample();
            envelope.header.compression = compression;
            envelope.header.encryption = encryption;
            let frame = encode_envelope(&envelope, Some(&key)).unwrap();
            // the wrapped body must be base64 (printable)
            assert!(frame[6..].iter().all(|b| b.is_ascii()));
            let decoded = decode_envelope(&frame[4..], Some(&key)).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn wrong_key_size_is_refused() {
        let mut envelope = sample();
        envelope.header.encryption = ENCRYPTION_AES128_CBC;
        assert!(encode_envelope(&envelope, Some(&[0u8; 32])).is_err());
        assert!(encode_envelope(&envelope, None).is_err());
    }

    #[tokio::test]
    async fn async_framing_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let envelope = sample();
        write_envelope(&mut a, &envelope, None).await.unwrap();
        let decoded = read_envelope(&mut b, None).await.unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn dispatch_against_catalog() {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("backup"));
        let mut backup = crate::catalog::Backup::new_full("20250101000000".to_string());
        backup.valid = true;
        backup.wal = "000000010000000000000001".to_string();
        catalog.write_info(&backup).unwrap();

        // ping
        let reply = handle_catalog_request(&catalog, &Envelope::request(Command::Ping, Value::Null));
        assert_eq!(reply.outcome["status"], Value::Bool(true));

        // info resolves the backup
        let reply = handle_catalog_request(
            &catalog,
            &Envelope::request(Command::Info, serde_json::json!({ "backup": "2025" })),
        );
        assert_eq!(reply.response["label"], "20250101000000");

        // retain twice: second fails with the retain-specific code
        let retain = Envelope::request(Command::Retain, serde_json::json!({ "backup": "newest" }));
        let reply = handle_catalog_request(&catalog, &retain);
        assert_eq!(reply.outcome["status"], Value::Bool(true));
        let reply = handle_catalog_request(&catalog, &retain);
        assert_eq!(reply.outcome["status"], Value::Bool(false));
        assert_eq!(reply.outcome["error"], err::RETAIN_ALREADY);

        // delete refused while retained, forced delete works
        let delete = Envelope::request(Command::Delete, serde_json::json!({ "backup": "newest" }));
        let reply = handle_catalog_request(&catalog, &delete);
        assert_eq!(reply.outcome["error"], err::DELETE_RETAINED);
        let force = Envelope::request(
            Command::Delete,
            serde_json::json!({ "backup": "newest", "force": true }),
        );
        let reply = handle_catalog_request(&catalog, &force);
        assert_eq!(reply.outcome["status"], Value::Bool(true));
    }
}
