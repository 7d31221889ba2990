//! Postgres protocol messages serialization-deserialization, seen from the
//! client side: the messages a replication client sends (startup, queries,
//! copy-data, standby status updates) and the messages it receives back
//! (authentication, row data, CopyBoth traffic).
//!
//! Defines the messages as Rust structs; the buffered framing lives in
//! [`framed`].

pub mod framed;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;

/// The protocol version number 3.0.
pub const PG_PROTOCOL_VERSION: u32 = 0x0003_0000;

/// Postgres protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Invalid packet was received from the server (e.g. unexpected message
    /// type or broken len).
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Failed to parse or, (unlikely), serialize a protocol message.
    #[error("Message parse error: {0}")]
    BadMessage(String),
}

/// A message received from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password([u8; 4]),
    /// SASL mechanisms advertised by the server.
    AuthenticationSasl(Vec<String>),
    BackendKeyData {
        pid: u32,
        key: u32,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForQuery(u8),
    RowDescription(Vec<String>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    CopyBothResponse,
    CopyOutResponse,
    CopyInResponse,
    CopyData(Bytes),
    CopyDone,
    /// Only ever seen when proxying; a server never sends this itself.
    CopyFail(String),
    ErrorResponse(ErrorInfo),
    NoticeResponse(String),
    EmptyQueryResponse,
}

impl BeMessage {
    /// The tag byte this message arrived with.
    pub fn kind(&self) -> u8 {
        match self {
            BeMessage::AuthenticationOk
            | BeMessage::AuthenticationCleartextPassword
            | BeMessage::AuthenticationMd5Password(_)
            | BeMessage::AuthenticationSasl(_) => b'R',
            BeMessage::BackendKeyData { .. } => b'K',
            BeMessage::ParameterStatus { .. } => b'S',
            BeMessage::ReadyForQuery(_) => b'Z',
            BeMessage::RowDescription(_) => b'T',
            BeMessage::DataRow(_) => b'D',
            BeMessage::CommandComplete(_) => b'C',
            BeMessage::CopyBothResponse => b'W',
            BeMessage::CopyOutResponse => b'H',
            BeMessage::CopyInResponse => b'G',
            BeMessage::CopyData(_) => b'd',
            BeMessage::CopyDone => b'c',
            BeMessage::CopyFail(_) => b'f',
            BeMessage::ErrorResponse(_) => b'E',
            BeMessage::NoticeResponse(_) => b'N',
            BeMessage::EmptyQueryResponse => b'I',
        }
    }

    /// Try to parse one complete message out of `buf`. Returns None if the
    /// buffer doesn't hold a full message yet; consumes the message otherwise.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<BeMessage>, ProtocolError> {
        // All server messages are tag byte + i32 length (length includes
        // itself but not the tag).
        if buf.len() < 5 {
            return Ok(None);
        }
        let tag = buf[0];
        let len = (&buf[1..5]).get_u32();
        if len < 4 {
            return Err(ProtocolError::Protocol(format!(
                "invalid message length {len} for tag {tag}"
            )));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            // Fast path for huge CopyData: preallocate the rest.
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut msg = buf.split_to(total).freeze();
        msg.advance(5); // tag + length
        let body = msg;

        let result = match tag {
            b'R' => parse_authentication(body)?,
            b'K' => {
                let mut body = body;
                ensure_len(&body, 8, "BackendKeyData")?;
                BeMessage::BackendKeyData {
                    pid: body.get_u32(),
                    key: body.get_u32(),
                }
            }
            b'S' => {
                let mut body = body;
                let name = get_cstring(&mut body, "ParameterStatus.name")?;
                let value = get_cstring(&mut body, "ParameterStatus.value")?;
                BeMessage::ParameterStatus { name, value }
            }
            b'Z' => {
                let mut body = body;
                ensure_len(&body, 1, "ReadyForQuery")?;
                BeMessage::ReadyForQuery(body.get_u8())
            }
            b'T' => parse_row_description(body)?,
            b'D' => parse_data_row(body)?,
            b'C' => {
                let mut body = body;
                BeMessage::CommandComplete(get_cstring(&mut body, "CommandComplete")?)
            }
            b'W' => BeMessage::CopyBothResponse,
            b'H' => BeMessage::CopyOutResponse,
            b'G' => BeMessage::CopyInResponse,
            b'd' => BeMessage::CopyData(body),
            b'c' => BeMessage::CopyDone,
            b'f' => {
                let mut body = body;
                BeMessage::CopyFail(get_cstring(&mut body, "CopyFail")?)
            }
            b'E' => BeMessage::ErrorResponse(ErrorInfo::parse(body)?),
            b'N' => {
                let info = ErrorInfo::parse(body)?;
                BeMessage::NoticeResponse(info.message)
            }
            b'I' => BeMessage::EmptyQueryResponse,
            other => {
                return Err(ProtocolError::Protocol(format!(
                    "unexpected message kind {:?}",
                    char::from(other)
                )))
            }
        };
        Ok(Some(result))
    }
}

fn ensure_len(buf: &Bytes, len: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < len {
        return Err(ProtocolError::BadMessage(format!(
            "{context}: need {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(())
}

fn get_cstring(buf: &mut Bytes, context: &str) -> Result<String, ProtocolError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::BadMessage(format!("{context}: unterminated string")))?;
    let s = buf.split_to(pos);
    buf.advance(1); // NUL
    String::from_utf8(s.to_vec())
        .map_err(|e| ProtocolError::BadMessage(format!("{context}: {e}")))
}

fn parse_authentication(mut body: Bytes) -> Result<BeMessage, ProtocolError> {
    ensure_len(&body, 4, "Authentication")?;
    match body.get_u32() {
        0 => Ok(BeMessage::AuthenticationOk),
        3 => Ok(BeMessage::AuthenticationCleartextPassword),
        5 => {
            ensure_len(&body, 4, "AuthenticationMD5Password")?;
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&body[..4]);
            Ok(BeMessage::AuthenticationMd5Password(salt))
        }
        10 => {
            let mut mechanisms = Vec::new();
            loop {
                let mech = get_cstring(&mut body, "AuthenticationSASL")?;
                if mech.is_empty() {
                    break;
                }
                mechanisms.push(mech);
            }
            Ok(BeMessage::AuthenticationSasl(mechanisms))
        }
        other => Err(ProtocolError::Protocol(format!(
            "unsupported authentication request {other}"
        ))),
    }
}

fn parse_row_description(mut body: Bytes) -> Result<BeMessage, ProtocolError> {
    ensure_len(&body, 2, "RowDescription")?;
    let nfields = body.get_u16();
    let mut names = Vec::with_capacity(nfields as usize);
    for _ in 0..nfields {
        names.push(get_cstring(&mut body, "RowDescription.field")?);
        // table oid, attnum, type oid, typlen, atttypmod, format
        ensure_len(&body, 18, "RowDescription.field")?;
        body.advance(18);
    }
    Ok(BeMessage::RowDescription(names))
}

fn parse_data_row(mut body: Bytes) -> Result<BeMessage, ProtocolError> {
    ensure_len(&body, 2, "DataRow")?;
    let ncols = body.get_u16();
    let mut cols = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        ensure_len(&body, 4, "DataRow.column")?;
        let len = body.get_i32();
        if len < 0 {
            cols.push(None);
        } else {
            ensure_len(&body, len as usize, "DataRow.column")?;
            cols.push(Some(body.split_to(len as usize)));
        }
    }
    Ok(BeMessage::DataRow(cols))
}

/// The interesting fields of an ErrorResponse / NoticeResponse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    fn parse(mut body: Bytes) -> Result<ErrorInfo, ProtocolError> {
        let mut info = ErrorInfo::default();
        loop {
            if body.is_empty() {
                break;
            }
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let value = get_cstring(&mut body, "ErrorResponse.field")?;
            match field {
                b'S' => info.severity = value,
                b'C' => info.code = value,
                b'M' => info.message = value,
                _ => {} // uninteresting field
            }
        }
        Ok(info)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

/// A message this client sends to the server.
#[derive(Debug)]
pub enum FeMessage<'a> {
    /// Startup packet; parameters typically carry user, database=replication
    /// selection and `replication=true`.
    StartupMessage(&'a [(&'a str, &'a str)]),
    Query(&'a str),
    PasswordMessage(&'a str),
    CopyData(&'a [u8]),
    CopyDone,
    CopyFail(&'a str),
    Terminate,
}

impl FeMessage<'_> {
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            FeMessage::StartupMessage(params) => {
                let mut body = BytesMut::new();
                body.put_u32(PG_PROTOCOL_VERSION);
                for (k, v) in params.iter() {
                    put_cstring(&mut body, k);
                    put_cstring(&mut body, v);
                }
                body.put_u8(0);
                buf.put_u32(4 + body.len() as u32);
                buf.put_slice(&body);
            }
            FeMessage::Query(query) => {
                buf.put_u8(b'Q');
                buf.put_u32(4 + query.len() as u32 + 1);
                put_cstring(buf, query);
            }
            FeMessage::PasswordMessage(password) => {
                buf.put_u8(b'p');
                buf.put_u32(4 + password.len() as u32 + 1);
                put_cstring(buf, password);
            }
            FeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                buf.put_u32(4 + data.len() as u32);
                buf.put_slice(data);
            }
            FeMessage::CopyDone => {
                buf.put_u8(b'c');
                buf.put_u32(4);
            }
            FeMessage::CopyFail(reason) => {
                buf.put_u8(b'f');
                buf.put_u32(4 + reason.len() as u32 + 1);
                put_cstring(buf, reason);
            }
            FeMessage::Terminate => {
                buf.put_u8(b'X');
                buf.put_u32(4);
            }
        }
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// The response to an MD5 authentication challenge:
/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`.
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute([password.as_bytes(), user.as_bytes()].concat()));
    let outer = format!(
        "{:x}",
        md5::compute([inner.as_bytes(), salt.as_slice()].concat())
    );
    format!("md5{outer}")
}

//
// Physical replication payloads, carried inside CopyData frames.
//

/// Leading byte of a WAL data payload from the server.
pub const XLOG_DATA_TAG: u8 = b'w';
/// Leading byte of a keepalive payload from the server.
pub const KEEPALIVE_TAG: u8 = b'k';
/// Leading byte of a standby status update sent by this client.
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// Header of an XLogData ('w') payload; the WAL bytes follow it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XLogDataHeader {
    /// LSN of the first byte of the payload.
    pub wal_start: u64,
    /// Current end of WAL on the server.
    pub wal_end: u64,
    /// Server clock at send time (PostgreSQL epoch microseconds).
    pub timestamp: i64,
}

pub const XLOG_DATA_HDR_LEN: usize = 1 + 8 + 8 + 8;

impl XLogDataHeader {
    /// Parse from a CopyData body positioned at the 'w' tag; leaves `buf` at
    /// the first WAL byte.
    pub fn parse(buf: &mut Bytes) -> Result<XLogDataHeader, ProtocolError> {
        if buf.len() < XLOG_DATA_HDR_LEN {
            return Err(ProtocolError::BadMessage("short XLogData header".into()));
        }
        let tag = buf.get_u8();
        if tag != XLOG_DATA_TAG {
            return Err(ProtocolError::BadMessage(format!(
                "expected XLogData tag, got {tag:#x}"
            )));
        }
        Ok(XLogDataHeader {
            wal_start: buf.get_u64(),
            wal_end: buf.get_u64(),
            timestamp: buf.get_i64(),
        })
    }
}

/// A primary keepalive ('k') payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub wal_end: u64,
    pub timestamp: i64,
    pub reply_requested: bool,
}

impl PrimaryKeepalive {
    pub fn parse(buf: &mut Bytes) -> Result<PrimaryKeepalive, ProtocolError> {
        if buf.len() < 1 + 8 + 8 + 1 {
            return Err(ProtocolError::BadMessage("short keepalive".into()));
        }
        let tag = buf.get_u8();
        if tag != KEEPALIVE_TAG {
            return Err(ProtocolError::BadMessage(format!(
                "expected keepalive tag, got {tag:#x}"
            )));
        }
        Ok(PrimaryKeepalive {
            wal_end: buf.get_u64(),
            timestamp: buf.get_i64(),
            reply_requested: buf.get_u8() != 0,
        })
    }
}

/// The standby status update this client sends in response to 'w' and 'k'
/// frames, wrapped into a CopyData frame by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub timestamp: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 * 3 + 8 + 1);
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
        buf.put_u64(self.write_lsn);
        buf.put_u64(self.flush_lsn);
        buf.put_u64(self.apply_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }
}

/// Quote a string literal for inclusion in a simple-protocol command.
pub fn quote_literal(s: &str) -> Cow<'_, str> {
    if s.contains('\'') {
        Cow::Owned(format!("'{}'", s.replace('\'', "''")))
    } else {
        Cow::Owned(format!("'{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_u32(4 + body.len() as u32);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn parse_needs_whole_message() {
        let mut buf = framed(b'c', b"");
        let whole = buf.clone();
        buf.truncate(3);
        assert_eq!(BeMessage::parse(&mut buf).unwrap(), None);
        let mut buf = whole;
        assert_eq!(BeMessage::parse(&mut buf).unwrap(), Some(BeMessage::CopyDone));
        assert!(buf.is_empty());
    }

    #[test]
    fn parse_copy_data_and_error() {
        let mut buf = framed(b'd', b"payload");
        match BeMessage::parse(&mut buf).unwrap().unwrap() {
            BeMessage::CopyData(data) => assert_eq!(&data[..], b"payload"),
            other => panic!("unexpected {other:?}"),
        }

        let mut body = Vec::new();
        body.extend_from_slice(b"SFATAL\0");
        body.extend_from_slice(b"C57P01\0");
        body.extend_from_slice(b"Mterminating connection\0");
        body.push(0);
        let mut buf = framed(b'E', &body);
        match BeMessage::parse(&mut buf).unwrap().unwrap() {
            BeMessage::ErrorResponse(info) => {
                assert_eq!(info.severity, "FATAL");
                assert_eq!(info.code, "57P01");
                assert_eq!(info.message, "terminating connection");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_data_row_with_nulls() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(b"16/B");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        let mut buf = framed(b'D', &body);
        match BeMessage::parse(&mut buf).unwrap().unwrap() {
            BeMessage::DataRow(cols) => {
                assert_eq!(cols.len(), 2);
                assert_eq!(cols[0].as_deref(), Some(b"16/B".as_slice()));
                assert_eq!(cols[1], None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn xlogdata_and_status_update_round_trip() {
        let mut payload = BytesMut::new();
        payload.put_u8(XLOG_DATA_TAG);
        payload.put_u64(0x100);
        payload.put_u64(0x200);
        payload.put_i64(777);
        payload.put_slice(b"walwalwal");
        let mut payload = payload.freeze();
        let hdr = XLogDataHeader::parse(&mut payload).unwrap();
        assert_eq!(hdr.wal_start, 0x100);
        assert_eq!(hdr.wal_end, 0x200);
        assert_eq!(hdr.timestamp, 777);
        assert_eq!(&payload[..], b"walwalwal");

        let update = StandbyStatusUpdate {
            write_lsn: 1,
            flush_lsn: 2,
            apply_lsn: 0,
            timestamp: 3,
            reply_requested: false,
        };
        let encoded = update.encode();
        assert_eq!(encoded[0], STANDBY_STATUS_UPDATE_TAG);
        assert_eq!(encoded.len(), 34);
    }

    #[test]
    fn md5_password_format() {
        let pwd = md5_password("admin", "secret", [1, 2, 3, 4]);
        assert!(pwd.starts_with("md5"));
        assert_eq!(pwd.len(), 3 + 32);
    }
}
