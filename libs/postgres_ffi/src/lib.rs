//!
//! Common types and constants for working with the PostgreSQL on-disk and
//! on-wire formats: WAL segment naming, page and record headers, relation
//! file identifiers, and the per-major-version differences the rest of the
//! workspace dispatches on.
//!

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub mod pg_constants;
pub mod xlog_utils;

pub use xlog_utils::{
    IsPartialXLogFileName, IsTLHistoryFileName, IsXLogFileName, TimelineHistoryFileName,
    XLogFileName, XLogFromFileName, XLogSegNoOffsetToRecPtr, XLogSegmentsPerXLogId,
};

pub type Oid = u32;
pub type TransactionId = u32;
pub type BlockNumber = u32;
pub type OffsetNumber = u16;
pub type MultiXactId = TransactionId;
pub type MultiXactOffset = u32;
pub type MultiXactStatus = u32;
pub type RepOriginId = u16;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;

/// Size of a PostgreSQL heap page.
pub const BLCKSZ: u16 = 8192;
/// Size of a WAL page. Records are packed into pages of this size inside a segment.
pub const XLOG_BLCKSZ: usize = 8192;
/// Default WAL segment size. Segment sizes are powers of two; the actual size
/// of a cluster's segments is read from the long page header.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
/// The PostgreSQL timeline history starts at 1.
pub const PG_TLI: TimeLineID = 1;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of xl_crc within XLogRecord: tot_len(4) + xid(4) + prev(8) + info(1) + rmid(1) + pad(2).
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;

#[derive(Debug, thiserror::Error)]
#[error("unknown WAL page magic {0:#06x}")]
pub struct UnknownMagic(pub u16);

/// The supported PostgreSQL major versions, identified by their WAL page magic.
///
/// This is a closed set: every decoder in the workspace is parameterized by
/// one of these and refuses anything else up front.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PgMajorVersion {
    V13,
    V14,
    V15,
    V16,
    V17,
    V18,
}

impl PgMajorVersion {
    pub fn from_magic(magic: u16) -> Result<Self, UnknownMagic> {
        match magic {
            0xD106 => Ok(PgMajorVersion::V13),
            0xD10D => Ok(PgMajorVersion::V14),
            0xD110 => Ok(PgMajorVersion::V15),
            0xD113 => Ok(PgMajorVersion::V16),
            0xD116 => Ok(PgMajorVersion::V17),
            0xD118 => Ok(PgMajorVersion::V18),
            other => Err(UnknownMagic(other)),
        }
    }

    pub fn from_major(major: u32) -> Option<Self> {
        match major {
            13 => Some(PgMajorVersion::V13),
            14 => Some(PgMajorVersion::V14),
            15 => Some(PgMajorVersion::V15),
            16 => Some(PgMajorVersion::V16),
            17 => Some(PgMajorVersion::V17),
            18 => Some(PgMajorVersion::V18),
            _ => None,
        }
    }

    pub fn magic(self) -> u16 {
        match self {
            PgMajorVersion::V13 => 0xD106,
            PgMajorVersion::V14 => 0xD10D,
            PgMajorVersion::V15 => 0xD110,
            PgMajorVersion::V16 => 0xD113,
            PgMajorVersion::V17 => 0xD116,
            PgMajorVersion::V18 => 0xD118,
        }
    }

    pub fn major(self) -> u32 {
        match self {
            PgMajorVersion::V13 => 13,
            PgMajorVersion::V14 => 14,
            PgMajorVersion::V15 => 15,
            PgMajorVersion::V16 => 16,
            PgMajorVersion::V17 => 17,
            PgMajorVersion::V18 => 18,
        }
    }
}

impl std::fmt::Display for PgMajorVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.major())
    }
}

/// Is a full-page image in a block header compressed, given the record's
/// version? PG 15 split the single IS_COMPRESSED bit into one bit per method.
pub fn bkpimage_is_compressed(bimg_info: u8, version: PgMajorVersion) -> bool {
    if version >= PgMajorVersion::V15 {
        (bimg_info
            & (pg_constants::BKPIMAGE_COMPRESS_PGLZ
                | pg_constants::BKPIMAGE_COMPRESS_LZ4
                | pg_constants::BKPIMAGE_COMPRESS_ZSTD))
            != 0
    } else {
        (bimg_info & pg_constants::BKPIMAGE_IS_COMPRESSED) != 0
    }
}

/// Should the full-page image be restored during replay? The APPLY bit moved
/// when the compression bits were added.
pub fn bkpimage_is_apply(bimg_info: u8, version: PgMajorVersion) -> bool {
    if version >= PgMajorVersion::V15 {
        (bimg_info & pg_constants::BKPIMAGE_APPLY) != 0
    } else {
        (bimg_info & pg_constants::BKPIMAGE_APPLY_V14) != 0
    }
}

/// Identifies a relation file on disk: tablespace, database, relation number.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RelFileLocator {
    pub spc_oid: Oid,
    pub db_oid: Oid,
    pub rel_number: Oid,
}

impl std::fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.spc_oid, self.db_oid, self.rel_number)
    }
}

/// Per-relation sub-file.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForkNumber {
    Main,
    Fsm,
    VisibilityMap,
    Init,
}

impl ForkNumber {
    pub fn from_u8(v: u8) -> Option<ForkNumber> {
        match v {
            0 => Some(ForkNumber::Main),
            1 => Some(ForkNumber::Fsm),
            2 => Some(ForkNumber::VisibilityMap),
            3 => Some(ForkNumber::Init),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ForkNumber::Main => 0,
            ForkNumber::Fsm => 1,
            ForkNumber::VisibilityMap => 2,
            ForkNumber::Init => 3,
        }
    }

    /// The filename suffix PostgreSQL uses for this fork.
    pub fn suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::Fsm => "_fsm",
            ForkNumber::VisibilityMap => "_vm",
            ForkNumber::Init => "_init",
        }
    }
}

/// The fixed 24-byte header every WAL record starts with.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XLogRecord {
    pub xl_tot_len: u32,
    pub xl_xid: TransactionId,
    pub xl_prev: XLogRecPtr,
    pub xl_info: u8,
    pub xl_rmid: u8,
    /* 2 bytes of padding here, followed by: */
    pub xl_crc: u32,
}

impl XLogRecord {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> anyhow::Result<XLogRecord> {
        anyhow::ensure!(
            buf.remaining() >= XLOG_SIZE_OF_XLOG_RECORD,
            "not enough bytes for XLogRecord"
        );
        let rec = XLogRecord {
            xl_tot_len: buf.get_u32_le(),
            xl_xid: buf.get_u32_le(),
            xl_prev: buf.get_u64_le(),
            xl_info: buf.get_u8(),
            xl_rmid: buf.get_u8(),
            xl_crc: {
                buf.advance(2);
                buf.get_u32_le()
            },
        };
        Ok(rec)
    }

    pub fn from_slice(buf: &[u8]) -> anyhow::Result<XLogRecord> {
        let mut b = buf;
        Self::from_bytes(&mut b)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
        self.write(&mut buf);
        buf.freeze()
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.xl_tot_len);
        buf.put_u32_le(self.xl_xid);
        buf.put_u64_le(self.xl_prev);
        buf.put_u8(self.xl_info);
        buf.put_u8(self.xl_rmid);
        buf.put_u16_le(0); // padding
        buf.put_u32_le(self.xl_crc);
    }

    // Is this record an XLOG_SWITCH record? They need some special processing,
    pub fn is_xlog_switch_record(&self) -> bool {
        self.xl_info == pg_constants::XLOG_SWITCH && self.xl_rmid == pg_constants::RM_XLOG_ID
    }
}

/// The short page header at the start of every WAL page but the first of a segment.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: XLogRecPtr,
    /// When the previous page ends mid-record, the number of bytes of that
    /// record continuing on this page.
    pub xlp_rem_len: u32,
}

impl XLogPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> anyhow::Result<XLogPageHeaderData> {
        anyhow::ensure!(
            buf.remaining() >= XLOG_SIZE_OF_XLOG_SHORT_PHD,
            "not enough bytes for XLogPageHeaderData"
        );
        let hdr = XLogPageHeaderData {
            xlp_magic: buf.get_u16_le(),
            xlp_info: buf.get_u16_le(),
            xlp_tli: buf.get_u32_le(),
            xlp_pageaddr: buf.get_u64_le(),
            xlp_rem_len: buf.get_u32_le(),
        };
        buf.advance(4); // padding
        Ok(hdr)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_SHORT_PHD);
        self.write(&mut buf);
        buf.freeze()
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.xlp_magic);
        buf.put_u16_le(self.xlp_info);
        buf.put_u32_le(self.xlp_tli);
        buf.put_u64_le(self.xlp_pageaddr);
        buf.put_u32_le(self.xlp_rem_len);
        buf.put_u32_le(0); // padding
    }

    pub fn is_long_header(&self) -> bool {
        (self.xlp_info & pg_constants::XLP_LONG_HEADER) != 0
    }
}

/// The long page header at the start of a segment: the short header plus the
/// system identifier and the cluster's segment/page geometry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

impl XLogLongPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> anyhow::Result<XLogLongPageHeaderData> {
        Ok(XLogLongPageHeaderData {
            std: XLogPageHeaderData::from_bytes(buf)?,
            xlp_sysid: buf.get_u64_le(),
            xlp_seg_size: buf.get_u32_le(),
            xlp_xlog_blcksz: buf.get_u32_le(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_LONG_PHD);
        self.std.write(&mut buf);
        buf.put_u64_le(self.xlp_sysid);
        buf.put_u32_le(self.xlp_seg_size);
        buf.put_u32_le(self.xlp_xlog_blcksz);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_round_trip() {
        let rec = XLogRecord {
            xl_tot_len: 0x1234,
            xl_xid: 42,
            xl_prev: 0x0123_4567_89AB_CDEF,
            xl_info: pg_constants::XLOG_SWITCH,
            xl_rmid: pg_constants::RM_XLOG_ID,
            xl_crc: 0xDEADBEEF,
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), XLOG_SIZE_OF_XLOG_RECORD);
        let back = XLogRecord::from_slice(&bytes).unwrap();
        assert_eq!(back, rec);
        assert!(back.is_xlog_switch_record());
    }

    #[test]
    fn page_headers_round_trip() {
        let short = XLogPageHeaderData {
            xlp_magic: PgMajorVersion::V16.magic(),
            xlp_info: pg_constants::XLP_FIRST_IS_CONTRECORD,
            xlp_tli: 1,
            xlp_pageaddr: 0x2000,
            xlp_rem_len: 100,
        };
        let bytes = short.encode();
        assert_eq!(bytes.len(), XLOG_SIZE_OF_XLOG_SHORT_PHD);
        let mut b = bytes.clone();
        assert_eq!(XLogPageHeaderData::from_bytes(&mut b).unwrap(), short);

        let long = XLogLongPageHeaderData {
            std: XLogPageHeaderData {
                xlp_info: pg_constants::XLP_LONG_HEADER,
                xlp_rem_len: 0,
                ..short
            },
            xlp_sysid: 0x1122_3344_5566_7788,
            xlp_seg_size: WAL_SEGMENT_SIZE as u32,
            xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
        };
        let bytes = long.encode();
        assert_eq!(bytes.len(), XLOG_SIZE_OF_XLOG_LONG_PHD);
        let mut b = bytes.clone();
        let decoded = XLogLongPageHeaderData::from_bytes(&mut b).unwrap();
        assert_eq!(decoded, long);
        assert!(decoded.std.is_long_header());
    }

    #[test]
    fn magic_version_map() {
        for (magic, major) in [
            (0xD106u16, 13u32),
            (0xD10D, 14),
            (0xD110, 15),
            (0xD113, 16),
            (0xD116, 17),
            (0xD118, 18),
        ] {
            let v = PgMajorVersion::from_magic(magic).unwrap();
            assert_eq!(v.major(), major);
            assert_eq!(v.magic(), magic);
        }
        assert!(PgMajorVersion::from_magic(0xD100).is_err());
    }

    #[test]
    fn fpi_flag_layout_depends_on_version() {
        // 0x02 means "compressed" before 15, "apply" from 15 on.
        assert!(bkpimage_is_compressed(0x02, PgMajorVersion::V14));
        assert!(!bkpimage_is_compressed(0x02, PgMajorVersion::V15));
        assert!(bkpimage_is_apply(0x02, PgMajorVersion::V15));
        assert!(!bkpimage_is_apply(0x02, PgMajorVersion::V14));
        assert!(bkpimage_is_apply(0x04, PgMajorVersion::V14));
        assert!(bkpimage_is_compressed(0x08, PgMajorVersion::V16));
    }
}
