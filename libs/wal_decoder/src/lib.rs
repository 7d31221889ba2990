//!
//! Decoding and re-encoding of PostgreSQL WAL records.
//!
//! [`decode_wal_record`] turns the raw bytes of one record (header included)
//! into a [`DecodedWalRecord`]: block references with their full-page images
//! and data payloads, replication origin, toplevel xid and main data.
//! [`DecodedWalRecord::encode`] is the exact inverse; a record that decodes
//! cleanly re-encodes to the same bytes, CRC included.
//!
//! [`walfile`] assembles records out of segment files, across page and
//! segment boundaries, and writes segments back out.
//!

use bytes::{Buf, BufMut, Bytes, BytesMut};

use postgres_ffi::pg_constants;
use postgres_ffi::{
    bkpimage_is_apply, bkpimage_is_compressed, PgMajorVersion, RelFileLocator, TransactionId,
    XLogRecord, BLCKSZ, XLOG_RECORD_CRC_OFFS, XLOG_SIZE_OF_XLOG_RECORD,
};
use utils::lsn::Lsn;

pub mod rmgr;
pub mod test_utils;
pub mod walfile;

/// Everything that can go wrong while taking apart a WAL record or a segment.
#[derive(Debug, thiserror::Error)]
pub enum WalDecodeError {
    #[error(transparent)]
    InvalidMagic(#[from] postgres_ffi::UnknownMagic),
    #[error("record too short: {0}")]
    ShortData(&'static str),
    #[error("out-of-order block_id {block_id} after {max_block_id}")]
    BlockIdOutOfOrder { block_id: u8, max_block_id: i16 },
    #[error("BKPBLOCK_SAME_REL set but no previous rel")]
    SameRelWithoutPrior,
    #[error("inconsistent full-page image flags: {0}")]
    FpiFlagInconsistent(&'static str),
    #[error("record CRC mismatch: computed {computed:#010x}, stored {stored:#010x}")]
    CrcMismatch { computed: u32, stored: u32 },
    #[error("inconsistent record header: {0}")]
    HeaderInconsistent(String),
}

/// One block reference inside a WAL record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedBkpBlock {
    /// The block id byte this reference was keyed with (0..=XLR_MAX_BLOCK_ID).
    pub id: u8,

    /* Identify the block this refers to */
    pub rlocator: RelFileLocator,
    // Note that we have a few special forknum values for non-rel files.
    pub forknum: u8,
    pub blkno: u32,

    /* copy of the fork_flags field from the XLogRecordBlockHeader */
    pub flags: u8,

    /* Information on full-page image, if any */
    pub has_image: bool,
    pub apply_image: bool,
    pub will_init: bool,
    pub hole_offset: u16,
    pub hole_length: u16,
    pub bimg_info: u8,
    pub bimg_len: u16,
    pub bkp_image: Bytes,

    /* Buffer holding the rmgr-specific data associated with this block */
    pub has_data: bool,
    pub data_len: u16,
    pub data: Bytes,
}

impl DecodedBkpBlock {
    pub fn same_rel(&self) -> bool {
        (self.flags & pg_constants::BKPBLOCK_SAME_REL) != 0
    }
}

/// The order in which sub-headers appeared between the record header and the
/// payloads. Preserved so that re-encoding reproduces the input bytes even
/// for writers that emit the markers in an unusual order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubHeader {
    Block(u8),
    Origin,
    ToplevelXid,
    MainDataShort,
    MainDataLong,
}

/// A fully taken-apart WAL record.
#[derive(Clone, Debug, Default)]
pub struct DecodedWalRecord {
    pub header: XLogRecord,
    /// LSN of the first byte of this record, when known from the segment walk.
    pub lsn: Lsn,

    pub record_origin: Option<u16>,
    pub toplevel_xid: Option<TransactionId>,
    /// Block references ordered by strictly-increasing block id.
    pub blocks: Vec<DecodedBkpBlock>,
    pub main_data: Bytes,

    /// Sub-header order as found on disk; empty for hand-built records.
    pub layout: Vec<SubHeader>,
}

impl DecodedWalRecord {
    pub fn xid(&self) -> TransactionId {
        self.header.xl_xid
    }

    /// The transaction this record ultimately belongs to: the toplevel xid
    /// for records written by subtransactions, xl_xid otherwise.
    pub fn effective_xids(&self) -> impl Iterator<Item = TransactionId> + '_ {
        std::iter::once(self.header.xl_xid).chain(self.toplevel_xid)
    }

    pub fn max_block_id(&self) -> Option<u8> {
        self.blocks.last().map(|b| b.id)
    }

    /// Turn this record into a NOOP of the XLOG resource manager, keeping
    /// xl_tot_len (and therefore the xl_prev chain of the following records)
    /// intact. Only the CRC needs recomputing afterwards, which [`encode`]
    /// does.
    ///
    /// [`encode`]: Self::encode
    pub fn make_noop(&mut self) {
        self.header.xl_rmid = pg_constants::RM_XLOG_ID;
        self.header.xl_info = pg_constants::XLOG_NOOP;
    }

    /// Serialize back to bytes, recomputing the CRC. The inverse of
    /// [`decode_wal_record`]: for an unmodified record the output equals the
    /// input.
    pub fn encode(&self, version: PgMajorVersion) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.xl_tot_len as usize);

        // Header goes first; the CRC slot is patched at the end.
        self.header.write(&mut buf);

        let layout = if self.layout.is_empty() {
            self.canonical_layout()
        } else {
            self.layout.clone()
        };

        for sub in &layout {
            match sub {
                SubHeader::Block(id) => {
                    let blk = self
                        .blocks
                        .iter()
                        .find(|b| b.id == *id)
                        .expect("layout references a missing block");
                    buf.put_u8(blk.id);
                    buf.put_u8(blk.flags);
                    buf.put_u16_le(blk.data_len);
                    if blk.has_image {
                        buf.put_u16_le(blk.bimg_len);
                        buf.put_u16_le(blk.hole_offset);
                        buf.put_u8(blk.bimg_info);
                        if bkpimage_is_compressed(blk.bimg_info, version)
                            && (blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE) != 0
                        {
                            buf.put_u16_le(blk.hole_length);
                        }
                    }
                    if !blk.same_rel() {
                        buf.put_u32_le(blk.rlocator.spc_oid);
                        buf.put_u32_le(blk.rlocator.db_oid);
                        buf.put_u32_le(blk.rlocator.rel_number);
                    }
                    buf.put_u32_le(blk.blkno);
                }
                SubHeader::Origin => {
                    buf.put_u8(pg_constants::XLR_BLOCK_ID_ORIGIN);
                    buf.put_u16_le(self.record_origin.unwrap_or(0));
                }
                SubHeader::ToplevelXid => {
                    buf.put_u8(pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID);
                    buf.put_u32_le(self.toplevel_xid.unwrap_or(0));
                }
                SubHeader::MainDataShort => {
                    buf.put_u8(pg_constants::XLR_BLOCK_ID_DATA_SHORT);
                    buf.put_u8(self.main_data.len() as u8);
                }
                SubHeader::MainDataLong => {
                    buf.put_u8(pg_constants::XLR_BLOCK_ID_DATA_LONG);
                    buf.put_u32_le(self.main_data.len() as u32);
                }
            }
        }

        // Payloads in block-id order: per block the image, then the data.
        for blk in &self.blocks {
            if blk.has_image {
                buf.put_slice(&blk.bkp_image);
            }
            if blk.has_data {
                buf.put_slice(&blk.data);
            }
        }
        buf.put_slice(&self.main_data);

        debug_assert_eq!(buf.len(), self.header.xl_tot_len as usize);

        // CRC covers payload bytes then the header up to the CRC slot.
        let crc = record_crc(&buf);
        buf[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4].copy_from_slice(&crc.to_le_bytes());
        buf.freeze()
    }

    /// The sub-header order a fresh record is written with: blocks in id
    /// order, then origin and toplevel xid, then the main-data marker.
    fn canonical_layout(&self) -> Vec<SubHeader> {
        let mut layout = Vec::with_capacity(self.blocks.len() + 3);
        for blk in &self.blocks {
            layout.push(SubHeader::Block(blk.id));
        }
        if self.record_origin.is_some() {
            layout.push(SubHeader::Origin);
        }
        if self.toplevel_xid.is_some() {
            layout.push(SubHeader::ToplevelXid);
        }
        if !self.main_data.is_empty() {
            if self.main_data.len() <= u8::MAX as usize {
                layout.push(SubHeader::MainDataShort);
            } else {
                layout.push(SubHeader::MainDataLong);
            }
        }
        layout
    }

    /// Recompute xl_tot_len from the parts. Used by the test fixtures after
    /// assembling a record by hand.
    pub fn recompute_tot_len(&mut self, version: PgMajorVersion) {
        let mut len = XLOG_SIZE_OF_XLOG_RECORD;
        for blk in &self.blocks {
            len += 1 + 1 + 2; // id, fork_flags, data_len
            if blk.has_image {
                len += 2 + 2 + 1; // bimg_len, hole_offset, bimg_info
                if bkpimage_is_compressed(blk.bimg_info, version)
                    && (blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE) != 0
                {
                    len += 2;
                }
            }
            if !blk.same_rel() {
                len += 12;
            }
            len += 4; // blkno
            len += blk.bkp_image.len() + blk.data.len();
        }
        if self.record_origin.is_some() {
            len += 1 + 2;
        }
        if self.toplevel_xid.is_some() {
            len += 1 + 4;
        }
        if !self.main_data.is_empty() {
            len += if self.main_data.len() <= u8::MAX as usize {
                1 + 1
            } else {
                1 + 4
            };
            len += self.main_data.len();
        }
        self.header.xl_tot_len = len as u32;
    }
}

/// CRC32C over the record payload followed by the header up to the CRC slot,
/// as PostgreSQL computes it.
pub fn record_crc(record: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&record[XLOG_SIZE_OF_XLOG_RECORD..]);
    crc = crc32c::crc32c_append(crc, &record[0..XLOG_RECORD_CRC_OFFS]);
    crc
}

/// Verify the stored CRC of a raw record.
pub fn verify_record_crc(record: &[u8]) -> Result<(), WalDecodeError> {
    let stored = u32::from_le_bytes(
        record[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4]
            .try_into()
            .unwrap(),
    );
    let computed = record_crc(record);
    if computed != stored {
        return Err(WalDecodeError::CrcMismatch { computed, stored });
    }
    Ok(())
}

/// Main routine to decode a WAL record.
//
// See xlogrecord.h for details. The overall layout of an XLOG record is:
//		Fixed-size header (XLogRecord struct)
//      XLogRecordBlockHeader struct
//          If BKPBLOCK_HAS_IMAGE, an XLogRecordBlockImageHeader struct follows
//	           If BKPIMAGE_HAS_HOLE and the image is compressed, an
//	           XLogRecordBlockCompressHeader struct follows.
//          If BKPBLOCK_SAME_REL is not set, a RelFileLocator follows
//          BlockNumber follows
//      XLogRecordBlockHeader struct
//      ...
//      XLogRecordDataHeader[Short|Long] struct
//      block image, block data
//      block image, block data
//      ...
//      main data
pub fn decode_wal_record(
    record: Bytes,
    version: PgMajorVersion,
) -> Result<DecodedWalRecord, WalDecodeError> {
    let mut buf = record.clone();

    if buf.remaining() < XLOG_SIZE_OF_XLOG_RECORD {
        return Err(WalDecodeError::ShortData("record header"));
    }
    let xlogrec = XLogRecord::from_bytes(&mut buf)
        .map_err(|_| WalDecodeError::ShortData("record header"))?;

    if (xlogrec.xl_tot_len as usize) != record.len() {
        return Err(WalDecodeError::HeaderInconsistent(format!(
            "xl_tot_len {} != buffer length {}",
            xlogrec.xl_tot_len,
            record.len()
        )));
    }
    verify_record_crc(&record)?;

    let mut decoded = DecodedWalRecord {
        header: xlogrec,
        ..Default::default()
    };

    let mut max_block_id: i16 = -1;
    let mut prior_rlocator: Option<RelFileLocator> = None;
    let mut main_data_len: u32 = 0;
    let mut datatotal: u32 = 0;

    // Decode the sub-headers: XLogRecordBlockHeaders if any, markers,
    // XLogRecordDataHeader[Short|Long]. The loop ends when only payload
    // bytes remain.
    while buf.remaining() > datatotal as usize {
        if buf.remaining() < 1 {
            return Err(WalDecodeError::ShortData("block_id"));
        }
        let block_id = buf.get_u8();

        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                if buf.remaining() < 1 {
                    return Err(WalDecodeError::ShortData("short main_data_len"));
                }
                main_data_len = buf.get_u8() as u32;
                datatotal += main_data_len;
                decoded.layout.push(SubHeader::MainDataShort);
            }

            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                if buf.remaining() < 4 {
                    return Err(WalDecodeError::ShortData("long main_data_len"));
                }
                main_data_len = buf.get_u32_le();
                datatotal += main_data_len;
                decoded.layout.push(SubHeader::MainDataLong);
            }

            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                if buf.remaining() < 2 {
                    return Err(WalDecodeError::ShortData("record origin"));
                }
                decoded.record_origin = Some(buf.get_u16_le());
                decoded.layout.push(SubHeader::Origin);
            }

            pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID => {
                if buf.remaining() < 4 {
                    return Err(WalDecodeError::ShortData("toplevel xid"));
                }
                decoded.toplevel_xid = Some(buf.get_u32_le());
                decoded.layout.push(SubHeader::ToplevelXid);
            }

            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                if (block_id as i16) <= max_block_id {
                    return Err(WalDecodeError::BlockIdOutOfOrder {
                        block_id,
                        max_block_id,
                    });
                }
                max_block_id = block_id as i16;

                let mut blk = DecodedBkpBlock {
                    id: block_id,
                    ..Default::default()
                };

                if buf.remaining() < 3 {
                    return Err(WalDecodeError::ShortData("block header"));
                }
                let fork_flags: u8 = buf.get_u8();
                blk.forknum = fork_flags & pg_constants::BKPBLOCK_FORK_MASK;
                blk.flags = fork_flags;
                blk.has_image = (fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE) != 0;
                blk.has_data = (fork_flags & pg_constants::BKPBLOCK_HAS_DATA) != 0;
                blk.will_init = (fork_flags & pg_constants::BKPBLOCK_WILL_INIT) != 0;
                blk.data_len = buf.get_u16_le();

                if blk.has_data && blk.data_len == 0 {
                    return Err(WalDecodeError::HeaderInconsistent(
                        "BKPBLOCK_HAS_DATA set, but no data included".into(),
                    ));
                }
                if !blk.has_data && blk.data_len != 0 {
                    return Err(WalDecodeError::HeaderInconsistent(
                        "BKPBLOCK_HAS_DATA not set, but data length is not zero".into(),
                    ));
                }
                datatotal += blk.data_len as u32;

                if blk.has_image {
                    if buf.remaining() < 5 {
                        return Err(WalDecodeError::ShortData("block image header"));
                    }
                    blk.bimg_len = buf.get_u16_le();
                    blk.hole_offset = buf.get_u16_le();
                    blk.bimg_info = buf.get_u8();

                    blk.apply_image = bkpimage_is_apply(blk.bimg_info, version);
                    let compressed = bkpimage_is_compressed(blk.bimg_info, version);

                    if compressed {
                        if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0 {
                            if buf.remaining() < 2 {
                                return Err(WalDecodeError::ShortData("hole length"));
                            }
                            blk.hole_length = buf.get_u16_le();
                        } else {
                            blk.hole_length = 0;
                        }
                    } else {
                        blk.hole_length = BLCKSZ - blk.bimg_len;
                    }
                    datatotal += blk.bimg_len as u32;

                    // cross-check that hole_offset > 0, hole_length > 0 and
                    // bimg_len < BLCKSZ if the HAS_HOLE flag is set.
                    if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0
                        && (blk.hole_offset == 0 || blk.hole_length == 0 || blk.bimg_len == BLCKSZ)
                    {
                        return Err(WalDecodeError::FpiFlagInconsistent(
                            "BKPIMAGE_HAS_HOLE set, but hole offset/length/image length disagree",
                        ));
                    }

                    // cross-check that hole_offset == 0 if the HAS_HOLE flag
                    // is not set.
                    if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE == 0 && blk.hole_offset != 0
                    {
                        return Err(WalDecodeError::FpiFlagInconsistent(
                            "BKPIMAGE_HAS_HOLE not set, but hole offset is not zero",
                        ));
                    }

                    // cross-check that bimg_len < BLCKSZ if the image is compressed.
                    if compressed && blk.bimg_len == BLCKSZ {
                        return Err(WalDecodeError::FpiFlagInconsistent(
                            "compressed image, but image length is a whole block",
                        ));
                    }

                    // cross-check that bimg_len == BLCKSZ if neither HAS_HOLE
                    // nor compression apply.
                    if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE == 0
                        && !compressed
                        && blk.bimg_len != BLCKSZ
                    {
                        return Err(WalDecodeError::FpiFlagInconsistent(
                            "neither hole nor compression, but image is not a whole block",
                        ));
                    }
                }

                if fork_flags & pg_constants::BKPBLOCK_SAME_REL == 0 {
                    if buf.remaining() < 12 {
                        return Err(WalDecodeError::ShortData("rel file locator"));
                    }
                    let rlocator = RelFileLocator {
                        spc_oid: buf.get_u32_le(),
                        db_oid: buf.get_u32_le(),
                        rel_number: buf.get_u32_le(),
                    };
                    blk.rlocator = rlocator;
                    prior_rlocator = Some(rlocator);
                } else {
                    blk.rlocator = prior_rlocator.ok_or(WalDecodeError::SameRelWithoutPrior)?;
                }

                if buf.remaining() < 4 {
                    return Err(WalDecodeError::ShortData("block number"));
                }
                blk.blkno = buf.get_u32_le();

                decoded.layout.push(SubHeader::Block(block_id));
                decoded.blocks.push(blk);
            }

            _ => {
                return Err(WalDecodeError::HeaderInconsistent(format!(
                    "invalid block_id {block_id}"
                )));
            }
        }
    }

    if buf.remaining() != datatotal as usize {
        return Err(WalDecodeError::HeaderInconsistent(format!(
            "remaining {} != datatotal {}",
            buf.remaining(),
            datatotal
        )));
    }

    // Payloads, in the order the block headers were emitted.
    for blk in decoded.blocks.iter_mut() {
        if blk.has_image {
            blk.bkp_image = buf.split_to(blk.bimg_len as usize);
        }
        if blk.has_data {
            blk.data = buf.split_to(blk.data_len as usize);
        }
    }
    if main_data_len > 0 {
        decoded.main_data = buf.split_to(main_data_len as usize);
    }
    debug_assert_eq!(buf.remaining(), 0);

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{record_with_block, simple_record};

    #[test]
    fn round_trip_simple_record() {
        let rec = simple_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_NEXTOID,
            0,
            &[1, 2, 3, 4],
            PgMajorVersion::V16,
        );
        let bytes = rec.encode(PgMajorVersion::V16);
        let decoded = decode_wal_record(bytes.clone(), PgMajorVersion::V16).unwrap();
        assert_eq!(decoded.header, rec.header);
        assert_eq!(&decoded.main_data[..], &[1, 2, 3, 4]);
        assert_eq!(decoded.encode(PgMajorVersion::V16), bytes);
    }

    #[test]
    fn round_trip_with_blocks() {
        let rec = record_with_block(
            pg_constants::RM_HEAP_ID,
            pg_constants::XLOG_HEAP_INSERT,
            1234,
            RelFileLocator {
                spc_oid: 1663,
                db_oid: 5,
                rel_number: 16384,
            },
            7,
            &[0xAB; 20],
            &[0xCD; 3],
            PgMajorVersion::V16,
        );
        let bytes = rec.encode(PgMajorVersion::V16);
        let decoded = decode_wal_record(bytes.clone(), PgMajorVersion::V16).unwrap();
        assert_eq!(decoded.blocks.len(), 1);
        let blk = &decoded.blocks[0];
        assert_eq!(blk.blkno, 7);
        assert_eq!(blk.rlocator.rel_number, 16384);
        assert_eq!(&blk.data[..], &[0xAB; 20]);
        assert_eq!(&decoded.main_data[..], &[0xCD; 3]);
        // byte-for-byte inverse
        assert_eq!(decoded.encode(PgMajorVersion::V16), bytes);
    }

    #[test]
    fn crc_mismatch_is_detected() {
        let rec = simple_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_NEXTOID,
            0,
            &[9; 10],
            PgMajorVersion::V16,
        );
        let bytes = rec.encode(PgMajorVersion::V16);
        let mut corrupt = bytes.to_vec();
        *corrupt.last_mut().unwrap() ^= 0xFF;
        let err = decode_wal_record(Bytes::from(corrupt), PgMajorVersion::V16).unwrap_err();
        assert!(matches!(err, WalDecodeError::CrcMismatch { .. }));
    }

    #[test]
    fn block_id_monotonicity_is_enforced() {
        // Build a two-block record and swap the block ids so they decrease.
        let mut rec = record_with_block(
            pg_constants::RM_HEAP_ID,
            pg_constants::XLOG_HEAP_UPDATE,
            1,
            RelFileLocator {
                spc_oid: 1663,
                db_oid: 5,
                rel_number: 16385,
            },
            1,
            &[1; 4],
            &[],
            PgMajorVersion::V16,
        );
        let mut second = rec.blocks[0].clone();
        second.id = 0; // not greater than the first block's id
        rec.blocks.push(second);
        rec.layout.clear();
        rec.recompute_tot_len(PgMajorVersion::V16);
        let bytes = rec.encode(PgMajorVersion::V16);
        let err = decode_wal_record(bytes, PgMajorVersion::V16).unwrap_err();
        assert!(matches!(err, WalDecodeError::BlockIdOutOfOrder { .. }));
    }

    #[test]
    fn tot_len_must_match() {
        let rec = simple_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_NEXTOID,
            0,
            &[1],
            PgMajorVersion::V15,
        );
        let bytes = rec.encode(PgMajorVersion::V15);
        let truncated = bytes.slice(..bytes.len() - 1);
        let err = decode_wal_record(truncated, PgMajorVersion::V15).unwrap_err();
        assert!(matches!(err, WalDecodeError::HeaderInconsistent(_)));
    }

    #[test]
    fn noop_rewrite_preserves_length() {
        let mut rec = record_with_block(
            pg_constants::RM_HEAP_ID,
            pg_constants::XLOG_HEAP_DELETE,
            77,
            RelFileLocator {
                spc_oid: 1663,
                db_oid: 5,
                rel_number: 2619,
            },
            0,
            &[5; 8],
            &[6; 16],
            PgMajorVersion::V17,
        );
        let before = rec.encode(PgMajorVersion::V17);
        rec.make_noop();
        let after = rec.encode(PgMajorVersion::V17);
        assert_eq!(before.len(), after.len());
        let decoded = decode_wal_record(after, PgMajorVersion::V17).unwrap();
        assert_eq!(decoded.header.xl_rmid, pg_constants::RM_XLOG_ID);
        assert_eq!(decoded.header.xl_info, pg_constants::XLOG_NOOP);
        // trailing data is left in place; NOOP redo ignores it
        assert_eq!(&decoded.main_data[..], &[6; 16]);
    }
}
