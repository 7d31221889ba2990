//! Fixtures for building synthetic WAL streams in tests.
//!
//! [`WalGenerator`] lays records out into zero-filled segments with the same
//! page-header and alignment rules the real thing uses, so the walker in
//! [`crate::walfile`] can be exercised without a running server.

use bytes::{Bytes, BytesMut};

use postgres_ffi::pg_constants;
use postgres_ffi::{
    PgMajorVersion, RelFileLocator, TimeLineID, TransactionId, XLogFileName,
    XLogLongPageHeaderData, XLogPageHeaderData, XLogRecord, XLogSegNo, BLCKSZ, XLOG_BLCKSZ,
    XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use utils::lsn::Lsn;

use crate::{DecodedBkpBlock, DecodedWalRecord};

pub struct WalGenerator {
    pub version: PgMajorVersion,
    pub tli: TimeLineID,
    pub seg_size: usize,
    pub blcksz: usize,
    pub sysid: u64,
    segments: Vec<(XLogSegNo, Vec<u8>)>,
    pos: usize,
    prev_lsn: Lsn,
}

impl WalGenerator {
    pub fn new(
        version: PgMajorVersion,
        tli: TimeLineID,
        start_segno: XLogSegNo,
        seg_size: usize,
    ) -> WalGenerator {
        let mut gen = WalGenerator {
            version,
            tli,
            seg_size,
            blcksz: XLOG_BLCKSZ,
            sysid: 0x4645_4D43_4241_4D42,
            segments: Vec::new(),
            pos: 0,
            prev_lsn: Lsn(0),
        };
        gen.start_segment(start_segno, 0);
        gen
    }

    fn start_segment(&mut self, segno: XLogSegNo, rem: usize) {
        let mut buf = vec![0u8; self.seg_size];
        let hdr = XLogLongPageHeaderData {
            std: XLogPageHeaderData {
                xlp_magic: self.version.magic(),
                xlp_info: pg_constants::XLP_LONG_HEADER
                    | if rem > 0 {
                        pg_constants::XLP_FIRST_IS_CONTRECORD
                    } else {
                        0
                    },
                xlp_tli: self.tli,
                xlp_pageaddr: segno * self.seg_size as u64,
                xlp_rem_len: rem as u32,
            },
            xlp_sysid: self.sysid,
            xlp_seg_size: self.seg_size as u32,
            xlp_xlog_blcksz: self.blcksz as u32,
        };
        buf[..XLOG_SIZE_OF_XLOG_LONG_PHD].copy_from_slice(&hdr.encode());
        self.segments.push((segno, buf));
        self.pos = XLOG_SIZE_OF_XLOG_LONG_PHD;
    }

    /// If the write position sits on a page or segment boundary, emit the
    /// appropriate header. `rem` is the number of bytes of an in-progress
    /// record still to be written (0 between records).
    fn open_boundary(&mut self, rem: usize) {
        if self.pos == self.seg_size {
            let next = self.segments.last().unwrap().0 + 1;
            self.start_segment(next, rem);
        } else if self.pos % self.blcksz == 0 {
            let hdr = XLogPageHeaderData {
                xlp_magic: self.version.magic(),
                xlp_info: if rem > 0 {
                    pg_constants::XLP_FIRST_IS_CONTRECORD
                } else {
                    0
                },
                xlp_tli: self.tli,
                xlp_pageaddr: self.cur_segno() * self.seg_size as u64 + self.pos as u64,
                xlp_rem_len: rem as u32,
            };
            let buf = &mut self.segments.last_mut().unwrap().1;
            buf[self.pos..self.pos + XLOG_SIZE_OF_XLOG_SHORT_PHD].copy_from_slice(&hdr.encode());
            self.pos += XLOG_SIZE_OF_XLOG_SHORT_PHD;
        }
    }

    fn cur_segno(&self) -> XLogSegNo {
        self.segments.last().unwrap().0
    }

    /// Append one record to the stream. Fills in xl_prev, xl_tot_len, the
    /// CRC and the record's LSN; returns the LSN the record was placed at.
    pub fn append_record(&mut self, rec: &mut DecodedWalRecord) -> Lsn {
        rec.header.xl_prev = self.prev_lsn.0;
        rec.layout.clear();
        rec.recompute_tot_len(self.version);

        self.open_boundary(0);
        let lsn = Lsn(self.cur_segno() * self.seg_size as u64 + self.pos as u64);

        let bytes = rec.encode(self.version);
        let mut off = 0;
        while off < bytes.len() {
            self.open_boundary(bytes.len() - off);
            let room = self.blcksz - self.pos % self.blcksz;
            let n = std::cmp::min(room, bytes.len() - off);
            let pos = self.pos;
            let buf = &mut self.segments.last_mut().unwrap().1;
            buf[pos..pos + n].copy_from_slice(&bytes[off..off + n]);
            self.pos += n;
            off += n;
        }
        self.pos = (self.pos + 7) & !7;

        rec.lsn = lsn;
        self.prev_lsn = lsn;
        lsn
    }

    /// Finish the stream, returning `(file name, raw segment)` pairs.
    pub fn finish(self) -> Vec<(String, Vec<u8>)> {
        let tli = self.tli;
        let seg_size = self.seg_size;
        self.segments
            .into_iter()
            .map(|(segno, buf)| (XLogFileName(tli, segno, seg_size), buf))
            .collect()
    }
}

/// A record with main data only.
pub fn simple_record(
    rmid: u8,
    info: u8,
    xid: TransactionId,
    main_data: &[u8],
    version: PgMajorVersion,
) -> DecodedWalRecord {
    let mut rec = DecodedWalRecord {
        header: XLogRecord {
            xl_xid: xid,
            xl_info: info,
            xl_rmid: rmid,
            ..Default::default()
        },
        main_data: Bytes::copy_from_slice(main_data),
        ..Default::default()
    };
    rec.recompute_tot_len(version);
    rec
}

/// A record with a single block reference carrying block data plus main data.
#[allow(clippy::too_many_arguments)]
pub fn record_with_block(
    rmid: u8,
    info: u8,
    xid: TransactionId,
    rlocator: RelFileLocator,
    blkno: u32,
    block_data: &[u8],
    main_data: &[u8],
    version: PgMajorVersion,
) -> DecodedWalRecord {
    let has_data = !block_data.is_empty();
    let blk = DecodedBkpBlock {
        id: 0,
        rlocator,
        forknum: 0,
        blkno,
        flags: if has_data {
            pg_constants::BKPBLOCK_HAS_DATA
        } else {
            0
        },
        has_data,
        data_len: block_data.len() as u16,
        data: Bytes::copy_from_slice(block_data),
        ..Default::default()
    };
    let mut rec = DecodedWalRecord {
        header: XLogRecord {
            xl_xid: xid,
            xl_info: info,
            xl_rmid: rmid,
            ..Default::default()
        },
        blocks: vec![blk],
        main_data: Bytes::copy_from_slice(main_data),
        ..Default::default()
    };
    rec.recompute_tot_len(version);
    rec
}

/// A record carrying a whole-page full-page image (no hole, uncompressed).
pub fn record_with_fpi(
    rmid: u8,
    info: u8,
    xid: TransactionId,
    rlocator: RelFileLocator,
    blkno: u32,
    page: &[u8],
    version: PgMajorVersion,
) -> DecodedWalRecord {
    assert_eq!(page.len(), BLCKSZ as usize);
    let mut image = BytesMut::with_capacity(page.len());
    image.extend_from_slice(page);
    let apply_bit = if version >= PgMajorVersion::V15 {
        pg_constants::BKPIMAGE_APPLY
    } else {
        pg_constants::BKPIMAGE_APPLY_V14
    };
    let blk = DecodedBkpBlock {
        id: 0,
        rlocator,
        forknum: 0,
        blkno,
        flags: pg_constants::BKPBLOCK_HAS_IMAGE,
        has_image: true,
        apply_image: true,
        bimg_info: apply_bit,
        bimg_len: BLCKSZ,
        hole_offset: 0,
        hole_length: 0,
        bkp_image: image.freeze(),
        ..Default::default()
    };
    let mut rec = DecodedWalRecord {
        header: XLogRecord {
            xl_xid: xid,
            xl_info: info,
            xl_rmid: rmid,
            ..Default::default()
        },
        blocks: vec![blk],
        ..Default::default()
    };
    rec.recompute_tot_len(version);
    rec
}
