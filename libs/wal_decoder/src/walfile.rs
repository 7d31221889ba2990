//!
//! Reading and rewriting whole WAL segment files.
//!
//! A segment is a sequence of `xlp_xlog_blcksz`-byte pages. The first page
//! starts with a long header carrying the magic, segment size and timeline;
//! every later page starts with a short header whose `xlp_rem_len` says how
//! many bytes of a record straddling the page boundary continue here.
//! Records are 8-byte aligned and may cross page *and* segment boundaries;
//! the unfinished tail of a segment is carried to the next one as a
//! [`PartialRecord`].
//!

use std::cmp::min;

use bytes::Bytes;

use postgres_ffi::{
    PgMajorVersion, TimeLineID, XLogFromFileName, XLogLongPageHeaderData, XLogPageHeaderData,
    XLogRecord, XLogSegNo, XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD,
    XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use utils::lsn::Lsn;

use crate::{decode_wal_record, DecodedWalRecord, WalDecodeError};

/// An unfinished record carried across a segment boundary: whatever bytes of
/// the 24-byte header and of the payload had been read when the segment ran
/// out.
#[derive(Clone, Debug)]
pub struct PartialRecord {
    pub header_buf: Vec<u8>,
    pub data_buf: Vec<u8>,
    /// LSN of the first byte of the record.
    pub lsn: Lsn,
}

impl PartialRecord {
    /// How many bytes of the record have been read so far.
    pub fn total_read(&self) -> usize {
        self.header_buf.len() + self.data_buf.len()
    }
}

/// A parsed WAL segment: headers, the records that begin in it, and the raw
/// image for in-place rewriting.
pub struct WalFile {
    pub version: PgMajorVersion,
    pub segno: XLogSegNo,
    pub tli: TimeLineID,
    pub long_header: XLogLongPageHeaderData,
    /// Short headers of pages 1.., in page order, as far as the walk got.
    pub page_headers: Vec<XLogPageHeaderData>,
    /// Records fully assembled while walking this segment. A record carried
    /// over from the previous segment appears here with its original LSN.
    pub records: Vec<DecodedWalRecord>,
    /// Per-record decode failures. The walk resynchronizes at the next page
    /// boundary after each of them.
    pub errors: Vec<(Lsn, WalDecodeError)>,
    /// The original segment image. Patched in place by [`WalFileSet::patch_record`].
    pub raw: Vec<u8>,
    /// Segment offset at which valid WAL data ends (zero padding follows).
    pub end_of_wal: usize,
}

impl WalFile {
    pub fn seg_size(&self) -> usize {
        self.long_header.xlp_seg_size as usize
    }

    pub fn block_size(&self) -> usize {
        self.long_header.xlp_xlog_blcksz as usize
    }

    /// The canonical file name of this segment.
    pub fn file_name(&self) -> String {
        postgres_ffi::XLogFileName(self.tli, self.segno, self.seg_size())
    }

    /// Parse one segment file. `fname` is the bare segment file name (a
    /// trailing `.partial` is tolerated); `carry` is the unfinished record
    /// from the preceding segment, if any.
    pub fn parse(
        fname: &str,
        raw: Vec<u8>,
        carry: Option<PartialRecord>,
    ) -> Result<(WalFile, Option<PartialRecord>), WalDecodeError> {
        if raw.len() < XLOG_SIZE_OF_XLOG_LONG_PHD {
            return Err(WalDecodeError::ShortData("segment long header"));
        }
        let mut hdr_bytes = &raw[..];
        let long_header = XLogLongPageHeaderData::from_bytes(&mut hdr_bytes)
            .map_err(|_| WalDecodeError::ShortData("segment long header"))?;
        let version = PgMajorVersion::from_magic(long_header.std.xlp_magic)?;
        if !long_header.std.is_long_header() {
            return Err(WalDecodeError::HeaderInconsistent(
                "first page of segment lacks the long-header flag".into(),
            ));
        }

        let seg_size = long_header.xlp_seg_size as usize;
        let blcksz = long_header.xlp_xlog_blcksz as usize;
        let base_name = fname.strip_suffix(".partial").unwrap_or(fname);
        let (segno, tli) = XLogFromFileName(base_name, seg_size)
            .map_err(|e| WalDecodeError::HeaderInconsistent(e.to_string()))?;
        let base_lsn = segno * seg_size as u64;
        if long_header.std.xlp_pageaddr != base_lsn {
            return Err(WalDecodeError::HeaderInconsistent(format!(
                "long header page address {:#x} does not match segment {:#x}",
                long_header.std.xlp_pageaddr, base_lsn
            )));
        }

        let mut wal_file = WalFile {
            version,
            segno,
            tli,
            long_header,
            page_headers: Vec::new(),
            records: Vec::new(),
            errors: Vec::new(),
            end_of_wal: raw.len(),
            raw,
        };

        let carry_out = wal_file.walk(carry, base_lsn, blcksz)?;
        Ok((wal_file, carry_out))
    }

    fn walk(
        &mut self,
        carry: Option<PartialRecord>,
        base_lsn: u64,
        blcksz: usize,
    ) -> Result<Option<PartialRecord>, WalDecodeError> {
        let magic = self.long_header.std.xlp_magic;
        let mut cursor = SegCursor {
            raw: &self.raw,
            blcksz,
            pos: XLOG_SIZE_OF_XLOG_LONG_PHD,
            magic,
            page_headers: &mut self.page_headers,
        };
        let mut last_lsn: Option<Lsn> = None;
        let rem = self.long_header.std.xlp_rem_len as usize;

        if let Some(mut partial) = carry {
            if rem == 0 {
                // The previous segment ended mid-record but this one does not
                // continue it. The stream is inconsistent; drop the carry.
                self.errors.push((
                    partial.lsn,
                    WalDecodeError::HeaderInconsistent(
                        "continuation record expected but xlp_rem_len is zero".into(),
                    ),
                ));
            } else {
                // The long header's xlp_rem_len is authoritative for how many
                // of this segment's first bytes belong to the carried record.
                let mut to_read = rem;
                while to_read > 0 && !cursor.at_end() {
                    if partial.header_buf.len() < XLOG_SIZE_OF_XLOG_RECORD {
                        let need =
                            min(XLOG_SIZE_OF_XLOG_RECORD - partial.header_buf.len(), to_read);
                        let got = cursor.read_up_to(need, &mut partial.header_buf)?;
                        to_read -= got;
                        if got < need {
                            break;
                        }
                    } else {
                        let got = cursor.read_up_to(to_read, &mut partial.data_buf)?;
                        to_read -= got;
                        if got == 0 {
                            break;
                        }
                    }
                }
                if to_read > 0 {
                    // The record spans yet another segment.
                    self.end_of_wal = cursor.pos;
                    return Ok(Some(partial));
                }
                cursor.align8();
                match finish_partial(partial, self.version) {
                    Ok(rec) => {
                        last_lsn = Some(rec.lsn);
                        self.records.push(rec);
                    }
                    Err((lsn, e)) => self.errors.push((lsn, e)),
                }
            }
        } else if rem > 0 {
            // We never saw the start of the record continuing here; skip it.
            let mut sink = Vec::new();
            cursor.read_up_to(rem, &mut sink)?;
            cursor.align8();
        }

        loop {
            if cursor.at_end() {
                self.end_of_wal = cursor.pos;
                return Ok(None);
            }
            // A zeroed page header marks the end of valid WAL: segments are
            // preallocated with zeros and only written up to the insert point.
            if cursor.pos % blcksz == 0 && cursor.peek_zero_page() {
                self.end_of_wal = cursor.pos;
                return Ok(None);
            }
            cursor.skip_page_header_if_needed()?;
            if cursor.at_end() {
                self.end_of_wal = cursor.pos;
                return Ok(None);
            }
            let record_start = cursor.pos;
            let lsn = Lsn(base_lsn + record_start as u64);

            let mut header_buf = Vec::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
            let got = cursor.read_up_to(4, &mut header_buf)?;
            if got < 4 {
                self.end_of_wal = record_start;
                if header_buf.iter().any(|&b| b != 0) {
                    return Ok(Some(PartialRecord {
                        header_buf,
                        data_buf: Vec::new(),
                        lsn,
                    }));
                }
                return Ok(None);
            }
            let tot_len = u32::from_le_bytes(header_buf[0..4].try_into().unwrap()) as usize;
            if tot_len == 0 {
                // Zeroes: the end of valid WAL in this segment.
                self.end_of_wal = record_start;
                return Ok(None);
            }
            if tot_len < XLOG_SIZE_OF_XLOG_RECORD {
                self.errors.push((
                    lsn,
                    WalDecodeError::HeaderInconsistent(format!(
                        "invalid record length {tot_len}"
                    )),
                ));
                self.end_of_wal = record_start;
                return Ok(None);
            }

            cursor.read_up_to(XLOG_SIZE_OF_XLOG_RECORD - 4, &mut header_buf)?;
            if header_buf.len() < XLOG_SIZE_OF_XLOG_RECORD {
                self.end_of_wal = record_start;
                return Ok(Some(PartialRecord {
                    header_buf,
                    data_buf: Vec::new(),
                    lsn,
                }));
            }
            let mut data_buf = Vec::with_capacity(tot_len - XLOG_SIZE_OF_XLOG_RECORD);
            cursor.read_up_to(tot_len - XLOG_SIZE_OF_XLOG_RECORD, &mut data_buf)?;
            if data_buf.len() < tot_len - XLOG_SIZE_OF_XLOG_RECORD {
                self.end_of_wal = record_start;
                return Ok(Some(PartialRecord {
                    header_buf,
                    data_buf,
                    lsn,
                }));
            }
            cursor.align8();

            let header = XLogRecord::from_slice(&header_buf)
                .map_err(|_| WalDecodeError::ShortData("record header"))?;
            if let Some(prev) = last_lsn {
                if header.xl_prev != prev.0 {
                    // A broken back-link means we ran into stale bytes from a
                    // recycled segment; treat it as the end of WAL.
                    self.errors.push((
                        lsn,
                        WalDecodeError::HeaderInconsistent(format!(
                            "xl_prev {:X}/{:X} does not match previous record at {}",
                            header.xl_prev >> 32,
                            header.xl_prev & 0xffffffff,
                            prev
                        )),
                    ));
                    self.end_of_wal = record_start;
                    return Ok(None);
                }
            }

            let mut full = header_buf;
            full.extend_from_slice(&data_buf);
            match decode_wal_record(Bytes::from(full), self.version) {
                Ok(mut rec) => {
                    rec.lsn = lsn;
                    last_lsn = Some(lsn);
                    self.records.push(rec);
                }
                Err(e) => {
                    self.errors.push((lsn, e));
                    // Resynchronize at the next page boundary; its header
                    // tells how much of the broken record to skip.
                    let next_page = (record_start / blcksz + 1) * blcksz;
                    if next_page >= cursor.raw.len() {
                        self.end_of_wal = cursor.raw.len();
                        return Ok(None);
                    }
                    cursor.pos = next_page;
                    cursor.skip_page_header_if_needed()?;
                    if let Some(hdr) = cursor.page_headers.last() {
                        let skip = hdr.xlp_rem_len as usize;
                        let mut sink = Vec::new();
                        cursor.read_up_to(skip, &mut sink)?;
                        cursor.align8();
                    }
                    last_lsn = None;
                }
            }
        }
    }
}

fn finish_partial(
    partial: PartialRecord,
    version: PgMajorVersion,
) -> Result<DecodedWalRecord, (Lsn, WalDecodeError)> {
    let lsn = partial.lsn;
    let header = XLogRecord::from_slice(&partial.header_buf)
        .map_err(|_| (lsn, WalDecodeError::ShortData("carried record header")))?;
    let expected = header.xl_tot_len as usize - XLOG_SIZE_OF_XLOG_RECORD;
    if partial.data_buf.len() != expected {
        return Err((
            lsn,
            WalDecodeError::HeaderInconsistent(format!(
                "carried record has {} payload bytes, header wants {}",
                partial.data_buf.len(),
                expected
            )),
        ));
    }
    let mut full = partial.header_buf;
    full.extend_from_slice(&partial.data_buf);
    match decode_wal_record(Bytes::from(full), version) {
        Ok(mut rec) => {
            rec.lsn = lsn;
            Ok(rec)
        }
        Err(e) => Err((lsn, e)),
    }
}

/// Byte cursor over a raw segment that skips page headers transparently and
/// collects them on the way.
struct SegCursor<'a> {
    raw: &'a [u8],
    blcksz: usize,
    pos: usize,
    magic: u16,
    page_headers: &'a mut Vec<XLogPageHeaderData>,
}

impl SegCursor<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.raw.len()
    }

    /// Is the page starting at the current position still all-zero (never
    /// written)? Only meaningful with `pos` on a page boundary.
    fn peek_zero_page(&self) -> bool {
        let end = min(self.pos + XLOG_SIZE_OF_XLOG_SHORT_PHD, self.raw.len());
        self.raw[self.pos..end].iter().all(|&b| b == 0)
    }

    fn align8(&mut self) {
        self.pos = (self.pos + 7) & !7;
    }

    fn skip_page_header_if_needed(&mut self) -> Result<(), WalDecodeError> {
        if self.pos > 0 && self.pos % self.blcksz == 0 && !self.at_end() {
            let end = self.pos + XLOG_SIZE_OF_XLOG_SHORT_PHD;
            if end > self.raw.len() {
                return Err(WalDecodeError::ShortData("page header"));
            }
            let mut slice = &self.raw[self.pos..end];
            let hdr = XLogPageHeaderData::from_bytes(&mut slice)
                .map_err(|_| WalDecodeError::ShortData("page header"))?;
            if hdr.xlp_magic != self.magic {
                return Err(WalDecodeError::InvalidMagic(postgres_ffi::UnknownMagic(
                    hdr.xlp_magic,
                )));
            }
            self.page_headers.push(hdr);
            self.pos = end;
        }
        Ok(())
    }

    /// Append up to `n` logical record bytes to `out`, stopping early only at
    /// the end of the segment. Returns the number of bytes read.
    fn read_up_to(&mut self, n: usize, out: &mut Vec<u8>) -> Result<usize, WalDecodeError> {
        let mut got = 0;
        while got < n && !self.at_end() {
            self.skip_page_header_if_needed()?;
            if self.at_end() {
                break;
            }
            let room = self.blcksz - self.pos % self.blcksz;
            let take = min(n - got, min(room, self.raw.len() - self.pos));
            out.extend_from_slice(&self.raw[self.pos..self.pos + take]);
            self.pos += take;
            got += take;
        }
        Ok(got)
    }
}

/// An ordered run of parsed segments, with in-place record rewriting.
pub struct WalFileSet {
    pub files: Vec<WalFile>,
}

impl WalFileSet {
    /// Parse a set of raw segments, carrying partial records from one file to
    /// the next. `inputs` are `(file name, bytes)` pairs; they are processed
    /// in ascending segment order.
    pub fn parse(mut inputs: Vec<(String, Vec<u8>)>) -> Result<WalFileSet, WalDecodeError> {
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut files = Vec::with_capacity(inputs.len());
        let mut carry: Option<PartialRecord> = None;
        for (name, raw) in inputs {
            let expected_next = files
                .last()
                .map(|f: &WalFile| f.segno + 1);
            let (file, carry_out) = WalFile::parse(&name, raw, carry.take())?;
            if let Some(expected) = expected_next {
                if file.segno != expected {
                    return Err(WalDecodeError::HeaderInconsistent(format!(
                        "segment {} does not follow segment {}",
                        file.segno,
                        expected - 1
                    )));
                }
            }
            carry = carry_out;
            files.push(file);
        }
        Ok(WalFileSet { files })
    }

    /// Iterate over all assembled records, in LSN order.
    pub fn records(&self) -> impl Iterator<Item = &DecodedWalRecord> {
        self.files.iter().flat_map(|f| f.records.iter())
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DecodedWalRecord> {
        self.files.iter_mut().flat_map(|f| f.records.iter_mut())
    }

    /// Overwrite the segment image(s) holding `rec` with its re-encoded
    /// bytes. The record must keep its original length; this only replaces
    /// content (and the recomputed CRC) in place.
    pub fn patch_record(&mut self, rec: &DecodedWalRecord) -> Result<(), WalDecodeError> {
        let version = self.files[0].version;
        let bytes = rec.encode(version);
        self.write_logical(rec.lsn, &bytes)
    }

    fn write_logical(&mut self, start: Lsn, bytes: &[u8]) -> Result<(), WalDecodeError> {
        let seg_size = self.files[0].seg_size();
        let blcksz = self.files[0].block_size();
        let mut segno = start.segment_number(seg_size);
        let mut off = start.segment_offset(seg_size);
        let mut written = 0usize;
        while written < bytes.len() {
            if off >= seg_size {
                segno += 1;
                off = 0;
            }
            let file = self
                .files
                .iter_mut()
                .find(|f| f.segno == segno)
                .ok_or_else(|| {
                    WalDecodeError::HeaderInconsistent(format!(
                        "record at {start} extends into missing segment {segno}"
                    ))
                })?;
            if off % blcksz == 0 {
                off += if off == 0 {
                    XLOG_SIZE_OF_XLOG_LONG_PHD
                } else {
                    XLOG_SIZE_OF_XLOG_SHORT_PHD
                };
            }
            let room = blcksz - off % blcksz;
            let n = min(bytes.len() - written, min(room, seg_size - off));
            file.raw[off..off + n].copy_from_slice(&bytes[written..written + n]);
            off += n;
            written += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{simple_record, WalGenerator};
    use postgres_ffi::pg_constants;
    use postgres_ffi::WAL_SEGMENT_SIZE;

    fn build_stream(n: usize, payload_len: usize) -> Vec<(String, Vec<u8>)> {
        let mut gen = WalGenerator::new(PgMajorVersion::V16, 1, 1, WAL_SEGMENT_SIZE);
        for i in 0..n {
            let mut rec = simple_record(
                pg_constants::RM_XLOG_ID,
                pg_constants::XLOG_NEXTOID,
                i as u32,
                &vec![i as u8; payload_len],
                PgMajorVersion::V16,
            );
            gen.append_record(&mut rec);
        }
        gen.finish()
    }

    #[test]
    fn walk_single_segment() {
        let files = build_stream(100, 64);
        assert_eq!(files.len(), 1);
        let (name, raw) = files.into_iter().next().unwrap();
        let (wal, carry) = WalFile::parse(&name, raw, None).unwrap();
        assert!(carry.is_none());
        assert!(wal.errors.is_empty());
        assert_eq!(wal.records.len(), 100);
        assert_eq!(wal.records[5].header.xl_xid, 5);
    }

    #[test]
    fn records_cross_page_boundaries() {
        // 8 KiB pages, 5000-byte payloads: most records straddle a page.
        let files = build_stream(200, 5000);
        let set = WalFileSet::parse(files).unwrap();
        assert_eq!(set.records().count(), 200);
        for f in &set.files {
            assert!(f.errors.is_empty());
        }
    }

    #[test]
    fn record_crosses_segment_boundary() {
        // Enough large records to spill into a second segment.
        let n = WAL_SEGMENT_SIZE / 5000 + 10;
        let files = build_stream(n, 5000);
        assert!(files.len() >= 2);

        // Parse the segments one by one, chaining the carry.
        let mut carry = None;
        let mut total = 0;
        let mut saw_carry = false;
        for (name, raw) in files {
            let (wal, c) = WalFile::parse(&name, raw, carry).unwrap();
            assert!(wal.errors.is_empty(), "{:?}", wal.errors);
            total += wal.records.len();
            saw_carry |= c.is_some();
            carry = c;
        }
        assert_eq!(total, n);
        assert!(saw_carry, "no record crossed the segment boundary");
    }

    #[test]
    fn reencoding_is_byte_identical() {
        let files = build_stream(50, 200);
        let (name, raw) = files.into_iter().next().unwrap();
        let original = raw.clone();
        let (wal, _) = WalFile::parse(&name, raw, None).unwrap();
        let mut set = WalFileSet { files: vec![wal] };
        let records: Vec<_> = set.records().cloned().collect();
        for rec in &records {
            set.patch_record(rec).unwrap();
        }
        assert_eq!(set.files[0].raw, original);
    }

    #[test]
    fn xl_prev_break_ends_the_walk() {
        let files = build_stream(10, 64);
        let (name, mut raw) = files.into_iter().next().unwrap();
        // Corrupt xl_prev of the fifth record.
        let (wal, _) = WalFile::parse(&name, raw.clone(), None).unwrap();
        let off = wal.records[5].lsn.segment_offset(WAL_SEGMENT_SIZE);
        raw[off + 8] ^= 0x5A;
        let (broken, carry) = WalFile::parse(&name, raw, None).unwrap();
        assert!(carry.is_none());
        assert_eq!(broken.records.len(), 5);
        assert_eq!(broken.errors.len(), 1);
    }
}
