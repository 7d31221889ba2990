//
// This file contains common utilities for dealing with PostgreSQL WAL files
// and LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use crate::{TimeLineID, TimestampTz, XLogRecPtr, XLogSegNo};
use std::time::SystemTime;

pub const XLOG_FNAME_LEN: usize = 24;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(
    segno: XLogSegNo,
    offset: u32,
    wal_segsz_bytes: usize,
) -> XLogRecPtr {
    segno * (wal_segsz_bytes as u64) + (offset as u64)
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, log_seg_no: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        log_seg_no / XLogSegmentsPerXLogId(wal_segsz_bytes),
        log_seg_no % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> anyhow::Result<(XLogSegNo, TimeLineID)> {
    if fname.len() == XLOG_FNAME_LEN {
        let tli = u32::from_str_radix(&fname[0..8], 16)?;
        let log = u32::from_str_radix(&fname[8..16], 16)? as XLogSegNo;
        let seg = u32::from_str_radix(&fname[16..24], 16)? as XLogSegNo;
        Ok((log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli))
    } else {
        anyhow::bail!("invalid WAL file name {}", fname);
    }
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname.ends_with(".partial") && IsXLogFileName(&fname[0..fname.len() - 8])
}

#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname.len() == 8 + ".history".len()
        && fname.ends_with(".history")
        && fname[0..8].chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn TimelineHistoryFileName(tli: TimeLineID) -> String {
    format!("{:>08X}.history", tli)
}

/// The current time as a PostgreSQL timestamp (microseconds since 2000-01-01).
pub fn get_current_timestamp() -> TimestampTz {
    to_pg_timestamp(SystemTime::now())
}

pub fn to_pg_timestamp(time: SystemTime) -> TimestampTz {
    const UNIX_EPOCH_JDATE: u64 = 2440588; /* == date2j(1970, 1, 1) */
    const POSTGRES_EPOCH_JDATE: u64 = 2451545; /* == date2j(2000, 1, 1) */
    const SECS_PER_DAY: u64 = 86400;
    const USECS_PER_SEC: u64 = 1000000;
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => {
            ((n.as_secs() - ((POSTGRES_EPOCH_JDATE - UNIX_EPOCH_JDATE) * SECS_PER_DAY))
                * USECS_PER_SEC
                + n.subsec_micros() as u64) as i64
        }
        Err(_) => panic!("SystemTime before UNIX EPOCH!"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WAL_SEGMENT_SIZE;

    #[test]
    fn test_filename_round_trip() {
        let name = XLogFileName(3, 0x1_0000_0007, WAL_SEGMENT_SIZE);
        assert_eq!(name, "000000030000000100000007");
        let (segno, tli) = XLogFromFileName(&name, WAL_SEGMENT_SIZE).unwrap();
        assert_eq!(tli, 3);
        assert_eq!(segno, 0x1_0000_0007);
    }

    #[test]
    fn test_filename_classification() {
        assert!(IsXLogFileName("000000010000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000000Z"));
        assert!(IsPartialXLogFileName("000000010000000000000001.partial"));
        assert!(!IsPartialXLogFileName("000000010000000000000001"));
        assert!(IsTLHistoryFileName("00000002.history"));
        assert!(!IsTLHistoryFileName("0000002.history"));
        assert_eq!(TimelineHistoryFileName(2), "00000002.history");
    }

    #[test]
    fn test_segment_math() {
        // 16 MiB segments: 256 segments per xlog id
        assert_eq!(XLogSegmentsPerXLogId(WAL_SEGMENT_SIZE), 256);
        assert_eq!(
            XLogSegNoOffsetToRecPtr(5, 0x10, WAL_SEGMENT_SIZE),
            5 * WAL_SEGMENT_SIZE as u64 + 0x10
        );
        assert!(XLogFromFileName("garbage", WAL_SEGMENT_SIZE).is_err());
    }
}
