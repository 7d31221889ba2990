//!
//! Rewrite WAL files with selected records turned into NOOPs.
//!
//! Filtering never changes a record's length: a filtered record keeps its
//! `xl_tot_len`, so the `xl_prev` back-links of every following record stay
//! valid and the output segments are byte-length-identical to the input.
//! Only the mutated records' CRCs are recomputed.
//!

use std::collections::HashSet;

use postgres_ffi::pg_constants;
use postgres_ffi::TransactionId;
use tracing::info;

use wal_decoder::walfile::WalFileSet;
use wal_decoder::WalDecodeError;

/// What to NOOP.
#[derive(Clone, Debug)]
pub enum FilterPredicate {
    /// Two passes: find every transaction that performed a HEAP DELETE, then
    /// NOOP all records belonging to those transactions.
    DeleteTransactions,
    /// NOOP all records belonging to the given transactions.
    Transactions(Vec<TransactionId>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub records_seen: usize,
    pub records_filtered: usize,
    pub transactions: usize,
}

fn is_heap_delete(rec: &wal_decoder::DecodedWalRecord) -> bool {
    rec.header.xl_rmid == pg_constants::RM_HEAP_ID
        && rec.header.xl_info & pg_constants::XLOG_HEAP_OPMASK == pg_constants::XLOG_HEAP_DELETE
}

/// Collect the transactions selected by the predicate.
pub fn collect_xids(set: &WalFileSet, predicate: &FilterPredicate) -> HashSet<TransactionId> {
    match predicate {
        FilterPredicate::Transactions(xids) => xids.iter().copied().collect(),
        FilterPredicate::DeleteTransactions => {
            let mut xids = HashSet::new();
            for rec in set.records() {
                if is_heap_delete(rec) {
                    xids.extend(rec.effective_xids());
                }
            }
            xids.remove(&pg_constants::INVALID_TRANSACTION_ID);
            xids
        }
    }
}

/// Apply the filter in place: matching records become XLOG NOOPs of
/// unchanged length, and their segment images are patched.
pub fn filter_wal_files(
    set: &mut WalFileSet,
    predicate: &FilterPredicate,
) -> Result<FilterSummary, WalDecodeError> {
    let xids = collect_xids(set, predicate);
    let mut summary = FilterSummary {
        transactions: xids.len(),
        ..Default::default()
    };

    for file_idx in 0..set.files.len() {
        for rec_idx in 0..set.files[file_idx].records.len() {
            summary.records_seen += 1;
            let rec = &set.files[file_idx].records[rec_idx];
            let matches = rec.effective_xids().any(|xid| xids.contains(&xid));
            let already_noop = rec.header.xl_rmid == pg_constants::RM_XLOG_ID
                && rec.header.xl_info == pg_constants::XLOG_NOOP;
            if !matches || already_noop {
                continue;
            }
            let rec = &mut set.files[file_idx].records[rec_idx];
            rec.make_noop();
            let patched = rec.clone();
            set.patch_record(&patched)?;
            summary.records_filtered += 1;
        }
    }

    info!(
        "filtered {} of {} records across {} transactions",
        summary.records_filtered, summary.records_seen, summary.transactions
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::{PgMajorVersion, RelFileLocator, WAL_SEGMENT_SIZE};
    use wal_decoder::test_utils::{record_with_block, simple_record, WalGenerator};
    use wal_decoder::walfile::WalFile;

    fn rel() -> RelFileLocator {
        RelFileLocator {
            spc_oid: 1663,
            db_oid: 5,
            rel_number: 16384,
        }
    }

    fn build_segment_with_deletes() -> (String, Vec<u8>, Vec<u32>) {
        let mut gen = WalGenerator::new(PgMajorVersion::V16, 1, 1, WAL_SEGMENT_SIZE);
        let mut delete_xids = Vec::new();
        for i in 0..50u32 {
            let xid = 1000 + i;
            let mut rec = if i % 10 == 3 {
                delete_xids.push(xid);
                record_with_block(
                    pg_constants::RM_HEAP_ID,
                    pg_constants::XLOG_HEAP_DELETE,
                    xid,
                    rel(),
                    i,
                    &[1, 2, 3, 4],
                    &[9; 8],
                    PgMajorVersion::V16,
                )
            } else if i % 10 == 7 {
                // a record of the same transaction as the preceding delete
                record_with_block(
                    pg_constants::RM_HEAP_ID,
                    pg_constants::XLOG_HEAP_INSERT,
                    1000 + i - 4,
                    rel(),
                    i,
                    &[5, 6],
                    &[8; 4],
                    PgMajorVersion::V16,
                )
            } else {
                simple_record(
                    pg_constants::RM_XLOG_ID,
                    pg_constants::XLOG_NEXTOID,
                    xid,
                    &[i as u8; 12],
                    PgMajorVersion::V16,
                )
            };
            gen.append_record(&mut rec);
        }
        let (name, raw) = gen.finish().into_iter().next().unwrap();
        (name, raw, delete_xids)
    }

    #[test]
    fn delete_filter_preserves_length_and_noops_matches() {
        let (name, raw, delete_xids) = build_segment_with_deletes();
        let original = raw.clone();
        let (file, _) = WalFile::parse(&name, raw, None).unwrap();
        let mut set = WalFileSet { files: vec![file] };

        let summary = filter_wal_files(&mut set, &FilterPredicate::DeleteTransactions).unwrap();
        assert_eq!(summary.transactions, delete_xids.len());
        // one DELETE plus one same-xid INSERT per filtered transaction
        assert_eq!(summary.records_filtered, delete_xids.len() * 2);

        // total byte length unchanged
        assert_eq!(set.files[0].raw.len(), original.len());

        // re-parse the rewritten image: every record decodes, the filtered
        // ones as XLOG NOOPs with correct CRCs, the rest byte-identical
        let patched = set.files[0].raw.clone();
        let (reparsed, _) = WalFile::parse(&name, patched, None).unwrap();
        assert!(reparsed.errors.is_empty(), "{:?}", reparsed.errors);
        assert_eq!(reparsed.records.len(), 50);
        let mut noops = 0;
        for rec in &reparsed.records {
            if delete_xids.contains(&rec.header.xl_xid) {
                assert_eq!(rec.header.xl_rmid, pg_constants::RM_XLOG_ID);
                assert_eq!(rec.header.xl_info, pg_constants::XLOG_NOOP);
                noops += 1;
            }
        }
        assert_eq!(noops, delete_xids.len() * 2);

        // untouched records kept their exact bytes
        let (original_parse, _) = WalFile::parse(&name, original, None).unwrap();
        for (before, after) in original_parse.records.iter().zip(&reparsed.records) {
            if !delete_xids.contains(&before.header.xl_xid) {
                assert_eq!(
                    before.encode(PgMajorVersion::V16),
                    after.encode(PgMajorVersion::V16)
                );
            }
        }
    }

    #[test]
    fn explicit_xid_list_filter() {
        let (name, raw, _) = build_segment_with_deletes();
        let (file, _) = WalFile::parse(&name, raw, None).unwrap();
        let mut set = WalFileSet { files: vec![file] };
        let summary =
            filter_wal_files(&mut set, &FilterPredicate::Transactions(vec![1005, 1006])).unwrap();
        assert_eq!(summary.records_filtered, 2);
        assert_eq!(summary.transactions, 2);
    }
}
