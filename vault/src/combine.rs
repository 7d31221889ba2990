//!
//! Materialize a full backup out of an incremental chain.
//!
//! An incremental backup stores each changed relation file as
//! `<relfile>.delta` (the changed blocks, concatenated in block-ref-table
//! order) next to `<relfile>.brt` (the table naming those blocks and the
//! relation's length limit). Combining walks the chain from the FULL root to
//! the target: the root's tree is the base, each incremental overlays its
//! delta blocks at `blkno * BLCKSZ` and truncates to the limit when the
//! relation shrank. Files without deltas pass through unchanged.
//!

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use postgres_ffi::BLCKSZ;

use crate::brt::{BlockRefTable, INVALID_BLOCK_NUMBER};
use crate::catalog::{Backup, BackupType, Catalog};

pub const DELTA_SUFFIX: &str = "delta";
pub const BRT_SUFFIX: &str = "brt";

#[derive(Clone, Copy, Debug, Default)]
pub struct CombineStats {
    pub files_copied: usize,
    pub files_reconstructed: usize,
    pub blocks_applied: u64,
}

/// How the combined tree is laid out.
#[derive(Clone, Debug)]
pub enum Materialization {
    /// Single output tree under the given base directory.
    AsIs,
    /// Tablespace trees are placed next to the data dir as
    /// `<server>-<label>-<tablespace>` directories, with `pg_tblspc`
    /// symlinks pointing at them.
    PerTablespace { server: String },
}

/// Combine the chain ending at `target` into a full tree under `output`.
pub fn combine_backup(
    catalog: &Catalog,
    target: &Backup,
    output: &Utf8Path,
    materialization: &Materialization,
) -> anyhow::Result<CombineStats> {
    let chain = catalog.chain(target)?;
    let root = &chain[0];
    anyhow::ensure!(
        root.backup_type == BackupType::Full,
        "chain of {} does not start at a FULL backup",
        target.label
    );
    info!(
        "combining {} backups into {output}: {}",
        chain.len(),
        chain
            .iter()
            .map(|b| b.label.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut stats = CombineStats::default();
    std::fs::create_dir_all(output)?;

    // 1. The FULL backup's tree is the base.
    for subtree in backup_subtrees(&catalog.backup_dir(&root.label))? {
        let dest = subtree_output_dir(output, &subtree, target, materialization);
        copy_tree(&subtree.path, &dest, &mut stats)?;
    }

    // 2. Overlay each incremental, oldest first.
    for inc in &chain[1..] {
        for subtree in backup_subtrees(&catalog.backup_dir(&inc.label))? {
            let dest = subtree_output_dir(output, &subtree, target, materialization);
            apply_incremental_tree(&subtree.path, &dest, &mut stats)
                .with_context(|| format!("applying incremental {}", inc.label))?;
        }
    }

    // 3. Point the tablespace symlinks at the combined tablespace trees.
    // The FULL root defines the tablespace set for the whole chain.
    let link_dir = output.join("data").join("pg_tblspc");
    if link_dir.exists() {
        for subtree in backup_subtrees(&catalog.backup_dir(&root.label))? {
            let Some(oid) = subtree.tablespace_oid else {
                continue;
            };
            let link = link_dir.join(oid.to_string());
            if std::fs::symlink_metadata(&link).is_ok() {
                std::fs::remove_file(&link)?;
            }
            let target_dir = subtree_output_dir(output, &subtree, target, materialization);
            let link_target = match materialization {
                Materialization::AsIs => {
                    Utf8PathBuf::from("../..").join(target_dir.file_name().unwrap())
                }
                Materialization::PerTablespace { .. } => target_dir,
            };
            std::os::unix::fs::symlink(&link_target, &link)?;
        }
    }

    info!(
        "combine done: {} files copied, {} reconstructed, {} blocks applied",
        stats.files_copied, stats.files_reconstructed, stats.blocks_applied
    );
    Ok(stats)
}

struct Subtree {
    path: Utf8PathBuf,
    name: String,
    tablespace_oid: Option<u32>,
}

/// The `data/` tree plus any `tblspc_<oid>/` trees of a backup directory.
fn backup_subtrees(backup_dir: &Utf8Path) -> anyhow::Result<Vec<Subtree>> {
    let mut subtrees = Vec::new();
    for entry in backup_dir
        .read_dir_utf8()
        .with_context(|| format!("reading backup directory {backup_dir}"))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string();
        if name == crate::catalog::BACKUP_DATA {
            subtrees.push(Subtree {
                path: entry.path().to_path_buf(),
                name,
                tablespace_oid: None,
            });
        } else if let Some(oid) = name.strip_prefix("tblspc_") {
            subtrees.push(Subtree {
                path: entry.path().to_path_buf(),
                tablespace_oid: oid.parse().ok(),
                name,
            });
        }
    }
    subtrees.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(subtrees)
}

fn subtree_output_dir(
    output: &Utf8Path,
    subtree: &Subtree,
    target: &Backup,
    materialization: &Materialization,
) -> Utf8PathBuf {
    if subtree.tablespace_oid.is_none() {
        return output.join(&subtree.name);
    }
    match materialization {
        Materialization::AsIs => output.join(&subtree.name),
        Materialization::PerTablespace { server } => output.join(format!(
            "{server}-{label}-{name}",
            label = target.label,
            name = subtree.name
        )),
    }
}

fn copy_tree(src: &Utf8Path, dst: &Utf8Path, stats: &mut CombineStats) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let path = Utf8Path::from_path(entry.path())
            .context("non-utf8 path in backup tree")?;
        let relative = path.strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            // pg_tblspc links are recreated at the end; skip what the
            // backup carried.
            continue;
        } else {
            std::fs::copy(path, &target)?;
            stats.files_copied += 1;
        }
    }
    Ok(())
}

/// Overlay one incremental subtree: plain files replace their counterpart,
/// delta files are applied block-by-block through their block-ref table.
fn apply_incremental_tree(
    src: &Utf8Path,
    dst: &Utf8Path,
    stats: &mut CombineStats,
) -> anyhow::Result<()> {
    // Collect first so deltas apply in a deterministic relation order.
    let mut plain = Vec::new();
    let mut deltas = Vec::new();
    for entry in walkdir::WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let path = Utf8Path::from_path(entry.path())
            .context("non-utf8 path in backup tree")?
            .to_path_buf();
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(dst.join(path.strip_prefix(src)?))?;
            continue;
        }
        if entry.file_type().is_symlink() {
            continue;
        }
        match path.extension() {
            Some(DELTA_SUFFIX) => deltas.push(path),
            Some(BRT_SUFFIX) => {} // consumed together with its delta
            _ => plain.push(path),
        }
    }

    for path in plain {
        let relative = path.strip_prefix(src)?;
        std::fs::copy(&path, dst.join(relative))?;
        stats.files_copied += 1;
    }

    // Deterministic (spcOid, dbOid, relNumber, fork) order: the serialized
    // tables are already sorted, so sort the delta list by their first entry.
    let mut keyed = Vec::with_capacity(deltas.len());
    for path in deltas {
        let brt_path = path.with_extension(BRT_SUFFIX);
        let table = BlockRefTable::read_file(&brt_path)
            .with_context(|| format!("loading block-ref table {brt_path}"))?;
        let key = table.iter().next().map(|(k, _)| *k);
        keyed.push((key, path, table));
    }
    keyed.sort_by_key(|(key, _, _)| *key);

    for (_key, delta_path, table) in keyed {
        let relative = delta_path.strip_prefix(src)?.with_extension("");
        let target_path = dst.join(&relative);
        apply_delta(&delta_path, &table, &target_path, stats)
            .with_context(|| format!("reconstructing {target_path}"))?;
        stats.files_reconstructed += 1;
    }
    Ok(())
}

fn apply_delta(
    delta_path: &Utf8Path,
    table: &BlockRefTable,
    target_path: &Utf8Path,
    stats: &mut CombineStats,
) -> anyhow::Result<()> {
    let mut delta = std::fs::File::open(delta_path)?;
    let mut target = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(target_path)?;
    let mut page = vec![0u8; BLCKSZ as usize];

    for ((rlocator, forknum), entry) in table.iter() {
        let limit = entry.limit_block;
        let stop = if limit == INVALID_BLOCK_NUMBER {
            u32::MAX
        } else {
            limit
        };
        debug!(
            "applying delta for {rlocator} fork {forknum} (limit {limit:#x}) onto {target_path}"
        );
        for blkno in entry.blocks_in_range(0, stop) {
            delta.read_exact(&mut page).with_context(|| {
                format!("delta {delta_path} ended early at block {blkno}")
            })?;
            target.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64))?;
            target.write_all(&page)?;
            stats.blocks_applied += 1;
        }
        if limit != INVALID_BLOCK_NUMBER {
            let limit_bytes = limit as u64 * BLCKSZ as u64;
            if target.metadata()?.len() > limit_bytes {
                target.set_len(limit_bytes)?;
            }
        }
    }
    target.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::RelFileLocator;
    use utils::lsn::Lsn;

    const PAGE: usize = BLCKSZ as usize;

    fn page_of(tag: u8) -> Vec<u8> {
        vec![tag; PAGE]
    }

    fn write_backup(catalog: &Catalog, label: &str, parent: Option<&str>) -> Backup {
        let mut b = match parent {
            None => Backup::new_full(label.to_string()),
            Some(p) => Backup::new_incremental(label.to_string(), p.to_string()),
        };
        b.valid = true;
        b.wal = "000000010000000000000001".to_string();
        b.start_lsn = Lsn(0x1000000);
        b.end_lsn = Lsn(0x1000100);
        catalog.write_info(&b).unwrap();
        b
    }

    fn rel() -> RelFileLocator {
        RelFileLocator {
            spc_oid: 1663,
            db_oid: 5,
            rel_number: 16384,
        }
    }

    /// FULL holds 100 blocks; the first incremental modifies block 50 and
    /// extends the relation to 120 blocks; the second truncates it to 80.
    /// The combined result has 80 blocks: block 50 from the first
    /// incremental, everything else from the FULL backup.
    #[test]
    fn combine_chain_with_extension_and_truncation() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(scratch.path().join("backup"));

        // FULL: relation of 100 blocks, each filled with its index
        let full = write_backup(&catalog, "20250101000000", None);
        let full_rel_dir = catalog.data_dir(&full.label).join("base/5");
        std::fs::create_dir_all(&full_rel_dir).unwrap();
        let mut content = Vec::new();
        for i in 0..100u8 {
            content.extend_from_slice(&page_of(i));
        }
        std::fs::write(full_rel_dir.join("16384"), &content).unwrap();

        // INC1: block 50 changed, relation extended to 120 blocks
        let inc1 = write_backup(&catalog, "20250102000000", Some(&full.label));
        let inc1_rel_dir = catalog.data_dir(&inc1.label).join("base/5");
        std::fs::create_dir_all(&inc1_rel_dir).unwrap();
        let mut table = BlockRefTable::new();
        table.mark_block_modified(rel(), 0, 50);
        for blkno in 100..120 {
            table.mark_block_modified(rel(), 0, blkno);
        }
        table.set_limit_block(rel(), 0, 120);
        table.write_file(&inc1_rel_dir.join("16384.brt")).unwrap();
        let mut delta = page_of(0xAA); // block 50
        for _ in 100..120 {
            delta.extend_from_slice(&page_of(0xBB));
        }
        std::fs::write(inc1_rel_dir.join("16384.delta"), &delta).unwrap();

        // INC2: pure truncation to 80 blocks
        let inc2 = write_backup(&catalog, "20250103000000", Some(&inc1.label));
        let inc2_rel_dir = catalog.data_dir(&inc2.label).join("base/5");
        std::fs::create_dir_all(&inc2_rel_dir).unwrap();
        let mut table = BlockRefTable::new();
        table.set_limit_block(rel(), 0, 80);
        table.write_file(&inc2_rel_dir.join("16384.brt")).unwrap();
        std::fs::write(inc2_rel_dir.join("16384.delta"), b"").unwrap();

        let output = scratch.path().join("restored");
        let stats =
            combine_backup(&catalog, &inc2, &output, &Materialization::AsIs).unwrap();
        assert_eq!(stats.files_reconstructed, 2);

        let combined = std::fs::read(output.join("data/base/5/16384")).unwrap();
        assert_eq!(combined.len(), 80 * PAGE);
        assert_eq!(combined[50 * PAGE], 0xAA, "block 50 comes from INC1");
        assert_eq!(combined[49 * PAGE], 49, "block 49 comes from FULL");
        assert_eq!(combined[51 * PAGE], 51, "block 51 comes from FULL");
        assert_eq!(combined[79 * PAGE], 79);
    }

    #[test]
    fn later_incremental_overrides_earlier_block() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(scratch.path().join("backup"));

        let full = write_backup(&catalog, "20250101000000", None);
        let dir = catalog.data_dir(&full.label).join("base/5");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("16384"), [page_of(1), page_of(2)].concat()).unwrap();

        let inc1 = write_backup(&catalog, "20250102000000", Some(&full.label));
        let dir = catalog.data_dir(&inc1.label).join("base/5");
        std::fs::create_dir_all(&dir).unwrap();
        let mut table = BlockRefTable::new();
        table.mark_block_modified(rel(), 0, 1);
        table.write_file(&dir.join("16384.brt")).unwrap();
        std::fs::write(dir.join("16384.delta"), page_of(0xA1)).unwrap();

        let inc2 = write_backup(&catalog, "20250103000000", Some(&inc1.label));
        let dir = catalog.data_dir(&inc2.label).join("base/5");
        std::fs::create_dir_all(&dir).unwrap();
        let mut table = BlockRefTable::new();
        table.mark_block_modified(rel(), 0, 1);
        table.write_file(&dir.join("16384.brt")).unwrap();
        std::fs::write(dir.join("16384.delta"), page_of(0xA2)).unwrap();

        let output = scratch.path().join("restored");
        combine_backup(&catalog, &inc2, &output, &Materialization::AsIs).unwrap();
        let combined = std::fs::read(output.join("data/base/5/16384")).unwrap();
        assert_eq!(combined[0], 1);
        assert_eq!(combined[PAGE], 0xA2, "the newest incremental wins");
    }

    #[test]
    fn plain_files_pass_through_and_override() {
        let scratch = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(scratch.path().join("backup"));

        let full = write_backup(&catalog, "20250101000000", None);
        let dir = catalog.data_dir(&full.label);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("PG_VERSION"), b"16\n").unwrap();
        std::fs::write(dir.join("postgresql.auto.conf"), b"old\n").unwrap();

        let inc = write_backup(&catalog, "20250102000000", Some(&full.label));
        let dir = catalog.data_dir(&inc.label);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("postgresql.auto.conf"), b"new\n").unwrap();

        let output = scratch.path().join("restored");
        combine_backup(&catalog, &inc, &output, &Materialization::AsIs).unwrap();
        assert_eq!(
            std::fs::read(output.join("data/PG_VERSION")).unwrap(),
            b"16\n"
        );
        assert_eq!(
            std::fs::read(output.join("data/postgresql.auto.conf")).unwrap(),
            b"new\n"
        );
    }
}
