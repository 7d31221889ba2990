//! The on-disk backup catalog.
//!
//! One directory per backup under `<base>/<server>/backup/<label>/`, holding
//! a line-based `backup.info` descriptor, a `backup.sha256` sidecar with
//! per-file digests, and the `data/` tree itself. Labels are timestamps, so
//! lexicographic label order is chronological order.
//!
//! `backup.info` rewrites are atomic: write a temp file, fsync, rename.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use utils::lsn::Lsn;

pub const BACKUP_INFO: &str = "backup.info";
pub const BACKUP_SHA256: &str = "backup.sha256";
pub const BACKUP_DATA: &str = "data";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("backup not found: {0}")]
    BackupNotFound(String),
    #[error("backup {0} has no parent")]
    NoParent(String),
    #[error("backup {0} is already retained")]
    AlreadyRetained(String),
    #[error("backup {0} is not retained")]
    NotRetained(String),
    #[error("backup {0} is retained; use force to delete it")]
    Retained(String),
    #[error("backup {0} has more than one child")]
    ChildFanOut(String),
    #[error("corrupt backup.info: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "FULL"),
            BackupType::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

impl FromStr for BackupType {
    type Err = CatalogError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL" => Ok(BackupType::Full),
            "INCREMENTAL" => Ok(BackupType::Incremental),
            other => Err(CatalogError::Corrupt(format!("unknown backup type {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tablespace {
    pub name: String,
    pub oid: u32,
    pub path: String,
}

/// Parsed form of one `backup.info` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backup {
    pub label: String,
    /// STATUS=1 means the backup completed and verified.
    pub valid: bool,
    /// Name of the first WAL segment needed to restore this backup.
    pub wal: String,
    pub backup_size: u64,
    pub restore_size: u64,
    pub elapsed_secs: u64,
    pub major_version: u32,
    pub minor_version: u32,
    pub compression: String,
    pub encryption: String,
    pub hash_algorithm: String,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
    pub start_timeline: u32,
    pub end_timeline: u32,
    pub tablespaces: Vec<Tablespace>,
    pub keep: bool,
    /// Label of the parent backup; None for FULL backups.
    pub parent: Option<String>,
    pub backup_type: BackupType,
    pub comments: String,
}

impl Backup {
    pub fn new_full(label: String) -> Backup {
        Backup {
            label,
            valid: false,
            wal: String::new(),
            backup_size: 0,
            restore_size: 0,
            elapsed_secs: 0,
            major_version: 0,
            minor_version: 0,
            compression: "none".to_string(),
            encryption: "none".to_string(),
            hash_algorithm: "sha256".to_string(),
            start_lsn: Lsn::INVALID,
            end_lsn: Lsn::INVALID,
            checkpoint_lsn: Lsn::INVALID,
            start_timeline: 1,
            end_timeline: 1,
            tablespaces: Vec::new(),
            keep: false,
            parent: None,
            backup_type: BackupType::Full,
            comments: String::new(),
        }
    }

    pub fn new_incremental(label: String, parent: String) -> Backup {
        Backup {
            parent: Some(parent),
            backup_type: BackupType::Incremental,
            ..Backup::new_full(label)
        }
    }

    /// Render as `KEY=VALUE` lines. LSNs are split into hi/lo halves.
    pub fn to_info_string(&self) -> String {
        let mut out = String::new();
        let mut put = |k: &str, v: &str| {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        };
        put("LABEL", &self.label);
        put("STATUS", if self.valid { "1" } else { "0" });
        put("WAL", &self.wal);
        put("BACKUP_SIZE", &self.backup_size.to_string());
        put("RESTORE_SIZE", &self.restore_size.to_string());
        put("ELAPSED", &self.elapsed_secs.to_string());
        put("MAJOR_VERSION", &self.major_version.to_string());
        put("MINOR_VERSION", &self.minor_version.to_string());
        put("COMPRESSION", &self.compression);
        put("ENCRYPTION", &self.encryption);
        put("HASH_ALGORITHM", &self.hash_algorithm);
        put("START_WALPOS_HI", &format!("{:X}", self.start_lsn.0 >> 32));
        put(
            "START_WALPOS_LO",
            &format!("{:X}", self.start_lsn.0 & 0xffffffff),
        );
        put("END_WALPOS_HI", &format!("{:X}", self.end_lsn.0 >> 32));
        put("END_WALPOS_LO", &format!("{:X}", self.end_lsn.0 & 0xffffffff));
        put(
            "CHECKPOINT_WALPOS_HI",
            &format!("{:X}", self.checkpoint_lsn.0 >> 32),
        );
        put(
            "CHECKPOINT_WALPOS_LO",
            &format!("{:X}", self.checkpoint_lsn.0 & 0xffffffff),
        );
        put("START_TIMELINE", &self.start_timeline.to_string());
        put("END_TIMELINE", &self.end_timeline.to_string());
        put("TABLESPACES", &self.tablespaces.len().to_string());
        for (i, ts) in self.tablespaces.iter().enumerate() {
            put(&format!("TABLESPACE{}", i + 1), &ts.name);
            put(&format!("TABLESPACE_OID{}", i + 1), &ts.oid.to_string());
            put(&format!("TABLESPACE_PATH{}", i + 1), &ts.path);
        }
        put("KEEP", if self.keep { "true" } else { "false" });
        put("PARENT", self.parent.as_deref().unwrap_or(""));
        put("TYPE", &self.backup_type.to_string());
        put("COMMENTS", &self.comments);
        out
    }

    pub fn from_info_str(text: &str) -> Result<Backup, CatalogError> {
        let mut kv: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| CatalogError::Corrupt(format!("malformed line '{line}'")))?;
            kv.insert(key, value);
        }

        let get = |key: &str| -> Result<&str, CatalogError> {
            kv.get(key)
                .copied()
                .ok_or_else(|| CatalogError::Corrupt(format!("missing key {key}")))
        };
        let get_u64 = |key: &str| -> Result<u64, CatalogError> {
            get(key)?
                .parse()
                .map_err(|_| CatalogError::Corrupt(format!("bad number for {key}")))
        };
        let get_u32 = |key: &str| -> Result<u32, CatalogError> {
            get(key)?
                .parse()
                .map_err(|_| CatalogError::Corrupt(format!("bad number for {key}")))
        };
        let get_lsn = |hi: &str, lo: &str| -> Result<Lsn, CatalogError> {
            let hi = u64::from_str_radix(get(hi)?, 16)
                .map_err(|_| CatalogError::Corrupt(format!("bad hex for {hi}")))?;
            let lo = u64::from_str_radix(get(lo)?, 16)
                .map_err(|_| CatalogError::Corrupt(format!("bad hex for {lo}")))?;
            Ok(Lsn(hi << 32 | lo))
        };

        let ntablespaces = get_u64("TABLESPACES")? as usize;
        let mut tablespaces = Vec::with_capacity(ntablespaces);
        for i in 1..=ntablespaces {
            tablespaces.push(Tablespace {
                name: get(&format!("TABLESPACE{i}"))?.to_string(),
                oid: get_u32(&format!("TABLESPACE_OID{i}"))?,
                path: get(&format!("TABLESPACE_PATH{i}"))?.to_string(),
            });
        }

        let parent = match get("PARENT")? {
            "" => None,
            label => Some(label.to_string()),
        };
        let backup_type: BackupType = get("TYPE")?.parse()?;
        if backup_type == BackupType::Incremental && parent.is_none() {
            return Err(CatalogError::Corrupt(
                "INCREMENTAL backup without PARENT".to_string(),
            ));
        }

        Ok(Backup {
            label: get("LABEL")?.to_string(),
            valid: get("STATUS")? == "1",
            wal: get("WAL")?.to_string(),
            backup_size: get_u64("BACKUP_SIZE")?,
            restore_size: get_u64("RESTORE_SIZE")?,
            elapsed_secs: get_u64("ELAPSED")?,
            major_version: get_u32("MAJOR_VERSION")?,
            minor_version: get_u32("MINOR_VERSION")?,
            compression: get("COMPRESSION")?.to_string(),
            encryption: get("ENCRYPTION")?.to_string(),
            hash_algorithm: get("HASH_ALGORITHM")?.to_string(),
            start_lsn: get_lsn("START_WALPOS_HI", "START_WALPOS_LO")?,
            end_lsn: get_lsn("END_WALPOS_HI", "END_WALPOS_LO")?,
            checkpoint_lsn: get_lsn("CHECKPOINT_WALPOS_HI", "CHECKPOINT_WALPOS_LO")?,
            start_timeline: get_u32("START_TIMELINE")?,
            end_timeline: get_u32("END_TIMELINE")?,
            tablespaces,
            keep: get("KEEP")? == "true",
            parent,
            backup_type,
            comments: get("COMMENTS").unwrap_or("").to_string(),
        })
    }
}

/// Generate a fresh, chronologically sortable backup label.
pub fn generate_label(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// The catalog of one server: a view over `<base>/<server>/backup/`.
pub struct Catalog {
    root: Utf8PathBuf,
}

impl Catalog {
    pub fn new(root: Utf8PathBuf) -> Catalog {
        Catalog { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn backup_dir(&self, label: &str) -> Utf8PathBuf {
        self.root.join(label)
    }

    pub fn data_dir(&self, label: &str) -> Utf8PathBuf {
        self.backup_dir(label).join(BACKUP_DATA)
    }

    /// Parse every backup directory; sorted by label, which is timestamped,
    /// so the order is chronological.
    pub fn scan(&self) -> Result<Vec<Backup>, CatalogError> {
        let mut backups = Vec::new();
        if !self.root.exists() {
            return Ok(backups);
        }
        let mut labels: Vec<String> = Vec::new();
        for entry in self.root.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                labels.push(entry.file_name().to_string());
            }
        }
        labels.sort();
        for label in labels {
            let info_path = self.backup_dir(&label).join(BACKUP_INFO);
            if !info_path.exists() {
                // a backup directory being created right now
                continue;
            }
            let text = std::fs::read_to_string(&info_path)?;
            backups.push(Backup::from_info_str(&text)?);
        }
        Ok(backups)
    }

    /// Resolve `oldest | newest | latest | <label-prefix>` to one backup.
    /// Only valid backups resolve unless `include_invalid` is set.
    pub fn resolve(&self, ident: &str, include_invalid: bool) -> Result<Backup, CatalogError> {
        let backups: Vec<Backup> = self
            .scan()?
            .into_iter()
            .filter(|b| include_invalid || b.valid)
            .collect();
        let found = match ident {
            "oldest" => backups.into_iter().next(),
            "newest" | "latest" => backups.into_iter().next_back(),
            prefix => {
                let mut matches = backups
                    .into_iter()
                    .filter(|b| b.label.starts_with(prefix));
                let first = matches.next();
                if matches.next().is_some() {
                    return Err(CatalogError::BackupNotFound(format!(
                        "identifier '{prefix}' is ambiguous"
                    )));
                }
                first
            }
        };
        found.ok_or_else(|| CatalogError::BackupNotFound(ident.to_string()))
    }

    pub fn lookup(&self, label: &str) -> Result<Backup, CatalogError> {
        let info_path = self.backup_dir(label).join(BACKUP_INFO);
        if !info_path.exists() {
            return Err(CatalogError::BackupNotFound(label.to_string()));
        }
        let text = std::fs::read_to_string(&info_path)?;
        Backup::from_info_str(&text)
    }

    /// Atomically write `backup.info` for a backup.
    pub fn write_info(&self, backup: &Backup) -> Result<(), CatalogError> {
        let dir = self.backup_dir(&backup.label);
        std::fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{BACKUP_INFO}.tmp"));
        let target = dir.join(BACKUP_INFO);
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(backup.to_info_string().as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Parent of an incremental backup.
    pub fn parent(&self, backup: &Backup) -> Result<Backup, CatalogError> {
        match &backup.parent {
            None => Err(CatalogError::NoParent(backup.label.clone())),
            Some(parent) => self.lookup(parent),
        }
    }

    /// Walk parents until the FULL backup at the chain's root.
    pub fn chain_root(&self, backup: &Backup) -> Result<Backup, CatalogError> {
        let mut current = backup.clone();
        let mut hops = 0usize;
        while current.backup_type == BackupType::Incremental {
            current = self.parent(&current)?;
            hops += 1;
            // a cycle would mean a corrupted catalog
            if hops > 10_000 {
                return Err(CatalogError::Corrupt(format!(
                    "backup chain of {} does not terminate",
                    backup.label
                )));
            }
        }
        Ok(current)
    }

    /// The chain from the FULL root down to (and including) `backup`.
    pub fn chain(&self, backup: &Backup) -> Result<Vec<Backup>, CatalogError> {
        let mut chain = vec![backup.clone()];
        while chain.last().unwrap().backup_type == BackupType::Incremental {
            let parent = self.parent(chain.last().unwrap())?;
            chain.push(parent);
            if chain.len() > 10_000 {
                return Err(CatalogError::Corrupt(format!(
                    "backup chain of {} does not terminate",
                    backup.label
                )));
            }
        }
        chain.reverse();
        Ok(chain)
    }

    /// The at-most-one backup whose parent is `backup`.
    pub fn child(&self, backup: &Backup) -> Result<Option<Backup>, CatalogError> {
        let mut child = None;
        for candidate in self.scan()? {
            if candidate.parent.as_deref() == Some(backup.label.as_str()) {
                if child.is_some() {
                    return Err(CatalogError::ChildFanOut(backup.label.clone()));
                }
                child = Some(candidate);
            }
        }
        Ok(child)
    }

    /// Flip the KEEP bit on.
    pub fn retain(&self, label: &str) -> Result<(), CatalogError> {
        let mut backup = self.lookup(label)?;
        if backup.keep {
            return Err(CatalogError::AlreadyRetained(label.to_string()));
        }
        backup.keep = true;
        self.write_info(&backup)
    }

    /// Flip the KEEP bit off.
    pub fn expunge(&self, label: &str) -> Result<(), CatalogError> {
        let mut backup = self.lookup(label)?;
        if !backup.keep {
            return Err(CatalogError::NotRetained(label.to_string()));
        }
        backup.keep = false;
        self.write_info(&backup)
    }

    /// Delete a backup. Refused while KEEP is set, unless `force`, which
    /// clears the bit first.
    pub fn delete(&self, label: &str, force: bool) -> Result<(), CatalogError> {
        let backup = self.lookup(label)?;
        if backup.keep {
            if !force {
                return Err(CatalogError::Retained(label.to_string()));
            }
            self.expunge(label)?;
        }
        std::fs::remove_dir_all(self.backup_dir(label))?;
        Ok(())
    }

    /// Update the COMMENTS field: set `key:value`, replacing an existing
    /// entry for the key; an empty value removes the entry.
    pub fn annotate(&self, label: &str, key: &str, value: &str) -> Result<(), CatalogError> {
        let mut backup = self.lookup(label)?;
        let mut entries: Vec<(String, String)> = backup
            .comments
            .split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| {
                pair.split_once(':')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        entries.retain(|(k, _)| k != key);
        if !value.is_empty() {
            entries.push((key.to_string(), value.to_string()));
        }
        backup.comments = entries
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(",");
        self.write_info(&backup)
    }

    /// Write the `backup.sha256` sidecar: one `<relpath>:<hex>` line per file.
    pub fn write_sha256(
        &self,
        label: &str,
        digests: &[(String, String)],
    ) -> Result<(), CatalogError> {
        let dir = self.backup_dir(label);
        let tmp = dir.join(format!("{BACKUP_SHA256}.tmp"));
        {
            let mut file = std::fs::File::create(&tmp)?;
            for (path, digest) in digests {
                writeln!(file, "{path}:{digest}")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(tmp, dir.join(BACKUP_SHA256))?;
        Ok(())
    }

    pub fn load_sha256(&self, label: &str) -> Result<HashMap<String, String>, CatalogError> {
        let path = self.backup_dir(label).join(BACKUP_SHA256);
        let mut digests = HashMap::new();
        if !path.exists() {
            return Ok(digests);
        }
        for line in std::fs::read_to_string(&path)?.lines() {
            if let Some((path, digest)) = line.rsplit_once(':') {
                digests.insert(path.to_string(), digest.to_string());
            }
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> (camino_tempfile::Utf8TempDir, Catalog) {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("backup"));
        (dir, catalog)
    }

    fn make_backup(catalog: &Catalog, label: &str, parent: Option<&str>, valid: bool) -> Backup {
        let mut b = match parent {
            None => Backup::new_full(label.to_string()),
            Some(p) => Backup::new_incremental(label.to_string(), p.to_string()),
        };
        b.valid = valid;
        b.wal = "000000010000000000000001".to_string();
        b.start_lsn = Lsn(0x1000000);
        b.end_lsn = Lsn(0x1000100);
        catalog.write_info(&b).unwrap();
        b
    }

    #[test]
    fn info_round_trip() {
        let mut b = Backup::new_full("20250102030405".to_string());
        b.valid = true;
        b.wal = "000000020000000000000003".to_string();
        b.backup_size = 123456;
        b.major_version = 16;
        b.start_lsn = Lsn(0x1_2345_6789);
        b.end_lsn = Lsn(0x1_2345_9999);
        b.checkpoint_lsn = Lsn(0x1_2345_6800);
        b.start_timeline = 2;
        b.end_timeline = 2;
        b.tablespaces.push(Tablespace {
            name: "ts1".to_string(),
            oid: 16666,
            path: "/mnt/ts1".to_string(),
        });
        b.keep = true;
        let text = b.to_info_string();
        let parsed = Backup::from_info_str(&text).unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn incremental_without_parent_is_corrupt() {
        let b = Backup::new_full("x".to_string());
        let text = b.to_info_string().replace("TYPE=FULL", "TYPE=INCREMENTAL");
        assert!(matches!(
            Backup::from_info_str(&text),
            Err(CatalogError::Corrupt(_))
        ));
    }

    #[test]
    fn resolve_rules() {
        let (_dir, catalog) = catalog();
        make_backup(&catalog, "20250101000000", None, true);
        make_backup(&catalog, "20250102000000", Some("20250101000000"), true);
        make_backup(&catalog, "20250103000000", Some("20250102000000"), false);

        assert_eq!(catalog.resolve("oldest", false).unwrap().label, "20250101000000");
        // the invalid newest backup does not resolve
        assert_eq!(catalog.resolve("newest", false).unwrap().label, "20250102000000");
        assert_eq!(catalog.resolve("latest", true).unwrap().label, "20250103000000");
        assert_eq!(
            catalog.resolve("20250102", false).unwrap().label,
            "20250102000000"
        );
        // a prefix matching several labels is ambiguous
        assert!(catalog.resolve("2025010", false).is_err());
        assert!(matches!(
            catalog.resolve("nothere", false),
            Err(CatalogError::BackupNotFound(_))
        ));
    }

    #[test]
    fn chain_traversal() {
        let (_dir, catalog) = catalog();
        let full = make_backup(&catalog, "20250101000000", None, true);
        let inc1 = make_backup(&catalog, "20250102000000", Some("20250101000000"), true);
        let inc2 = make_backup(&catalog, "20250103000000", Some("20250102000000"), true);

        assert_eq!(catalog.chain_root(&inc2).unwrap().label, full.label);
        let chain = catalog.chain(&inc2).unwrap();
        assert_eq!(
            chain.iter().map(|b| b.label.as_str()).collect::<Vec<_>>(),
            vec!["20250101000000", "20250102000000", "20250103000000"]
        );
        assert_eq!(catalog.child(&full).unwrap().unwrap().label, inc1.label);
        assert_eq!(catalog.child(&inc2).unwrap(), None);
        assert!(matches!(
            catalog.parent(&full),
            Err(CatalogError::NoParent(_))
        ));
    }

    #[test]
    fn retention_semantics() {
        let (_dir, catalog) = catalog();
        make_backup(&catalog, "20250101000000", None, true);

        catalog.retain("20250101000000").unwrap();
        assert!(matches!(
            catalog.retain("20250101000000"),
            Err(CatalogError::AlreadyRetained(_))
        ));
        // delete refused while retained
        assert!(matches!(
            catalog.delete("20250101000000", false),
            Err(CatalogError::Retained(_))
        ));
        // force clears the bit and deletes
        catalog.delete("20250101000000", true).unwrap();
        assert!(matches!(
            catalog.lookup("20250101000000"),
            Err(CatalogError::BackupNotFound(_))
        ));
    }

    #[test]
    fn expunge_requires_retained() {
        let (_dir, catalog) = catalog();
        make_backup(&catalog, "20250101000000", None, true);
        assert!(matches!(
            catalog.expunge("20250101000000"),
            Err(CatalogError::NotRetained(_))
        ));
    }

    #[test]
    fn annotate_comments() {
        let (_dir, catalog) = catalog();
        make_backup(&catalog, "20250101000000", None, true);
        catalog.annotate("20250101000000", "reason", "pre-upgrade").unwrap();
        catalog.annotate("20250101000000", "ticket", "ops-42").unwrap();
        let b = catalog.lookup("20250101000000").unwrap();
        assert_eq!(b.comments, "reason:pre-upgrade,ticket:ops-42");
        catalog.annotate("20250101000000", "reason", "").unwrap();
        let b = catalog.lookup("20250101000000").unwrap();
        assert_eq!(b.comments, "ticket:ops-42");
    }

    #[test]
    fn sha256_sidecar_round_trip() {
        let (_dir, catalog) = catalog();
        make_backup(&catalog, "20250101000000", None, true);
        catalog
            .write_sha256(
                "20250101000000",
                &[
                    ("data/base/1/16384".to_string(), "ab".repeat(32)),
                    ("data/global/pg_control".to_string(), "cd".repeat(32)),
                ],
            )
            .unwrap();
        let digests = catalog.load_sha256("20250101000000").unwrap();
        assert_eq!(digests.len(), 2);
        assert_eq!(digests["data/base/1/16384"], "ab".repeat(32));
    }
}
