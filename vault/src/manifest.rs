//! PostgreSQL backup manifest handling.
//!
//! The server writes `backup_manifest` as JSON: a list of files with sizes
//! and checksums, the WAL ranges the backup needs, and a trailing checksum
//! over the manifest itself. Verification walks the backup's data directory
//! and checks presence, size and content digest of every listed file.

use std::io::Read;

use camino::Utf8Path;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use utils::lsn::Lsn;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest checksum mismatch: computed {computed}, stored {stored}")]
    ManifestChecksumMismatch { computed: String, stored: String },
    #[error("unsupported checksum algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A problem found while verifying a backup against its manifest.
#[derive(Debug, PartialEq, Eq)]
pub enum Problem {
    FileMissing {
        path: String,
    },
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    ChecksumMismatch {
        path: String,
    },
    ExtraFile {
        path: String,
    },
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Problem::FileMissing { path } => write!(f, "{path}: missing"),
            Problem::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(f, "{path}: size {actual}, manifest says {expected}"),
            Problem::ChecksumMismatch { path } => write!(f, "{path}: checksum mismatch"),
            Problem::ExtraFile { path } => write!(f, "{path}: not in manifest"),
        }
    }
}

fn deserialize_lsn<'de, D>(deserializer: D) -> Result<Lsn, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestFile {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "Last-Modified", default)]
    pub last_modified: Option<String>,
    #[serde(rename = "Checksum-Algorithm", default)]
    pub checksum_algorithm: Option<String>,
    #[serde(rename = "Checksum", default)]
    pub checksum: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WalRange {
    #[serde(rename = "Timeline")]
    pub timeline: u32,
    #[serde(rename = "Start-LSN", deserialize_with = "deserialize_lsn")]
    pub start_lsn: Lsn,
    #[serde(rename = "End-LSN", deserialize_with = "deserialize_lsn")]
    pub end_lsn: Lsn,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Manifest {
    #[serde(rename = "PostgreSQL-Backup-Manifest-Version")]
    pub version: u32,
    #[serde(rename = "Files")]
    pub files: Vec<ManifestFile>,
    #[serde(rename = "WAL-Ranges", default)]
    pub wal_ranges: Vec<WalRange>,
    #[serde(rename = "Manifest-Checksum", default)]
    pub manifest_checksum: Option<String>,
}

impl Manifest {
    /// Parse manifest text, verifying the trailing manifest checksum when
    /// present. The checksum covers everything up to the line holding it.
    pub fn parse(text: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_json::from_str(text)?;
        if let Some(stored) = &manifest.manifest_checksum {
            if let Some(key_pos) = text.find("\"Manifest-Checksum\"") {
                let line_start = text[..key_pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
                let computed = hex::encode(Sha256::digest(&text.as_bytes()[..line_start]));
                if computed != *stored {
                    return Err(ManifestError::ManifestChecksumMismatch {
                        computed,
                        stored: stored.clone(),
                    });
                }
            }
        }
        Ok(manifest)
    }

    pub fn load(path: &Utf8Path) -> Result<Manifest, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Manifest::parse(&text)
    }

    /// Verify the backup tree at `data_dir` against this manifest. Returns
    /// the problems found; an empty list is a clean pass.
    pub fn verify(&self, data_dir: &Utf8Path) -> Result<Vec<Problem>, ManifestError> {
        let mut problems = Vec::new();

        for file in &self.files {
            let on_disk = data_dir.join(&file.path);
            let metadata = match std::fs::metadata(&on_disk) {
                Ok(metadata) => metadata,
                Err(_) => {
                    problems.push(Problem::FileMissing {
                        path: file.path.clone(),
                    });
                    continue;
                }
            };
            if metadata.len() != file.size {
                problems.push(Problem::SizeMismatch {
                    path: file.path.clone(),
                    expected: file.size,
                    actual: metadata.len(),
                });
                continue;
            }
            if let (Some(algorithm), Some(expected)) = (&file.checksum_algorithm, &file.checksum) {
                let actual = file_digest(&on_disk, algorithm)?;
                if !actual.eq_ignore_ascii_case(expected) {
                    problems.push(Problem::ChecksumMismatch {
                        path: file.path.clone(),
                    });
                }
            }
        }

        // Anything on disk the manifest doesn't know about. WAL and the
        // manifest itself are not listed by the server.
        let listed: std::collections::HashSet<&str> =
            self.files.iter().map(|f| f.path.as_str()).collect();
        for entry in walkdir::WalkDir::new(data_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| std::io::Error::from(e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = Utf8Path::from_path(entry.path()) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(data_dir) else {
                continue;
            };
            let relative = relative.as_str();
            if relative == "backup_manifest" || relative.starts_with("pg_wal/") {
                continue;
            }
            if !listed.contains(relative) {
                problems.push(Problem::ExtraFile {
                    path: relative.to_string(),
                });
            }
        }

        Ok(problems)
    }
}

fn file_digest(path: &Utf8Path, algorithm: &str) -> Result<String, ManifestError> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    match algorithm {
        "SHA256" => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        "CRC32C" => {
            let mut crc = 0u32;
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc = crc32c::crc32c_append(crc, &buf[..n]);
            }
            Ok(hex::encode(crc.to_be_bytes()))
        }
        other => Err(ManifestError::UnsupportedAlgorithm(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    fn manifest_json(files: &[(&str, &[u8])]) -> String {
        // built in the same shape the server writes, checksum line last
        let mut body = String::from("{ \"PostgreSQL-Backup-Manifest-Version\": 1,\n\"Files\": [\n");
        for (i, (path, content)) in files.iter().enumerate() {
            let digest = hex::encode(Sha256::digest(content));
            let _ = write!(
                body,
                "{{ \"Path\": \"{path}\", \"Size\": {}, \"Checksum-Algorithm\": \"SHA256\", \"Checksum\": \"{digest}\" }}{}\n",
                content.len(),
                if i + 1 < files.len() { "," } else { "" }
            );
        }
        body.push_str("],\n\"WAL-Ranges\": [\n");
        body.push_str(
            "{ \"Timeline\": 1, \"Start-LSN\": \"0/2000028\", \"End-LSN\": \"0/2000100\" }\n",
        );
        body.push_str("],\n");
        let checksum = hex::encode(Sha256::digest(body.as_bytes()));
        let _ = write!(body, "\"Manifest-Checksum\": \"{checksum}\"}}\n");
        body
    }

    #[test]
    fn parse_and_checksum() {
        let text = manifest_json(&[("base/1/16384", b"pagedata")]);
        let manifest = Manifest::parse(&text).unwrap();
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.wal_ranges[0].start_lsn, Lsn(0x2000028));

        // a flipped byte in the body breaks the manifest checksum
        let broken = text.replace("16384", "16385");
        assert!(matches!(
            Manifest::parse(&broken),
            Err(ManifestError::ManifestChecksumMismatch { .. })
        ));
    }

    #[test]
    fn verify_detects_all_problem_kinds() {
        let dir = camino_tempfile::tempdir().unwrap();
        let data = dir.path();
        std::fs::create_dir_all(data.join("base/1")).unwrap();
        std::fs::write(data.join("base/1/16384"), b"pagedata").unwrap();
        std::fs::write(data.join("base/1/16385"), b"corrupted!").unwrap();
        std::fs::write(data.join("stray"), b"who put this here").unwrap();

        let text = manifest_json(&[
            ("base/1/16384", b"pagedata"),
            ("base/1/16385", b"original##"), // same length, different bytes
            ("base/1/16386", b"gone"),
        ]);
        let manifest = Manifest::parse(&text).unwrap();
        let problems = manifest.verify(data).unwrap();
        assert!(problems.contains(&Problem::ChecksumMismatch {
            path: "base/1/16385".to_string()
        }));
        assert!(problems.contains(&Problem::FileMissing {
            path: "base/1/16386".to_string()
        }));
        assert!(problems.contains(&Problem::ExtraFile {
            path: "stray".to_string()
        }));
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn crc32c_files_verify() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let crc = crc32c::crc32c(b"hello");
        let digest = file_digest(&dir.path().join("f"), "CRC32C").unwrap();
        assert_eq!(digest, hex::encode(crc.to_be_bytes()));
        assert!(matches!(
            file_digest(&dir.path().join("f"), "SHA224"),
            Err(ManifestError::UnsupportedAlgorithm(_))
        ));
    }
}
