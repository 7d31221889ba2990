//! Static configuration for the daemon, loaded from a TOML file.
//!
//! S3 and SSH settings can be given globally and overridden per server;
//! the effective value for a server falls back key-by-key from the server
//! section to the global one.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::RemoteStorageKind;
use serde::Deserialize;

use postgres_ffi::{PgMajorVersion, WAL_SEGMENT_SIZE};

#[derive(Clone, Debug, Deserialize)]
pub struct VaultConf {
    /// Root of the on-disk repository: `<base>/<server>/backup/...` and
    /// `<base>/<server>/wal/...` live under it.
    pub base_dir: Utf8PathBuf,
    #[serde(default)]
    pub log_format: Option<String>,
    /// Size of the worker pool used for per-file copy work.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub retention: RetentionConf,
    /// Storage tiers the repository is mirrored to, in upload order.
    #[serde(default)]
    pub storage: Vec<RemoteStorageKind>,
    pub servers: HashMap<String, ServerConf>,
    /// Management socket address, e.g. "127.0.0.1:5400".
    #[serde(default)]
    pub mgmt_addr: Option<String>,
    /// AES key for management envelopes, hex encoded; 16/24/32 bytes select
    /// the variant.
    #[serde(default)]
    pub mgmt_key: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConf {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Replication slot used for WAL streaming.
    #[serde(default = "default_slot")]
    pub slot: String,
    /// Expected server major version (13..=18).
    pub pg_version: u32,
    #[serde(default = "default_wal_segment_size")]
    pub wal_segment_size: usize,
    /// Extra directory WAL segments are duplicated into, for pickup by an
    /// archiver. Never blocks the authoritative local write.
    #[serde(default)]
    pub wal_shipping: Option<Utf8PathBuf>,
    /// Disk write budget in bytes/second; 0 means unlimited.
    #[serde(default)]
    pub rate: usize,
    /// Network receive budget in bytes/second; 0 means unlimited.
    #[serde(default)]
    pub network_rate: usize,
    /// Server-side base backup compression: "none", "gzip" or "zstd".
    #[serde(default)]
    pub backup_compression: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-server S3 overrides, merged key-by-key over the global tier.
    #[serde(default)]
    pub s3: Option<S3Overrides>,
}

/// Every field optional; anything unset falls back to the global S3 section.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct S3Overrides {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix_in_bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub storage_class: Option<String>,
    pub port: Option<u16>,
    pub use_tls: Option<bool>,
}

/// The S3 configuration a server's uploads actually use: the global tier
/// with the server's overrides applied per key.
pub fn effective_s3(global: &remote_storage::S3Config, overrides: Option<&S3Overrides>) -> remote_storage::S3Config {
    let mut effective = global.clone();
    let Some(overrides) = overrides else {
        return effective;
    };
    if let Some(bucket) = &overrides.bucket {
        effective.bucket = bucket.clone();
    }
    if let Some(region) = &overrides.region {
        effective.region = region.clone();
    }
    if overrides.endpoint.is_some() {
        effective.endpoint = overrides.endpoint.clone();
    }
    if overrides.prefix_in_bucket.is_some() {
        effective.prefix_in_bucket = overrides.prefix_in_bucket.clone();
    }
    if let Some(access_key_id) = &overrides.access_key_id {
        effective.access_key_id = access_key_id.clone();
    }
    if let Some(secret_access_key) = &overrides.secret_access_key {
        effective.secret_access_key = secret_access_key.clone();
    }
    if overrides.storage_class.is_some() {
        effective.storage_class = overrides.storage_class.clone();
    }
    if overrides.port.is_some() {
        effective.port = overrides.port;
    }
    if let Some(use_tls) = overrides.use_tls {
        effective.use_tls = use_tls;
    }
    effective
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RetentionConf {
    /// Keep this many of the newest valid backups when retention runs.
    #[serde(default)]
    pub keep_last: Option<usize>,
    /// Keep every backup newer than this.
    #[serde(with = "humantime_serde", default)]
    pub keep_within: Option<Duration>,
}

fn default_workers() -> usize {
    4
}

fn default_pg_port() -> u16 {
    5432
}

fn default_slot() -> String {
    "pgvault".to_string()
}

fn default_wal_segment_size() -> usize {
    WAL_SEGMENT_SIZE
}

impl VaultConf {
    pub fn load(path: &Utf8Path) -> anyhow::Result<VaultConf> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        let conf: VaultConf =
            toml::from_str(&text).with_context(|| format!("parsing config file {path}"))?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.servers.is_empty(), "no servers configured");
        for (name, server) in &self.servers {
            anyhow::ensure!(
                PgMajorVersion::from_major(server.pg_version).is_some(),
                "server {name}: unsupported PostgreSQL major version {}",
                server.pg_version
            );
            anyhow::ensure!(
                server.wal_segment_size.is_power_of_two()
                    && server.wal_segment_size >= 1024 * 1024,
                "server {name}: WAL segment size must be a power of two and at least 1 MiB"
            );
            match server.backup_compression.as_deref() {
                None | Some("none") | Some("gzip") | Some("zstd") => {}
                Some("lz4") => {
                    anyhow::bail!("server {name}: lz4 base backup compression is not supported")
                }
                Some(other) => {
                    anyhow::bail!("server {name}: unknown backup compression '{other}'")
                }
            }
        }
        if let Some(key) = &self.mgmt_key {
            let bytes = hex::decode(key).context("mgmt_key is not valid hex")?;
            anyhow::ensure!(
                matches!(bytes.len(), 16 | 24 | 32),
                "mgmt_key must be 16, 24 or 32 bytes of hex"
            );
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> anyhow::Result<&ServerConf> {
        self.servers
            .get(name)
            .with_context(|| format!("unknown server '{name}'"))
    }

    /// `<base>/<server>/backup/`
    pub fn backup_dir(&self, server: &str) -> Utf8PathBuf {
        self.base_dir.join(server).join("backup")
    }

    /// `<base>/<server>/wal/`
    pub fn wal_dir(&self, server: &str) -> Utf8PathBuf {
        self.base_dir.join(server).join("wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base_dir = "/var/lib/pgvault"
workers = 8

[retention]
keep_last = 7
keep_within = "30d"

[[storage]]
local_fs = { root = "/mnt/mirror" }

[servers.primary]
host = "db1.example.com"
user = "repl"
pg_version = 16
rate = 10485760

[servers.standby]
host = "db2.example.com"
port = 5433
user = "repl"
pg_version = 15
backup_compression = "zstd"
"#;

    #[test]
    fn parse_sample() {
        let conf: VaultConf = toml::from_str(SAMPLE).unwrap();
        conf.validate().unwrap();
        let primary = conf.server("primary").unwrap();
        assert_eq!(primary.port, 5432);
        assert_eq!(primary.slot, "pgvault");
        assert_eq!(primary.rate, 10485760);
        assert_eq!(conf.server("standby").unwrap().port, 5433);
        assert_eq!(
            conf.backup_dir("primary"),
            Utf8PathBuf::from("/var/lib/pgvault/primary/backup")
        );
        assert_eq!(conf.retention.keep_last, Some(7));
        assert!(conf.server("missing").is_err());
    }

    #[test]
    fn s3_overrides_fall_back_per_key() {
        let global = remote_storage::S3Config {
            bucket: "global-bucket".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            prefix_in_bucket: Some("vault".to_string()),
            access_key_id: "global-key".to_string(),
            secret_access_key: "global-secret".to_string(),
            storage_class: None,
            port: None,
            use_tls: true,
            concurrency_limit: std::num::NonZeroUsize::new(100).unwrap(),
        };
        let overrides = S3Overrides {
            bucket: Some("server-bucket".to_string()),
            storage_class: Some("STANDARD_IA".to_string()),
            ..Default::default()
        };
        let merged = effective_s3(&global, Some(&overrides));
        assert_eq!(merged.bucket, "server-bucket");
        assert_eq!(merged.storage_class.as_deref(), Some("STANDARD_IA"));
        // unset keys fall back to the global section
        assert_eq!(merged.region, "us-east-1");
        assert_eq!(merged.access_key_id, "global-key");

        let untouched = effective_s3(&global, None);
        assert_eq!(untouched.bucket, "global-bucket");
    }

    #[test]
    fn lz4_compression_is_rejected() {
        let mut conf: VaultConf = toml::from_str(SAMPLE).unwrap();
        conf.servers.get_mut("primary").unwrap().backup_compression = Some("lz4".to_string());
        assert!(conf.validate().is_err());
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut conf: VaultConf = toml::from_str(SAMPLE).unwrap();
        conf.servers.get_mut("primary").unwrap().pg_version = 12;
        assert!(conf.validate().is_err());
    }
}
