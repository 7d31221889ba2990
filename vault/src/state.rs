//! Process-wide runtime state: the configuration plus one mutable slot per
//! server. Each slot's exclusivity bits make sure a server runs at most one
//! backup, restore, archive, delete and retention at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use utils::lsn::Lsn;

use crate::config::VaultConf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Backup,
    Restore,
    Archive,
    Delete,
    Retention,
}

impl Activity {
    pub fn name(self) -> &'static str {
        match self {
            Activity::Backup => "backup",
            Activity::Restore => "restore",
            Activity::Archive => "archive",
            Activity::Delete => "delete",
            Activity::Retention => "retention",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{activity} is already active for server {server}")]
pub struct AlreadyActive {
    pub server: String,
    pub activity: &'static str,
}

/// Per-server runtime counters and exclusivity bits. Only the owning task
/// writes its own server's slot; everyone may read.
#[derive(Default)]
pub struct ServerRuntime {
    pub wal_streaming: AtomicBool,
    active_backup: AtomicBool,
    active_restore: AtomicBool,
    active_archive: AtomicBool,
    active_delete: AtomicBool,
    active_retention: AtomicBool,
    /// Last LSN written to the current WAL segment.
    pub current_lsn: AtomicU64,
    /// Base backup progress, bytes done / total. The total may be revised
    /// upward while a backup runs.
    pub backup_bytes_done: AtomicI64,
    pub backup_bytes_total: AtomicI64,
}

impl ServerRuntime {
    fn flag(&self, activity: Activity) -> &AtomicBool {
        match activity {
            Activity::Backup => &self.active_backup,
            Activity::Restore => &self.active_restore,
            Activity::Archive => &self.active_archive,
            Activity::Delete => &self.active_delete,
            Activity::Retention => &self.active_retention,
        }
    }

    pub fn update_wal_lsn(&self, lsn: Lsn) {
        self.current_lsn.store(lsn.0, Ordering::Relaxed);
    }

    pub fn wal_lsn(&self) -> Lsn {
        Lsn(self.current_lsn.load(Ordering::Relaxed))
    }
}

/// An acquired exclusivity bit; released on drop, on every exit path.
pub struct ActivityGuard<'a> {
    flag: &'a AtomicBool,
    pub activity: Activity,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The single owned state constructed at process start and passed by shared
/// reference into every component.
pub struct ProcessState {
    pub conf: VaultConf,
    pub servers: HashMap<String, ServerRuntime>,
    /// Cooperative shutdown, polled at every I/O loop head.
    pub cancel: CancellationToken,
}

impl ProcessState {
    pub fn new(conf: VaultConf) -> Arc<ProcessState> {
        let servers = conf
            .servers
            .keys()
            .map(|name| (name.clone(), ServerRuntime::default()))
            .collect();
        Arc::new(ProcessState {
            conf,
            servers,
            cancel: CancellationToken::new(),
        })
    }

    pub fn server_runtime(&self, name: &str) -> Option<&ServerRuntime> {
        self.servers.get(name)
    }

    /// Acquire a per-server activity bit. Fails with [`AlreadyActive`] if the
    /// same activity is already running for that server.
    pub fn try_start(&self, server: &str, activity: Activity) -> Result<ActivityGuard<'_>, AlreadyActive> {
        let runtime = self.servers.get(server).ok_or_else(|| AlreadyActive {
            server: server.to_string(),
            activity: activity.name(),
        })?;
        let flag = runtime.flag(activity);
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AlreadyActive {
                server: server.to_string(),
                activity: activity.name(),
            });
        }
        Ok(ActivityGuard { flag, activity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<ProcessState> {
        let conf: VaultConf = toml::from_str(
            r#"
base_dir = "/tmp/repo"
[servers.one]
host = "localhost"
user = "repl"
pg_version = 16
"#,
        )
        .unwrap();
        ProcessState::new(conf)
    }

    #[test]
    fn activity_bits_are_exclusive_per_server() {
        let state = test_state();
        let guard = state.try_start("one", Activity::Backup).unwrap();
        // same activity: refused
        assert!(state.try_start("one", Activity::Backup).is_err());
        // a different activity on the same server is fine
        let other = state.try_start("one", Activity::Retention).unwrap();
        drop(other);
        drop(guard);
        // released on drop
        state.try_start("one", Activity::Backup).unwrap();
    }

    #[test]
    fn unknown_server_is_refused() {
        let state = test_state();
        assert!(state.try_start("nope", Activity::Backup).is_err());
    }
}
