//!
//! The workflow orchestrator: a list of stages, each exposing
//! setup/execute/teardown, threaded through a typed node map.
//!
//! Setups run in registration order, then executes in the same order; the
//! first failure aborts the remaining executes. Teardowns always run, in
//! reverse order, whatever happened before. The outcome carries a single
//! error code plus the name of the stage that failed.
//!

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use remote_storage::{GenericRemoteStorage, RemotePath};

use crate::catalog::Catalog;
use crate::combine::{combine_backup, Materialization};
use crate::manifest::Manifest;
use crate::mgmt::err as mgmt_err;

// Well-known node keys.
pub const NODE_SERVER_ID: &str = "server-id";
pub const NODE_LABEL: &str = "label";
pub const NODE_BACKUP: &str = "backup";
pub const NODE_TARGET_BASE: &str = "target-base";
pub const NODE_TARGET_ROOT: &str = "target-root";
pub const NODE_RECOVERY_INFO: &str = "recovery-info";
pub const NODE_COPY_WAL: &str = "copy-wal";
pub const NODE_LABELS: &str = "labels";
pub const NODE_MANIFEST: &str = "manifest";
pub const NODE_COMBINE_AS_IS: &str = "combine-as-is";
pub const USER_POSITION: &str = "user-position";
pub const USER_DIRECTORY: &str = "user-directory";

#[derive(Clone, Debug, PartialEq)]
pub enum NodeValue {
    Str(String),
    I32(i32),
    U64(u64),
    Bool(bool),
    Path(Utf8PathBuf),
    Labels(Vec<String>),
}

/// The typed map threaded through every stage of a workflow.
#[derive(Debug, Default)]
pub struct Nodes(HashMap<&'static str, NodeValue>);

impl Nodes {
    pub fn new() -> Nodes {
        Nodes::default()
    }

    pub fn insert(&mut self, key: &'static str, value: NodeValue) {
        self.0.insert(key, value);
    }

    pub fn get_str(&self, key: &str) -> anyhow::Result<&str> {
        match self.0.get(key) {
            Some(NodeValue::Str(s)) => Ok(s),
            other => anyhow::bail!("node {key} is not a string: {other:?}"),
        }
    }

    pub fn get_path(&self, key: &str) -> anyhow::Result<&Utf8PathBuf> {
        match self.0.get(key) {
            Some(NodeValue::Path(p)) => Ok(p),
            other => anyhow::bail!("node {key} is not a path: {other:?}"),
        }
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(NodeValue::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_labels(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key) {
            Some(NodeValue::Labels(labels)) => Some(labels),
            _ => None,
        }
    }
}

/// A stage failure: the management error code plus the underlying cause.
#[derive(Debug)]
pub struct WorkflowError {
    pub code: i32,
    pub source: anyhow::Error,
}

impl WorkflowError {
    pub fn new(code: i32, source: anyhow::Error) -> WorkflowError {
        WorkflowError { code, source }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {:#}", self.code, self.source)
    }
}

impl std::error::Error for WorkflowError {}

pub type WorkflowResult = Result<(), WorkflowError>;

#[async_trait]
pub trait Workflow: Send + Sync {
    fn name(&self) -> &'static str;

    async fn setup(&self, _nodes: &mut Nodes) -> WorkflowResult {
        Ok(())
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult;

    async fn teardown(&self, _nodes: &mut Nodes) -> WorkflowResult {
        Ok(())
    }
}

/// What a finished workflow run reports back to the operator.
#[derive(Debug)]
pub struct Outcome {
    pub status: bool,
    pub error: Option<i32>,
    pub workflow: Option<String>,
}

impl Outcome {
    pub fn success() -> Outcome {
        Outcome {
            status: true,
            error: None,
            workflow: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "error": self.error,
            "workflow": self.workflow,
        })
    }
}

/// Run the stages: setups and executes forward, teardowns in reverse.
pub async fn execute(workflows: &[Box<dyn Workflow>], nodes: &mut Nodes) -> Outcome {
    let mut outcome = Outcome::success();
    let mut reached = 0;

    for workflow in workflows {
        info!("workflow setup: {}", workflow.name());
        reached += 1;
        if let Err(e) = workflow.setup(nodes).await {
            error!("workflow {} setup failed: {e}", workflow.name());
            outcome = Outcome {
                status: false,
                error: Some(e.code),
                workflow: Some(workflow.name().to_string()),
            };
            break;
        }
    }

    if outcome.status {
        for workflow in workflows {
            info!("workflow execute: {}", workflow.name());
            if let Err(e) = workflow.execute(nodes).await {
                error!("workflow {} failed: {e}", workflow.name());
                outcome = Outcome {
                    status: false,
                    error: Some(e.code),
                    workflow: Some(workflow.name().to_string()),
                };
                break;
            }
        }
    }

    // teardown in reverse for everything whose setup was attempted
    for workflow in workflows[..reached].iter().rev() {
        if let Err(e) = workflow.teardown(nodes).await {
            warn!("workflow {} teardown failed: {e}", workflow.name());
        }
    }

    outcome
}

/// A bounded pool of file-copy/compression workers sharing one boolean
/// outcome. `wait` joins everything and reports the AND.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    join_set: JoinSet<()>,
    outcome: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> WorkerPool {
        WorkerPool {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            join_set: JoinSet::new(),
            outcome: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn spawn<F>(&mut self, work: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        let outcome = Arc::clone(&self.outcome);
        self.join_set.spawn(async move {
            let _permit = permit;
            if let Err(e) = work.await {
                warn!("worker failed: {e:#}");
                outcome.store(false, Ordering::SeqCst);
            }
        });
    }

    pub async fn wait(mut self) -> bool {
        while let Some(result) = self.join_set.join_next().await {
            if result.is_err() {
                self.outcome.store(false, Ordering::SeqCst);
            }
        }
        self.outcome.load(Ordering::SeqCst)
    }
}

//
// The restore-side stages.
//

/// Materialize a (possibly incremental) backup into the restore target.
pub struct CombineStage {
    pub catalog_root: Utf8PathBuf,
}

#[async_trait]
impl Workflow for CombineStage {
    fn name(&self) -> &'static str {
        "combine-incremental"
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult {
        let fail = |e| WorkflowError::new(mgmt_err::RESTORE_EXECUTE, e);
        let label = nodes.get_str(NODE_BACKUP).map_err(fail)?.to_string();
        let target = nodes.get_path(NODE_TARGET_BASE).map_err(fail)?.clone();
        let as_is = nodes.get_bool_or(NODE_COMBINE_AS_IS, true);
        let server = nodes.get_str(NODE_SERVER_ID).map_err(fail)?.to_string();

        let catalog = Catalog::new(self.catalog_root.clone());
        let backup = catalog
            .lookup(&label)
            .map_err(|e| WorkflowError::new(mgmt_err::RESTORE_NOBACKUP, e.into()))?;
        let materialization = if as_is {
            Materialization::AsIs
        } else {
            Materialization::PerTablespace { server }
        };
        tokio::task::spawn_blocking(move || {
            combine_backup(&catalog, &backup, &target, &materialization).map(|_| ())
        })
        .await
        .context("combine task panicked")
        .map_err(fail)?
        .map_err(fail)?;
        Ok(())
    }
}

/// Verify the restored tree against its backup manifest.
pub struct ManifestVerifyStage;

#[async_trait]
impl Workflow for ManifestVerifyStage {
    fn name(&self) -> &'static str {
        "verify-manifest"
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult {
        let fail = |e| WorkflowError::new(mgmt_err::VERIFY_EXECUTE, e);
        let data_dir = nodes.get_path(NODE_TARGET_BASE).map_err(fail)?.join("data");
        let result = tokio::task::spawn_blocking(move || {
            let manifest = Manifest::load(&data_dir.join("backup_manifest"))?;
            manifest.verify(&data_dir)
        })
        .await
        .context("verify task panicked")
        .map_err(fail)?;
        let problems = result.map_err(|e| fail(e.into()))?;
        if !problems.is_empty() {
            for problem in &problems {
                error!("manifest verification: {problem}");
            }
            return Err(fail(anyhow::anyhow!(
                "{} files failed manifest verification",
                problems.len()
            )));
        }
        Ok(())
    }
}

/// Write the recovery trigger files into the restored data directory.
pub struct RecoveryInfoStage;

#[async_trait]
impl Workflow for RecoveryInfoStage {
    fn name(&self) -> &'static str {
        "recovery-info"
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult {
        let fail = |e| WorkflowError::new(mgmt_err::RESTORE_EXECUTE, e);
        if !nodes.get_bool_or(NODE_RECOVERY_INFO, false) {
            return Ok(());
        }
        let data_dir = nodes.get_path(NODE_TARGET_BASE).map_err(fail)?.join("data");
        tokio::fs::write(data_dir.join("recovery.signal"), b"")
            .await
            .context("writing recovery.signal")
            .map_err(fail)?;
        let mut conf = String::new();
        if let Ok(position) = nodes.get_str(USER_POSITION) {
            conf.push_str(&format!("recovery_target_lsn = '{position}'\n"));
        }
        if !conf.is_empty() {
            use std::fmt::Write as _;
            let _ = write!(conf, "recovery_target_action = 'promote'\n");
            tokio::fs::write(data_dir.join("postgresql.auto.conf"), conf)
                .await
                .context("writing recovery settings")
                .map_err(fail)?;
        }
        Ok(())
    }
}

/// Copy the WAL needed to replay the restored backup into `data/pg_wal`.
pub struct CopyWalStage {
    pub wal_dir: Utf8PathBuf,
}

#[async_trait]
impl Workflow for CopyWalStage {
    fn name(&self) -> &'static str {
        "copy-wal"
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult {
        let fail = |e| WorkflowError::new(mgmt_err::RESTORE_EXECUTE, e);
        if !nodes.get_bool_or(NODE_COPY_WAL, false) {
            return Ok(());
        }
        let first_needed = nodes.get_str(NODE_LABEL).map_err(fail)?.to_string();
        let dest = nodes
            .get_path(NODE_TARGET_BASE)
            .map_err(fail)?
            .join("data/pg_wal");
        tokio::fs::create_dir_all(&dest).await.map_err(|e| fail(e.into()))?;

        if !self.wal_dir.exists() {
            return Ok(());
        }
        let mut copied = 0usize;
        let mut entries: Vec<_> = self
            .wal_dir
            .read_dir_utf8()
            .map_err(|e| fail(e.into()))?
            .collect::<Result<_, _>>()
            .map_err(|e| fail(e.into()))?;
        entries.sort_by_key(|e| e.file_name().to_string());
        for entry in entries {
            let name = entry.file_name();
            // everything from the backup's first segment onward, history
            // files included
            let wanted = postgres_ffi::IsTLHistoryFileName(name)
                || (postgres_ffi::IsXLogFileName(name) && *name >= *first_needed);
            if !wanted {
                continue;
            }
            tokio::fs::copy(entry.path(), dest.join(name))
                .await
                .map_err(|e| fail(e.into()))?;
            copied += 1;
        }
        info!("copied {copied} WAL files into {dest}");
        Ok(())
    }
}

/// Upload the finished backup tree to a storage tier, deduplicating
/// unchanged files against the previous backup of the same server.
pub struct StorageUploadStage {
    pub storage: GenericRemoteStorage,
    pub catalog_root: Utf8PathBuf,
}

#[async_trait]
impl Workflow for StorageUploadStage {
    fn name(&self) -> &'static str {
        match self.storage {
            GenericRemoteStorage::LocalFs(_) => "storage-local",
            GenericRemoteStorage::Ssh(_) => "storage-ssh",
            GenericRemoteStorage::AwsS3(_) => "storage-s3",
        }
    }

    async fn setup(&self, _nodes: &mut Nodes) -> WorkflowResult {
        self.storage
            .setup()
            .await
            .map_err(|e| WorkflowError::new(mgmt_err::BACKUP_SETUP, e.into()))
    }

    async fn execute(&self, nodes: &mut Nodes) -> WorkflowResult {
        let fail = |e| WorkflowError::new(mgmt_err::BACKUP_EXECUTE, e);
        // The local tier holds the repository itself; nothing to transfer.
        if matches!(self.storage, GenericRemoteStorage::LocalFs(_)) {
            return Ok(());
        }
        let server = nodes.get_str(NODE_SERVER_ID).map_err(fail)?.to_string();
        let label = nodes.get_str(NODE_LABEL).map_err(fail)?.to_string();
        let local_root = nodes.get_path(NODE_TARGET_BASE).map_err(fail)?.clone();
        let remote_root = RemotePath::from_string(&format!("{server}/backup/{label}"))
            .map_err(fail)?;

        // Dedup against the previous backup's digest sidecar.
        let catalog = Catalog::new(self.catalog_root.clone());
        let previous = catalog
            .scan()
            .ok()
            .and_then(|backups| {
                backups
                    .into_iter()
                    .filter(|b| b.valid && b.label != label)
                    .next_back()
            })
            .and_then(|prev| {
                let hashes = catalog.load_sha256(&prev.label).ok()?;
                if hashes.is_empty() {
                    return None;
                }
                let root =
                    RemotePath::from_string(&format!("{server}/backup/{}", prev.label)).ok()?;
                Some((root, hashes))
            });

        let cancel = CancellationToken::new();
        let (uploaded, deduplicated) = remote_storage::upload_tree(
            &self.storage,
            &local_root,
            &remote_root,
            previous.as_ref().map(|(root, hashes)| (root, hashes)),
            &cancel,
        )
        .await
        .map_err(|e| {
            crate::metrics::STORAGE_ERRORS
                .with_label_values(&[self.storage.name()])
                .inc();
            fail(e.into())
        })?;
        info!(
            "uploaded backup {label} to {}: {uploaded} files sent, {deduplicated} deduplicated",
            self.storage.name()
        );
        Ok(())
    }

    async fn teardown(&self, _nodes: &mut Nodes) -> WorkflowResult {
        self.storage.teardown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_execute: bool,
    }

    #[async_trait]
    impl Workflow for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn setup(&self, _nodes: &mut Nodes) -> WorkflowResult {
            self.log.lock().unwrap().push(format!("setup:{}", self.name));
            Ok(())
        }

        async fn execute(&self, _nodes: &mut Nodes) -> WorkflowResult {
            self.log.lock().unwrap().push(format!("execute:{}", self.name));
            if self.fail_execute {
                return Err(WorkflowError::new(42, anyhow::anyhow!("boom")));
            }
            Ok(())
        }

        async fn teardown(&self, _nodes: &mut Nodes) -> WorkflowResult {
            self.log.lock().unwrap().push(format!("teardown:{}", self.name));
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_execute: bool,
    ) -> Box<dyn Workflow> {
        Box::new(Recorder {
            name,
            log: Arc::clone(log),
            fail_execute,
        })
    }

    #[tokio::test]
    async fn stages_run_forward_teardown_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflows = vec![
            recorder("a", &log, false),
            recorder("b", &log, false),
            recorder("c", &log, false),
        ];
        let mut nodes = Nodes::new();
        let outcome = execute(&workflows, &mut nodes).await;
        assert!(outcome.status);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "setup:a", "setup:b", "setup:c", "execute:a", "execute:b", "execute:c",
                "teardown:c", "teardown:b", "teardown:a",
            ]
        );
    }

    #[tokio::test]
    async fn first_failure_aborts_but_teardown_still_runs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflows = vec![
            recorder("a", &log, false),
            recorder("b", &log, true),
            recorder("c", &log, false),
        ];
        let mut nodes = Nodes::new();
        let outcome = execute(&workflows, &mut nodes).await;
        assert!(!outcome.status);
        assert_eq!(outcome.error, Some(42));
        assert_eq!(outcome.workflow.as_deref(), Some("b"));
        let log = log.lock().unwrap();
        assert!(log.contains(&"execute:b".to_string()));
        assert!(!log.contains(&"execute:c".to_string()));
        // teardowns in reverse registration order, all of them
        assert_eq!(
            log[log.len() - 3..],
            ["teardown:c", "teardown:b", "teardown:a"]
        );
    }

    #[tokio::test]
    async fn worker_pool_ands_outcomes() {
        let mut pool = WorkerPool::new(2);
        for i in 0..5 {
            pool.spawn(async move {
                if i == 3 {
                    anyhow::bail!("worker {i} failed");
                }
                Ok(())
            })
            .await;
        }
        assert!(!pool.wait().await);

        let mut pool = WorkerPool::new(2);
        for _ in 0..5 {
            pool.spawn(async { Ok(()) }).await;
        }
        assert!(pool.wait().await);
    }

    #[tokio::test]
    async fn nodes_are_typed() {
        let mut nodes = Nodes::new();
        nodes.insert(NODE_SERVER_ID, NodeValue::Str("primary".into()));
        nodes.insert(NODE_TARGET_BASE, NodeValue::Path("/tmp/restore".into()));
        nodes.insert(NODE_COPY_WAL, NodeValue::Bool(true));
        assert_eq!(nodes.get_str(NODE_SERVER_ID).unwrap(), "primary");
        assert!(nodes.get_str(NODE_TARGET_BASE).is_err());
        assert!(nodes.get_bool_or(NODE_COPY_WAL, false));
        assert!(!nodes.get_bool_or(NODE_COMBINE_AS_IS, false));
    }
}
