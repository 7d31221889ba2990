//! The pgvault daemon: per-server WAL streaming plus the management socket.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::{error, info, warn};

use remote_storage::GenericRemoteStorage;
use utils::logging::{self, LogFormat};
use vault::catalog::Catalog;
use vault::config::VaultConf;
use vault::mgmt;
use vault::state::ProcessState;
use vault::walreceiver;

#[derive(Parser)]
#[command(name = "pgvault", about = "PostgreSQL backup and recovery daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long)]
    config: Utf8PathBuf,

    /// Log format: 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;
    logging::replace_panic_hook_with_tracing_panic_hook()?;

    let conf = VaultConf::load(&args.config)?;
    info!(
        "starting pgvault {} with {} servers, repository at {}",
        env!("CARGO_PKG_VERSION"),
        conf.servers.len(),
        conf.base_dir
    );

    let mgmt_key = conf
        .mgmt_key
        .as_deref()
        .map(hex::decode)
        .transpose()
        .context("mgmt_key is not valid hex")?;
    let mgmt_addr = conf.mgmt_addr.clone();

    let state = ProcessState::new(conf);

    let mut tasks = Vec::new();
    for server_name in state.conf.servers.keys().cloned().collect::<Vec<_>>() {
        let storage = server_storage(&state.conf, &server_name)?;
        tasks.push(tokio::spawn(walreceiver::run_for_server(
            Arc::clone(&state),
            server_name,
            storage,
        )));
    }

    tasks.push(tokio::spawn(vault::retention::run_retention_task(
        Arc::clone(&state),
    )));

    if let Some(addr) = mgmt_addr {
        tasks.push(tokio::spawn(mgmt_listener(
            Arc::clone(&state),
            addr,
            mgmt_key,
        )));
    }

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown requested");
    state.cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("task panicked during shutdown: {e}");
        }
    }
    info!("bye");
    Ok(())
}

/// The first configured storage tier, with the server's per-key S3
/// overrides applied.
fn server_storage(
    conf: &VaultConf,
    server_name: &str,
) -> anyhow::Result<Option<GenericRemoteStorage>> {
    let Some(kind) = conf.storage.first() else {
        return Ok(None);
    };
    let kind = match kind {
        remote_storage::RemoteStorageKind::AwsS3(global) => {
            let overrides = conf.server(server_name)?.s3.as_ref();
            remote_storage::RemoteStorageKind::AwsS3(vault::config::effective_s3(
                global, overrides,
            ))
        }
        other => other.clone(),
    };
    Ok(Some(GenericRemoteStorage::from_config(&kind)?))
}

/// Accept management connections and answer the inline catalog commands.
async fn mgmt_listener(state: Arc<ProcessState>, addr: String, key: Option<Vec<u8>>) {
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind management socket {addr}: {e}");
            return;
        }
    };
    info!("management socket listening on {addr}");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = state.cancel.cancelled() => return,
        };
        let (mut socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("management accept failed: {e}");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let key = key.clone();
        tokio::spawn(async move {
            let envelope = match mgmt::read_envelope(&mut socket, key.as_deref()).await {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("bad management request from {peer}: {e:#}");
                    return;
                }
            };
            let server = envelope
                .request
                .get("server")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_else(|| {
                    // single-server setups may omit the name
                    state.conf.servers.keys().next().map(String::as_str).unwrap_or("")
                })
                .to_string();
            let reply = match state.conf.servers.contains_key(&server) {
                true => {
                    let catalog = Catalog::new(state.conf.backup_dir(&server));
                    mgmt::handle_catalog_request(&catalog, &envelope)
                }
                false => mgmt::Envelope::failure(
                    mgmt::Command::Ping,
                    mgmt::err::BACKUP_NOSERVER,
                    None,
                ),
            };
            if let Err(e) = mgmt::write_envelope(&mut socket, &reply, key.as_deref()).await {
                warn!("could not answer management request from {peer}: {e:#}");
            }
        });
    }
}
