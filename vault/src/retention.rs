//! Periodic retention enforcement: prune old backups down to the configured
//! policy, never touching retained (KEEP) backups or the ancestors of
//! surviving incremental chains.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};

use crate::catalog::{Backup, Catalog, CatalogError};
use crate::config::RetentionConf;
use crate::state::{Activity, ProcessState};

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Decide which backups to drop under the policy. Kept are: everything with
/// the KEEP bit, the newest `keep_last` valid backups, everything younger
/// than `keep_within`, and transitively every parent of a kept incremental.
pub fn plan_retention(
    backups: &[Backup],
    policy: &RetentionConf,
    now: DateTime<Utc>,
) -> Vec<String> {
    if policy.keep_last.is_none() && policy.keep_within.is_none() {
        return Vec::new();
    }

    let mut keep: HashSet<&str> = HashSet::new();
    for backup in backups {
        if backup.keep || !backup.valid {
            // invalid backups are debris from failed runs, but deleting them
            // is the operator's call, not retention's
            keep.insert(backup.label.as_str());
        }
    }
    if let Some(n) = policy.keep_last {
        for backup in backups.iter().filter(|b| b.valid).rev().take(n) {
            keep.insert(backup.label.as_str());
        }
    }
    if let Some(within) = policy.keep_within {
        let cutoff = now - chrono::Duration::from_std(within).unwrap_or_default();
        let cutoff_label = crate::catalog::generate_label(cutoff);
        for backup in backups {
            // labels are timestamps, so the comparison is chronological
            if backup.label.as_str() >= cutoff_label.as_str() {
                keep.insert(backup.label.as_str());
            }
        }
    }

    // an incremental chain is only restorable with all its ancestors
    let by_label: std::collections::HashMap<&str, &Backup> =
        backups.iter().map(|b| (b.label.as_str(), b)).collect();
    let mut frontier: Vec<&str> = keep.iter().copied().collect();
    while let Some(label) = frontier.pop() {
        if let Some(parent) = by_label.get(label).and_then(|b| b.parent.as_deref()) {
            if keep.insert(parent) {
                frontier.push(parent);
            }
        }
    }

    backups
        .iter()
        .filter(|b| !keep.contains(b.label.as_str()))
        .map(|b| b.label.clone())
        .collect()
}

pub fn apply_retention(
    catalog: &Catalog,
    policy: &RetentionConf,
    now: DateTime<Utc>,
) -> Result<Vec<String>, CatalogError> {
    let backups = catalog.scan()?;
    let doomed = plan_retention(&backups, policy, now);
    for label in &doomed {
        info!("retention: deleting backup {label}");
        catalog.delete(label, false)?;
    }
    Ok(doomed)
}

/// Hourly retention sweep over every server, guarded by the per-server
/// retention activity bit.
pub async fn run_retention_task(state: Arc<ProcessState>) {
    async {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RETENTION_INTERVAL) => {}
                _ = state.cancel.cancelled() => return,
            }
            for server in state.conf.servers.keys() {
                let guard = match state.try_start(server, Activity::Retention) {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                };
                let catalog = Catalog::new(state.conf.backup_dir(server));
                match apply_retention(&catalog, &state.conf.retention, Utc::now()) {
                    Ok(deleted) if !deleted.is_empty() => {
                        info!("retention on {server}: deleted {}", deleted.join(", "))
                    }
                    Ok(_) => {}
                    Err(e) => warn!("retention on {server} failed: {e}"),
                }
                drop(guard);
            }
        }
    }
    .instrument(info_span!("retention"))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backup(label: &str, valid: bool, keep: bool, parent: Option<&str>) -> Backup {
        let mut b = match parent {
            None => Backup::new_full(label.to_string()),
            Some(p) => Backup::new_incremental(label.to_string(), p.to_string()),
        };
        b.valid = valid;
        b.keep = keep;
        b
    }

    #[test]
    fn keep_last_protects_chains() {
        let backups = vec![
            backup("20250101000000", true, false, None),
            backup("20250102000000", true, false, None),
            backup("20250103000000", true, false, Some("20250102000000")),
        ];
        let policy = RetentionConf {
            keep_last: Some(2),
            keep_within: None,
        };
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        // the newest two survive, and the chain parent of the newest is one
        // of them; only the oldest FULL goes
        assert_eq!(plan_retention(&backups, &policy, now), vec!["20250101000000"]);
    }

    #[test]
    fn keep_bit_and_invalid_backups_survive() {
        let backups = vec![
            backup("20250101000000", true, true, None),
            backup("20250102000000", false, false, None),
            backup("20250103000000", true, false, None),
        ];
        let policy = RetentionConf {
            keep_last: Some(1),
            keep_within: None,
        };
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(plan_retention(&backups, &policy, now).is_empty());
    }

    #[test]
    fn keep_within_is_chronological() {
        let backups = vec![
            backup("20250101000000", true, false, None),
            backup("20250520000000", true, false, None),
        ];
        let policy = RetentionConf {
            keep_last: None,
            keep_within: Some(Duration::from_secs(30 * 24 * 3600)),
        };
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(plan_retention(&backups, &policy, now), vec!["20250101000000"]);
    }

    #[test]
    fn no_policy_means_no_deletions() {
        let backups = vec![backup("20250101000000", true, false, None)];
        let policy = RetentionConf::default();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(plan_retention(&backups, &policy, now).is_empty());
    }
}
