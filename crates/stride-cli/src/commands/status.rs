use std::path::Path;

use serde::Serialize;
use stride_core::db::{on_store, SqliteStore, SyncStore};
use stride_core::models::{Checkpoint, EntityKind, SyncStatus};
use stride_core::sync::cloud::CLOUD_CONSUMER;
use stride_core::sync::PEER_CONSUMER;

use crate::commands::common::open_store;
use crate::error::CliError;

const ROOT_KINDS: [EntityKind; 2] = [EntityKind::Workout, EntityKind::WorkoutTemplate];

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub roots: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub orphans: usize,
    pub goals: usize,
    pub peer_checkpoint: Checkpoint,
    pub cloud_checkpoint: Checkpoint,
    pub history_head: Checkpoint,
}

pub fn collect_status(store: &SqliteStore) -> stride_core::Result<StatusReport> {
    let mut report = store.read(|tx| {
        let mut report = StatusReport::default();
        for kind in ROOT_KINDS {
            for id in tx.root_ids(kind)? {
                report.roots += 1;
                let status = tx.sync_meta(kind, id)?.unwrap_or_default().sync_status;
                match status {
                    SyncStatus::Pending => report.pending += 1,
                    SyncStatus::Syncing => report.syncing += 1,
                    SyncStatus::Synced => report.synced += 1,
                    SyncStatus::Conflict => report.conflicts += 1,
                    SyncStatus::Error => report.errors += 1,
                }
            }
        }
        report.orphans = tx.orphans()?.len();
        Ok(report)
    })?;

    report.goals = store.load_goals()?.len();
    report.peer_checkpoint = store.load_checkpoint(PEER_CONSUMER)?;
    report.cloud_checkpoint = store.load_checkpoint(CLOUD_CONSUMER)?;
    report.history_head = store.history_head()?;
    Ok(report)
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let report = on_store(&store, collect_status).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "records: {} (pending {}, syncing {}, synced {}, conflict {}, error {})",
        report.roots,
        report.pending,
        report.syncing,
        report.synced,
        report.conflicts,
        report.errors
    );
    println!("unlinked children: {}", report.orphans);
    println!("goals: {}", report.goals);
    println!(
        "history head {}  companion checkpoint {}  cloud checkpoint {}",
        report.history_head, report.peer_checkpoint, report.cloud_checkpoint
    );
    Ok(())
}
