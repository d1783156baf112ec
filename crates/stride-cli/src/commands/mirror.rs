use std::io;
use std::path::Path;
use std::sync::Arc;

use stride_core::db::{on_store, SyncStore};
use stride_core::models::EntityKind;
use stride_core::sync::cloud::InMemoryCloud;
use stride_core::sync::{LoopbackLink, NetworkMonitor, OutboundReport, SyncEngine};
use stride_core::SyncSettings;
use tokio::sync::watch;

use crate::commands::common::open_store;
use crate::error::CliError;

#[derive(Debug)]
pub struct MirrorSummary {
    pub report: OutboundReport,
    pub peer_workouts: usize,
}

/// Run one outbound pass from the local store into the peer store.
///
/// Both sides stay offline from the cloud; only the companion path is exercised.
pub async fn mirror_once(
    db_path: &Path,
    peer_path: &Path,
    full: bool,
    settings: &SyncSettings,
) -> Result<MirrorSummary, CliError> {
    if db_path == peer_path {
        return Err(CliError::SamePeer);
    }

    let ((local_link, _local_inbox), (peer_link, peer_inbox)) = LoopbackLink::pair();
    let cloud = InMemoryCloud::new();
    let peer_settings = settings
        .clone()
        .with_device_name(format!("{}-companion", settings.device_name));

    let local = SyncEngine::new(
        open_store(db_path)?,
        Arc::new(local_link),
        Arc::new(cloud.client()),
        NetworkMonitor::new(false),
        settings,
    );
    let peer = SyncEngine::new(
        open_store(peer_path)?,
        Arc::new(peer_link),
        Arc::new(cloud.client()),
        NetworkMonitor::new(false),
        &peer_settings,
    );

    let (stop, shutdown) = watch::channel(false);
    let server = peer.spawn_peer_server(peer_inbox, shutdown);

    let report = if full {
        local.request_full_resync().await
    } else {
        local.sync_peer().await
    };
    let _ = stop.send(true);
    server.await.map_err(io::Error::other)?;
    let report = report?;

    let peer_workouts = on_store(peer.store(), |store| {
        store.read(|tx| tx.root_ids(EntityKind::Workout))
    })
    .await?
    .len();
    Ok(MirrorSummary {
        report,
        peer_workouts,
    })
}

pub async fn run_mirror(
    db_path: &Path,
    peer_path: &Path,
    full: bool,
    settings: &SyncSettings,
) -> Result<(), CliError> {
    let summary = mirror_once(db_path, peer_path, full, settings).await?;
    let report = &summary.report;

    println!(
        "captured {} change(s), sent {} message(s) ({} direct, {} queued), {} suppressed",
        report.captured,
        report.sent(),
        report.direct,
        report.queued,
        report.suppressed
    );
    if report.held {
        println!("delivery failed; checkpoint held at {}", report.checkpoint);
    }
    println!("companion now holds {} workout(s)", summary.peer_workouts);
    Ok(())
}
