//! Cloud sync coordinator
//!
//! Pushes pending subgraphs as whole documents, confirms them by bumping the
//! local version, and merges remote snapshots through the conflict resolver.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};

use crate::config::SyncSettings;
use crate::db::{on_store, Author, StoreTxn, SyncStore};
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangeType, EntityKind, RecordId, SyncMeta, SyncStatus};
use crate::sync::capture::ChangeCaptureLog;
use crate::sync::conflict::{ConflictResolver, Resolution, VersionResolver, VersionStamp};
use crate::sync::connectivity::NetworkMonitor;
use crate::sync::events::{ChangeSource, EventBus, SyncEvent};
use crate::sync::merge::{MergeEngine, MergeOrigin, MergeReport};
use crate::util::now_millis;

use super::document::{decode_subgraph, encode_subgraph};
use super::{CloudStore, Document, DocumentSnapshot, DocumentWrite, SnapshotChange};

/// Checkpoint consumer used to find deletions the cloud has not seen.
pub const CLOUD_CONSUMER: &str = "cloud";

/// Cloud-authored writes are already in the cloud.
const CLOUD_AUTHORS: &[Author] = &[Author::Local, Author::Peer];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Nothing was attempted because the device is offline
    pub offline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// This client's own unconfirmed write
    Echo,
    Applied(MergeReport),
    KeptLocal,
    Removed(MergeReport),
}

struct PreparedPush {
    kind: EntityKind,
    id: RecordId,
    child_ids: Vec<RecordId>,
    stamp: VersionStamp,
    document: Document,
}

pub struct CloudSyncCoordinator<S, C> {
    store: Arc<S>,
    cloud: Arc<C>,
    merge: MergeEngine<S>,
    deletes: ChangeCaptureLog<S>,
    resolver: Arc<dyn ConflictResolver>,
    events: EventBus,
    network: NetworkMonitor,
    batch_size: usize,
    push_lock: Mutex<()>,
}

impl<S: SyncStore, C: CloudStore> CloudSyncCoordinator<S, C> {
    pub fn new(
        store: Arc<S>,
        cloud: Arc<C>,
        events: EventBus,
        network: NetworkMonitor,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            merge: MergeEngine::new(Arc::clone(&store), events.clone()),
            deletes: ChangeCaptureLog::new(Arc::clone(&store), CLOUD_CONSUMER, settings)
                .with_authors(CLOUD_AUTHORS),
            store,
            cloud,
            resolver: Arc::new(VersionResolver),
            events,
            network,
            batch_size: settings.cloud_batch_size.max(1),
            push_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub const fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Push one subgraph as a single document write.
    ///
    /// Returns `false` when the root no longer exists locally.
    pub async fn push_root(&self, kind: EntityKind, id: RecordId) -> Result<bool> {
        let Some(prepared) = self.prepare(vec![(kind, id)]).await?.pop() else {
            tracing::debug!(%kind, %id, "root vanished before push, skipping");
            return Ok(false);
        };

        let result = self
            .cloud
            .write(kind.collection(), &id.to_string(), prepared.document.clone(), true)
            .await;
        match result {
            Ok(()) => self.confirm(vec![prepared]).await.map(|()| true),
            Err(error) => {
                self.fail(&[(kind, id)]).await?;
                Err(as_cloud_failure(error))
            }
        }
    }

    /// Push every pending subgraph, `cloud_batch_size` per atomic batch.
    ///
    /// Failed batches stay queued (status `error`) for the next attempt.
    pub async fn push_pending(&self) -> Result<PushReport> {
        let _push = self.push_lock.lock().await;
        if !self.network.is_online() {
            tracing::debug!("offline, cloud push deferred");
            return Ok(PushReport {
                offline: true,
                ..PushReport::default()
            });
        }

        let mut report = PushReport::default();
        match self.push_deletes().await {
            Ok(deleted) => report.deleted = deleted,
            Err(error) if error.is_retryable() => {
                tracing::warn!(%error, "cloud delete failed, will retry");
            }
            Err(error) => return Err(error),
        }

        let roots = on_store(&self.store, |store| store.pending_roots()).await?;
        for chunk in roots.chunks(self.batch_size) {
            let result = match chunk {
                [(kind, id)] => self.push_root(*kind, *id).await.map(usize::from),
                _ => self.push_batch(chunk).await,
            };
            match result {
                Ok(pushed) => report.pushed += pushed,
                Err(error) if error.is_retryable() => {
                    tracing::warn!(%error, count = chunk.len(), "cloud push failed, will retry");
                    report.failed += chunk.len();
                }
                Err(error) => return Err(error),
            }
        }

        if report.pushed > 0 || report.failed > 0 || report.deleted > 0 {
            tracing::info!(
                pushed = report.pushed,
                failed = report.failed,
                deleted = report.deleted,
                "cloud push complete"
            );
        }
        Ok(report)
    }

    async fn push_batch(&self, roots: &[(EntityKind, RecordId)]) -> Result<usize> {
        let prepared = self.prepare(roots.to_vec()).await?;
        let writes = prepared
            .iter()
            .map(|push| DocumentWrite {
                collection: push.kind.collection().to_string(),
                id: push.id.to_string(),
                document: push.document.clone(),
            })
            .collect();

        match self.cloud.batch_write(writes).await {
            Ok(()) => {
                let count = prepared.len();
                self.confirm(prepared).await?;
                Ok(count)
            }
            Err(error) => {
                self.fail(roots).await?;
                Err(as_cloud_failure(error))
            }
        }
    }

    /// Propagate local and companion root deletions to the cloud.
    async fn push_deletes(&self) -> Result<usize> {
        let batch = self.deletes.capture().await?;
        let mut deleted = 0;
        for record in &batch.records {
            if record.change_type != ChangeType::Delete || !record.entity.is_root() {
                continue;
            }
            self.cloud
                .delete(record.entity.collection(), &record.id.to_string())
                .await
                .map_err(as_cloud_failure)?;
            deleted += 1;
        }
        self.deletes.acknowledge(&batch).await?;
        Ok(deleted)
    }

    /// Mark roots `syncing` and build their documents at the next version.
    async fn prepare(&self, roots: Vec<(EntityKind, RecordId)>) -> Result<Vec<PreparedPush>> {
        let now = now_millis();
        let prepared = on_store(&self.store, move |store| {
            store.transaction(Author::Bookkeeping, |tx| {
                let mut prepared = Vec::with_capacity(roots.len());
                for (kind, id) in roots {
                    if let Some(push) = prepare_one(tx, kind, id, now)? {
                        prepared.push(push);
                    }
                }
                Ok(prepared)
            })
        })
        .await?;

        for push in &prepared {
            self.publish_status(push.kind, push.id, SyncStatus::Syncing);
        }
        Ok(prepared)
    }

    /// Record a confirmed write: version +1 and `lastSyncedAt` on the subgraph.
    ///
    /// The local version never moves backwards.
    async fn confirm(&self, prepared: Vec<PreparedPush>) -> Result<()> {
        let statuses = on_store(&self.store, move |store| {
            store.transaction(Author::Bookkeeping, |tx| {
                let mut statuses = Vec::with_capacity(prepared.len());
                for push in prepared {
                    let Some(current) = tx.sync_meta(push.kind, push.id)? else {
                        continue;
                    };
                    // A newer cloud version landed during the write; push again on top of it
                    if current.version >= push.stamp.version {
                        tx.set_sync_status(push.kind, push.id, SyncStatus::Pending)?;
                        statuses.push((push.kind, push.id, SyncStatus::Pending, current.version));
                        continue;
                    }
                    // A local edit during the write leaves the root pending
                    let status = if current.sync_status == SyncStatus::Syncing {
                        SyncStatus::Synced
                    } else {
                        current.sync_status
                    };
                    tx.set_sync_meta(
                        push.kind,
                        push.id,
                        SyncMeta {
                            version: push.stamp.version,
                            sync_status: status,
                            last_synced_at: push.stamp.last_synced_at,
                        },
                    )?;
                    if let Some(child) = push.kind.child() {
                        for child_id in push.child_ids {
                            tx.set_sync_meta(
                                child,
                                child_id,
                                SyncMeta {
                                    version: push.stamp.version,
                                    sync_status: SyncStatus::Synced,
                                    last_synced_at: push.stamp.last_synced_at,
                                },
                            )?;
                        }
                    }
                    statuses.push((push.kind, push.id, status, push.stamp.version));
                }
                Ok(statuses)
            })
        })
        .await?;

        for (kind, id, status, version) in statuses {
            tracing::debug!(%kind, %id, version, "cloud write confirmed");
            self.publish_status(kind, id, status);
        }
        Ok(())
    }

    async fn fail(&self, roots: &[(EntityKind, RecordId)]) -> Result<()> {
        let roots = roots.to_vec();
        let failed = on_store(&self.store, move |store| {
            store.transaction(Author::Bookkeeping, |tx| {
                let mut failed = Vec::new();
                for (kind, id) in roots {
                    let syncing = tx
                        .sync_meta(kind, id)?
                        .is_some_and(|meta| meta.sync_status == SyncStatus::Syncing);
                    if syncing {
                        tx.set_sync_status(kind, id, SyncStatus::Error)?;
                        failed.push((kind, id));
                    }
                }
                Ok(failed)
            })
        })
        .await?;

        for (kind, id) in failed {
            self.publish_status(kind, id, SyncStatus::Error);
        }
        Ok(())
    }

    /// Roots left `syncing` by an interrupted push go back to `pending`.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        on_store(&self.store, |store| {
            store.transaction(Author::Bookkeeping, |tx| {
                let mut recovered = 0;
                for kind in [EntityKind::Workout, EntityKind::WorkoutTemplate] {
                    for id in tx.root_ids(kind)? {
                        let syncing = tx
                            .sync_meta(kind, id)?
                            .is_some_and(|meta| meta.sync_status == SyncStatus::Syncing);
                        if syncing {
                            tx.set_sync_status(kind, id, SyncStatus::Pending)?;
                            recovered += 1;
                        }
                    }
                }
                Ok(recovered)
            })
        })
        .await
    }

    /// Apply one listener snapshot.
    pub async fn handle_snapshot(&self, snapshot: DocumentSnapshot) -> Result<RemoteOutcome> {
        if snapshot.has_pending_writes {
            tracing::trace!(id = %snapshot.id, "ignoring own pending write");
            return Ok(RemoteOutcome::Echo);
        }

        let kind = EntityKind::from_collection(&snapshot.collection).ok_or_else(|| {
            Error::MalformedMessage(format!("unknown collection '{}'", snapshot.collection))
        })?;
        let id: RecordId = snapshot.id.parse().map_err(|_| {
            Error::MalformedMessage(format!("invalid document id '{}'", snapshot.id))
        })?;

        let document = match snapshot.change {
            SnapshotChange::Removed => {
                let origin = MergeOrigin::Cloud {
                    version: 0,
                    last_synced_at: None,
                };
                let report = self
                    .merge
                    .apply(vec![ChangeRecord::delete(kind, id)], origin)
                    .await?;
                return Ok(RemoteOutcome::Removed(report));
            }
            SnapshotChange::Upserted(document) => document,
        };

        let remote = decode_subgraph(kind, id, document)?;
        let local = on_store(&self.store, move |store| {
            store.read(|tx| {
                let Some(meta) = tx.sync_meta(kind, id)? else {
                    return Ok(None);
                };
                let children = child_ids(tx, kind, id)?;
                Ok(Some((meta, children)))
            })
        })
        .await?;

        let mut stale = Vec::new();
        if let Some((meta, children)) = local {
            if self.resolver.resolve(meta.into(), remote.stamp) == Resolution::UseLocal {
                tracing::debug!(%kind, %id, local = meta.version, remote = remote.stamp.version, "keeping local copy");
                return Ok(RemoteOutcome::KeptLocal);
            }
            if meta.sync_status.needs_push() {
                tracing::warn!(%kind, %id, "newer cloud version replaces unsynced local changes");
            }
            let remote_children = remote.child_ids().collect::<Vec<_>>();
            if let Some(child) = kind.child() {
                stale = children
                    .into_iter()
                    .filter(|child_id| !remote_children.contains(child_id))
                    .map(|child_id| ChangeRecord::delete(child, child_id))
                    .collect();
            }
        }

        let origin = MergeOrigin::Cloud {
            version: remote.stamp.version,
            last_synced_at: remote.stamp.last_synced_at,
        };
        let mut records = remote.into_records();
        records.extend(stale);
        let report = self.merge.apply(records, origin).await?;
        Ok(RemoteOutcome::Applied(report))
    }

    /// Listen for remote changes and push local ones until `shutdown` flips.
    ///
    /// Pending pushes drain whenever connectivity returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self.recover_interrupted().await?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued interrupted cloud pushes");
        }

        let mut workouts = self.cloud.listen(EntityKind::Workout.collection()).await?;
        let mut templates = self
            .cloud
            .listen(EntityKind::WorkoutTemplate.collection())
            .await?;
        let mut events = self.events.subscribe();
        let mut online = self.network.subscribe();

        self.push_logged().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    self.events.publish(SyncEvent::Connectivity { online: is_online });
                    if is_online {
                        tracing::info!("connectivity regained, draining pending pushes");
                        self.push_logged().await;
                    }
                }
                Some(snapshot) = workouts.recv() => self.handle_logged(snapshot).await,
                Some(snapshot) = templates.recv() => self.handle_logged(snapshot).await,
                event = events.recv() => match event {
                    Ok(SyncEvent::RecordsChanged { source, .. } | SyncEvent::RecordsDeleted { source, .. })
                        if source != ChangeSource::Cloud =>
                    {
                        self.push_logged().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bus lagged, pushing everything pending");
                        self.push_logged().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) => {}
                },
            }
        }

        tracing::debug!("cloud coordinator stopped");
        Ok(())
    }

    async fn push_logged(&self) {
        if let Err(error) = self.push_pending().await {
            tracing::error!(%error, "cloud push failed");
        }
    }

    async fn handle_logged(&self, snapshot: DocumentSnapshot) {
        let id = snapshot.id.clone();
        if let Err(error) = self.handle_snapshot(snapshot).await {
            tracing::warn!(%id, %error, "failed to apply cloud snapshot");
        }
    }

    fn publish_status(&self, kind: EntityKind, id: RecordId, status: SyncStatus) {
        self.events.publish(SyncEvent::CloudStatus { kind, id, status });
    }
}

fn as_cloud_failure(error: Error) -> Error {
    match error {
        Error::CloudWriteFailure(_) => error,
        other => Error::CloudWriteFailure(other.to_string()),
    }
}

fn child_ids(tx: &dyn StoreTxn, kind: EntityKind, id: RecordId) -> Result<Vec<RecordId>> {
    Ok(tx
        .children(kind, id)?
        .iter()
        .filter_map(|child| child.get("id")?.as_str()?.parse().ok())
        .collect())
}

fn prepare_one(
    tx: &mut dyn StoreTxn,
    kind: EntityKind,
    id: RecordId,
    now: i64,
) -> Result<Option<PreparedPush>> {
    let (Some(meta), Some(root)) = (tx.sync_meta(kind, id)?, tx.fetch(kind, id)?) else {
        return Ok(None);
    };
    let children = tx.children(kind, id)?;
    let child_ids = children
        .iter()
        .filter_map(|child| child.get("id")?.as_str()?.parse().ok())
        .collect();

    let stamp = VersionStamp {
        version: meta.version + 1,
        last_synced_at: Some(now),
    };
    tx.set_sync_status(kind, id, SyncStatus::Syncing)?;

    Ok(Some(PreparedPush {
        kind,
        id,
        child_ids,
        stamp,
        document: encode_subgraph(root, children, stamp),
    }))
}
