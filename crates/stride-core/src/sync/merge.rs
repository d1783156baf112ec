//! Merge engine: applies received change batches to the local store
//!
//! A pass runs inside one store transaction. Children whose parent is not in the
//! store yet are written unlinked and linked at the end of the pass; links that
//! are still unresolved then are persisted and retried on every later pass.

use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{on_store, Author, OrphanLink, StoreTxn, SyncStore, WriteMeta};
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangeType, EntityKind, GoalMap, RecordId, SyncStatus};

use super::events::{ChangeSource, EventBus, SyncEvent};
use super::message::WireChange;

/// Who a merged batch came from, and how its rows are stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    /// The companion device; merged rows still need a cloud push
    Peer,
    /// A cloud document at a confirmed version
    Cloud {
        version: i64,
        last_synced_at: Option<i64>,
    },
}

impl MergeOrigin {
    const fn author(self) -> Author {
        match self {
            Self::Peer => Author::Peer,
            Self::Cloud { .. } => Author::Cloud,
        }
    }

    const fn write_meta(self) -> WriteMeta {
        match self {
            Self::Peer => WriteMeta::Pending,
            Self::Cloud {
                version,
                last_synced_at,
            } => WriteMeta::Synced {
                version,
                last_synced_at,
            },
        }
    }

    const fn source(self) -> ChangeSource {
        match self {
            Self::Peer => ChangeSource::Peer,
            Self::Cloud { .. } => ChangeSource::Cloud,
        }
    }
}

/// Outcome of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Inserts and updates written
    pub applied: usize,
    pub deleted: usize,
    /// Deletes whose target was already absent
    pub already_absent: usize,
    /// Malformed records dropped
    pub skipped: usize,
    /// Peer records identical to the stored row
    pub unchanged: usize,
    /// Deferred links resolved at the end of the pass
    pub linked: usize,
    /// Links still unresolved, persisted for later passes
    pub orphaned: Vec<OrphanLink>,
    pub changed_roots: Vec<(EntityKind, RecordId)>,
    pub deleted_records: Vec<(EntityKind, RecordId)>,
}

impl MergeReport {
    fn note_root(&mut self, kind: EntityKind, id: RecordId) {
        if !self.changed_roots.contains(&(kind, id)) {
            self.changed_roots.push((kind, id));
        }
    }
}

pub struct MergeEngine<S> {
    store: Arc<S>,
    events: EventBus,
}

impl<S> Clone for MergeEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        }
    }
}

impl<S: SyncStore> MergeEngine<S> {
    pub const fn new(store: Arc<S>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub async fn apply(&self, records: Vec<ChangeRecord>, origin: MergeOrigin) -> Result<MergeReport> {
        self.apply_pass(vec![records], origin).await
    }

    /// Validate wire changes, dropping the malformed ones, then apply the rest.
    pub async fn apply_wire(
        &self,
        changes: Vec<WireChange>,
        origin: MergeOrigin,
    ) -> Result<MergeReport> {
        let mut rejected = 0;
        let records = changes
            .into_iter()
            .filter_map(|change| match ChangeRecord::try_from(change) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!(%error, "skipping malformed change");
                    rejected += 1;
                    None
                }
            })
            .collect::<Vec<_>>();

        let mut report = self.apply(records, origin).await?;
        report.skipped += rejected;
        Ok(report)
    }

    /// Apply several batches as one pass: one transaction, one link resolution.
    pub async fn apply_pass(
        &self,
        batches: Vec<Vec<ChangeRecord>>,
        origin: MergeOrigin,
    ) -> Result<MergeReport> {
        let report = on_store(&self.store, move |store| {
            store.transaction(origin.author(), |tx| merge_pass(tx, batches, origin))
        })
        .await?;

        tracing::info!(
            applied = report.applied,
            deleted = report.deleted,
            skipped = report.skipped,
            unchanged = report.unchanged,
            linked = report.linked,
            orphaned = report.orphaned.len(),
            origin = ?origin,
            "merge pass committed"
        );
        self.publish(&report, origin.source());
        Ok(report)
    }

    /// Delete every subgraph of the given root kinds, and optionally the goals.
    pub async fn clear(
        &self,
        roots: Vec<EntityKind>,
        clear_goals: bool,
        origin: MergeOrigin,
    ) -> Result<MergeReport> {
        let report = on_store(&self.store, move |store| {
            store.transaction(origin.author(), |tx| {
                let mut report = MergeReport::default();
                for kind in roots {
                    for id in tx.root_ids(kind)? {
                        tx.delete_subgraph(kind, id)?;
                        report.deleted += 1;
                        report.deleted_records.push((kind, id));
                    }
                }
                if clear_goals {
                    tx.replace_goals(&GoalMap::new())?;
                }
                Ok(report)
            })
        })
        .await?;

        tracing::info!(deleted = report.deleted, clear_goals, "cleared synced data");
        self.publish(&report, origin.source());
        if clear_goals {
            self.events.publish(SyncEvent::GoalsReplaced { count: 0 });
        }
        Ok(report)
    }

    fn publish(&self, report: &MergeReport, source: ChangeSource) {
        if !report.changed_roots.is_empty() {
            self.events.publish(SyncEvent::RecordsChanged {
                source,
                roots: report.changed_roots.clone(),
            });
        }
        if !report.deleted_records.is_empty() {
            self.events.publish(SyncEvent::RecordsDeleted {
                source,
                records: report.deleted_records.clone(),
            });
        }
    }
}

/// Collapse repeated changes to one record into a single net change.
///
/// The result keeps the position of each record's first occurrence. Snapshots
/// merge left to right; a delete anywhere makes the net change a delete.
pub fn coalesce(batch: Vec<ChangeRecord>) -> Vec<ChangeRecord> {
    let mut order = Vec::with_capacity(batch.len());
    let mut merged: HashMap<(EntityKind, RecordId), ChangeRecord> = HashMap::new();

    for record in batch {
        let key = (record.entity, record.id);
        let Some(existing) = merged.get_mut(&key) else {
            order.push(key);
            merged.insert(key, record);
            continue;
        };

        if record.change_type == ChangeType::Delete {
            existing.change_type = ChangeType::Delete;
            existing.values = None;
        } else if existing.change_type != ChangeType::Delete {
            if let Some(values) = record.values {
                existing.values.get_or_insert_with(Default::default).extend(values);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}

fn merge_pass(
    tx: &mut dyn StoreTxn,
    batches: Vec<Vec<ChangeRecord>>,
    origin: MergeOrigin,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    // Links left over from earlier passes get another chance
    let mut deferred = tx.orphans()?;

    for batch in batches {
        for record in coalesce(batch) {
            let (kind, id) = (record.entity, record.id);
            match apply_record(tx, record, origin, &mut deferred, &mut report) {
                Ok(()) => {}
                Err(error) if error.rejects_record() => {
                    tracing::warn!(%kind, %id, %error, "skipping rejected record");
                    report.skipped += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    for orphan in deferred {
        resolve_link(tx, orphan, origin, &mut report)?;
    }

    Ok(report)
}

fn apply_record(
    tx: &mut dyn StoreTxn,
    record: ChangeRecord,
    origin: MergeOrigin,
    deferred: &mut Vec<OrphanLink>,
    report: &mut MergeReport,
) -> Result<()> {
    let (kind, id) = (record.entity, record.id);

    if record.change_type == ChangeType::Delete {
        deferred.retain(|orphan| orphan.entity != kind || orphan.id != id);
        tx.clear_orphan(kind, id)?;
        match delete_record(tx, kind, id) {
            Ok(()) => {
                report.deleted += 1;
                report.deleted_records.push((kind, id));
            }
            Err(Error::MergeTargetMissing { kind, id }) => {
                tracing::debug!(%kind, %id, "delete target already absent");
                report.already_absent += 1;
            }
            Err(error) => return Err(error),
        }
        return Ok(());
    }

    let parent = record.parent_ref();
    let mut fields = record.values.ok_or_else(|| {
        Error::MalformedMessage(format!("{kind} {} {id} has no values", record.change_type))
    })?;

    let mut root = kind.is_root().then_some((kind, id));
    if let Some(link) = kind.parent() {
        let has_link_value = fields.get(link.column).is_some_and(|value| !value.is_null());
        match parent {
            Some(parent) => {
                deferred.retain(|orphan| orphan.entity != kind || orphan.id != id);
                if tx.exists(link.parent, parent)? {
                    tx.clear_orphan(kind, id)?;
                    root = Some((link.parent, parent));
                } else {
                    tracing::debug!(%kind, %id, %parent, "parent not present yet, deferring link");
                    fields.remove(link.column);
                    deferred.push(OrphanLink {
                        entity: kind,
                        id,
                        parent,
                    });
                }
            }
            None if has_link_value => {
                return Err(Error::MalformedMessage(format!(
                    "{kind} {id} has an invalid {}",
                    link.column
                )));
            }
            None => {}
        }
    }

    // Content already present is not re-stamped, so a round trip through the
    // companion and the cloud settles instead of bouncing forever
    if origin == MergeOrigin::Peer {
        if let Some(current) = tx.fetch(kind, id)? {
            let unchanged = fields
                .iter()
                .all(|(name, value)| kind.column(name).is_none() || current.get(name) == Some(value));
            if unchanged {
                report.unchanged += 1;
                return Ok(());
            }
        }
    }

    tx.upsert(kind, id, &fields, origin.write_meta())?;
    report.applied += 1;

    if let Some((root_kind, root_id)) = root {
        if origin == MergeOrigin::Peer && root_kind != kind {
            tx.set_sync_status(root_kind, root_id, SyncStatus::Pending)?;
        }
        report.note_root(root_kind, root_id);
    }
    Ok(())
}

fn delete_record(tx: &mut dyn StoreTxn, kind: EntityKind, id: RecordId) -> Result<()> {
    let removed = if kind.is_root() {
        let existed = tx.exists(kind, id)?;
        tx.delete_subgraph(kind, id)?;
        existed
    } else {
        tx.delete(kind, id)?
    };
    if removed {
        Ok(())
    } else {
        Err(Error::MergeTargetMissing { kind, id })
    }
}

fn resolve_link(
    tx: &mut dyn StoreTxn,
    orphan: OrphanLink,
    origin: MergeOrigin,
    report: &mut MergeReport,
) -> Result<()> {
    let Some(link) = orphan.entity.parent() else {
        return tx.clear_orphan(orphan.entity, orphan.id);
    };
    if !tx.exists(orphan.entity, orphan.id)? {
        return tx.clear_orphan(orphan.entity, orphan.id);
    }

    if tx.exists(link.parent, orphan.parent)? {
        tx.set_parent(orphan.entity, orphan.id, orphan.parent)?;
        tx.clear_orphan(orphan.entity, orphan.id)?;
        if origin == MergeOrigin::Peer {
            tx.set_sync_status(link.parent, orphan.parent, SyncStatus::Pending)?;
        }
        report.linked += 1;
        report.note_root(link.parent, orphan.parent);
    } else {
        tracing::warn!(
            entity = %orphan.entity,
            id = %orphan.id,
            parent = %orphan.parent,
            "parent still missing after merge pass, child kept unlinked"
        );
        tx.record_orphan(orphan)?;
        report.orphaned.push(orphan);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{FieldMap, SyncMeta};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn workout(id: RecordId, name: &str) -> ChangeRecord {
        ChangeRecord::upsert(
            EntityKind::Workout,
            id,
            ChangeType::Insert,
            fields(json!({"name": name, "created_at": 10, "updated_at": 10})),
        )
    }

    fn exercise(id: RecordId, workout_id: RecordId, order_index: i64) -> ChangeRecord {
        ChangeRecord::upsert(
            EntityKind::Exercise,
            id,
            ChangeType::Insert,
            fields(json!({
                "workout_id": workout_id.to_string(),
                "name": format!("Lap {order_index}"),
                "order_index": order_index,
            })),
        )
    }

    fn template(id: RecordId, name: &str) -> ChangeRecord {
        ChangeRecord::upsert(
            EntityKind::WorkoutTemplate,
            id,
            ChangeType::Insert,
            fields(json!({"name": name, "notes": "easy week", "created_at": 10, "updated_at": 10})),
        )
    }

    fn exercise_template(id: RecordId, template_id: RecordId, order_index: i64) -> ChangeRecord {
        ChangeRecord::upsert(
            EntityKind::ExerciseTemplate,
            id,
            ChangeType::Insert,
            fields(json!({
                "workout_template_id": template_id.to_string(),
                "name": format!("Block {order_index}"),
                "order_index": order_index,
                "repetitions": 4,
            })),
        )
    }

    fn engine() -> (Arc<SqliteStore>, MergeEngine<SqliteStore>, EventBus) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let events = EventBus::new();
        let engine = MergeEngine::new(Arc::clone(&store), events.clone());
        (store, engine, events)
    }

    fn fetch(store: &SqliteStore, kind: EntityKind, id: RecordId) -> Option<FieldMap> {
        store.read(|tx| tx.fetch(kind, id)).unwrap()
    }

    fn parent_of(store: &SqliteStore, id: RecordId) -> serde_json::Value {
        fetch(store, EntityKind::Exercise, id).unwrap()["workout_id"].clone()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_child_before_parent_links_at_end_of_pass() {
        let (store, engine, _) = engine();
        let (w, e) = (RecordId::new(), RecordId::new());

        let report = engine
            .apply(vec![exercise(e, w, 0), workout(w, "Intervals")], MergeOrigin::Peer)
            .await
            .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.linked, 1);
        assert!(report.orphaned.is_empty());
        assert_eq!(parent_of(&store, e), json!(w.to_string()));
        assert!(store.read(|tx| tx.orphans()).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_arrival_order_links_children() {
        let (w, e1, e2) = (RecordId::new(), RecordId::new(), RecordId::new());
        let records = [workout(w, "Ladder"), exercise(e1, w, 0), exercise(e2, w, 1)];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let (store, engine, _) = engine();
            let batch = order.iter().map(|&i| records[i].clone()).collect();
            engine.apply(batch, MergeOrigin::Peer).await.unwrap();

            let children = store.read(|tx| tx.children(EntityKind::Workout, w)).unwrap();
            let ids = children
                .iter()
                .map(|child| child["id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>();
            assert_eq!(ids, vec![e1.to_string(), e2.to_string()], "order {order:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_every_arrival_order_links_template_children() {
        let (t, e1, e2) = (RecordId::new(), RecordId::new(), RecordId::new());
        let records = [
            template(t, "Base week"),
            exercise_template(e1, t, 0),
            exercise_template(e2, t, 1),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let (store, engine, _) = engine();
            let batch = order.iter().map(|&i| records[i].clone()).collect();
            let report = engine.apply(batch, MergeOrigin::Peer).await.unwrap();

            assert!(report.orphaned.is_empty(), "order {order:?}");
            let children = store
                .read(|tx| tx.children(EntityKind::WorkoutTemplate, t))
                .unwrap();
            let ids = children
                .iter()
                .map(|child| child["id"].as_str().unwrap().to_string())
                .collect::<Vec<_>>();
            assert_eq!(ids, vec![e1.to_string(), e2.to_string()], "order {order:?}");
            assert!(children
                .iter()
                .all(|child| child["workout_template_id"] == json!(t.to_string())));
            assert!(store.read(|tx| tx.orphans()).unwrap().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_template_batch_twice_is_idempotent_and_delete_cascades() {
        let (store, engine, _) = engine();
        let (t, e) = (RecordId::new(), RecordId::new());
        let batch = vec![exercise_template(e, t, 0), template(t, "Taper")];

        engine.apply(batch.clone(), MergeOrigin::Peer).await.unwrap();
        let first = (
            fetch(&store, EntityKind::WorkoutTemplate, t),
            fetch(&store, EntityKind::ExerciseTemplate, e),
        );
        let second_report = engine.apply(batch, MergeOrigin::Peer).await.unwrap();
        let second = (
            fetch(&store, EntityKind::WorkoutTemplate, t),
            fetch(&store, EntityKind::ExerciseTemplate, e),
        );

        assert_eq!(first, second);
        assert_eq!(second_report.applied, 0);
        assert_eq!(second_report.unchanged, 2);
        assert_eq!(first.0.unwrap()["notes"], json!("easy week"));

        let report = engine
            .apply(
                vec![ChangeRecord::delete(EntityKind::WorkoutTemplate, t)],
                MergeOrigin::Peer,
            )
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(fetch(&store, EntityKind::ExerciseTemplate, e).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_applying_a_batch_twice_is_idempotent() {
        let (store, engine, _) = engine();
        let (w, e, gone) = (RecordId::new(), RecordId::new(), RecordId::new());
        let batch = vec![
            exercise(e, w, 0),
            workout(w, "Tempo"),
            ChangeRecord::delete(EntityKind::Exercise, gone),
        ];

        engine.apply(batch.clone(), MergeOrigin::Peer).await.unwrap();
        let first = (
            fetch(&store, EntityKind::Workout, w),
            fetch(&store, EntityKind::Exercise, e),
        );
        let second_report = engine.apply(batch, MergeOrigin::Peer).await.unwrap();
        let second = (
            fetch(&store, EntityKind::Workout, w),
            fetch(&store, EntityKind::Exercise, e),
        );

        assert_eq!(first, second);
        assert_eq!(second_report.already_absent, 1);
        assert_eq!(second_report.linked, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_parent_is_persisted_and_retried() {
        let (store, engine, _) = engine();
        let (w, e) = (RecordId::new(), RecordId::new());

        let report = engine
            .apply(vec![exercise(e, w, 0)], MergeOrigin::Peer)
            .await
            .unwrap();
        assert_eq!(
            report.orphaned,
            vec![OrphanLink {
                entity: EntityKind::Exercise,
                id: e,
                parent: w
            }]
        );
        assert_eq!(parent_of(&store, e), serde_json::Value::Null);

        let report = engine
            .apply(vec![workout(w, "Late")], MergeOrigin::Peer)
            .await
            .unwrap();
        assert_eq!(report.linked, 1);
        assert_eq!(parent_of(&store, e), json!(w.to_string()));
        assert!(store.read(|tx| tx.orphans()).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_records_are_skipped() {
        let (store, engine, _) = engine();
        let w = RecordId::new();
        let bad_value = ChangeRecord::upsert(
            EntityKind::Workout,
            RecordId::new(),
            ChangeType::Insert,
            fields(json!({"name": ["not", "text"]})),
        );
        let missing_values = ChangeRecord {
            values: None,
            ..workout(RecordId::new(), "x")
        };

        let report = engine
            .apply(vec![bad_value, missing_values, workout(w, "Good")], MergeOrigin::Peer)
            .await
            .unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.applied, 1);
        assert!(fetch(&store, EntityKind::Workout, w).is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_wire_counts_invalid_changes() {
        let (_, engine, _) = engine();
        let changes = vec![
            WireChange {
                entity: "Workout".into(),
                id: Some("not-a-uuid".into()),
                change_type: "insert".into(),
                values: Some(FieldMap::new()),
                origin_device: None,
            },
            WireChange::from(&workout(RecordId::new(), "Valid")),
        ];

        let report = engine.apply_wire(changes, MergeOrigin::Peer).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_merges_are_not_captured_for_the_peer() {
        let (store, engine, _) = engine();
        let w = RecordId::new();
        engine
            .apply(vec![workout(w, "Echo")], MergeOrigin::Peer)
            .await
            .unwrap();

        let (records, next) = store
            .fetch_since(
                crate::models::Checkpoint::ORIGIN,
                &[Author::Local, Author::Cloud],
                100,
            )
            .unwrap();

        assert!(records.is_empty());
        assert!(next > crate::models::Checkpoint::ORIGIN);
        assert_eq!(
            store.read(|tx| tx.sync_meta(EntityKind::Workout, w)).unwrap(),
            Some(SyncMeta::default())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unchanged_peer_record_keeps_sync_state() {
        let (store, engine, _) = engine();
        let w = RecordId::new();
        let cloud = MergeOrigin::Cloud {
            version: 2,
            last_synced_at: Some(5),
        };
        engine.apply(vec![workout(w, "Steady")], cloud).await.unwrap();

        let report = engine
            .apply(vec![workout(w, "Steady")], MergeOrigin::Peer)
            .await
            .unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(report.applied, 0);
        let meta = store.read(|tx| tx.sync_meta(EntityKind::Workout, w)).unwrap().unwrap();
        assert_eq!(meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cloud_merge_stamps_confirmed_version() {
        let (store, engine, _) = engine();
        let w = RecordId::new();
        engine
            .apply(
                vec![workout(w, "Cloudy")],
                MergeOrigin::Cloud {
                    version: 4,
                    last_synced_at: Some(99),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.read(|tx| tx.sync_meta(EntityKind::Workout, w)).unwrap(),
            Some(SyncMeta {
                version: 4,
                sync_status: SyncStatus::Synced,
                last_synced_at: Some(99),
            })
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_root_delete_removes_children_and_publishes() {
        let (store, engine, events) = engine();
        let (w, e) = (RecordId::new(), RecordId::new());
        engine
            .apply(vec![workout(w, "Gone"), exercise(e, w, 0)], MergeOrigin::Peer)
            .await
            .unwrap();
        let mut rx = events.subscribe();

        let report = engine
            .apply(vec![ChangeRecord::delete(EntityKind::Workout, w)], MergeOrigin::Peer)
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(fetch(&store, EntityKind::Exercise, e).is_none());
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::RecordsDeleted {
                source: ChangeSource::Peer,
                records: vec![(EntityKind::Workout, w)],
            }
        );
    }

    #[test]
    fn test_coalesce_merges_snapshots_in_first_position() {
        let (w, e) = (RecordId::new(), RecordId::new());
        let rename = ChangeRecord::upsert(
            EntityKind::Workout,
            w,
            ChangeType::Update,
            fields(json!({"name": "Renamed"})),
        );

        let net = coalesce(vec![workout(w, "First"), exercise(e, w, 0), rename]);

        assert_eq!(net.len(), 2);
        assert_eq!(net[0].id, w);
        assert_eq!(net[0].change_type, ChangeType::Insert);
        let values = net[0].values.as_ref().unwrap();
        assert_eq!(values["name"], json!("Renamed"));
        assert_eq!(values["created_at"], json!(10));
        assert_eq!(net[1].id, e);
    }

    #[test]
    fn test_coalesce_delete_wins() {
        let w = RecordId::new();
        let net = coalesce(vec![
            workout(w, "Short lived"),
            ChangeRecord::delete(EntityKind::Workout, w),
        ]);

        assert_eq!(net, vec![ChangeRecord::delete(EntityKind::Workout, w)]);
    }
}
