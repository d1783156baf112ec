//! Outbound agent: forwards captured local changes to the companion device
//!
//! Each pass groups the captured batch by subgraph and sends one message per
//! root holding the root and all of its current children. A root sent less than
//! the resend window ago is held back and re-sent by a later pass; the
//! checkpoint does not move past a pass that held anything back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::SyncSettings;
use crate::db::{on_store, sync_payload, StoreTxn, SyncStore};
use crate::error::Result;
use crate::models::{ChangeRecord, ChangeType, Checkpoint, EntityKind, RecordId};

use super::capture::ChangeCaptureLog;
use super::message::Message;
use super::transport::{DeliveryOutcome, PeerLink, TransportChannel};

/// Checkpoint consumer name for the companion device.
pub const PEER_CONSUMER: &str = "peer";

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(DeliveryOutcome),
    /// Sent too recently; will go out on a later pass
    Suppressed,
    /// No longer in the store
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundReport {
    pub captured: usize,
    pub direct: usize,
    pub queued: usize,
    pub suppressed: usize,
    pub deletes: usize,
    /// Set when delivery failed and the checkpoint was held back
    pub held: bool,
    pub checkpoint: Checkpoint,
}

impl OutboundReport {
    pub const fn sent(&self) -> usize {
        self.direct + self.queued
    }

    fn count(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered(_) => self.direct += 1,
            DeliveryOutcome::Queued => self.queued += 1,
        }
    }
}

/// A captured batch split into sendable units.
#[derive(Debug, Default)]
struct Plan {
    /// Subgraph roots, or unlinked children, in first-seen order
    units: Vec<(EntityKind, RecordId)>,
    deletes: Vec<ChangeRecord>,
    first_types: HashMap<(EntityKind, RecordId), ChangeType>,
}

impl Plan {
    fn from_records(records: &[ChangeRecord]) -> Self {
        let mut plan = Self::default();
        for record in records {
            plan.first_types
                .entry((record.entity, record.id))
                .or_insert(record.change_type);

            if record.change_type == ChangeType::Delete {
                if !plan.deletes.iter().any(|d| d.entity == record.entity && d.id == record.id) {
                    plan.deletes.push(record.clone());
                }
                continue;
            }

            let unit = if record.entity.is_root() {
                (record.entity, record.id)
            } else {
                record
                    .parent_ref()
                    .map_or((record.entity, record.id), |parent| (record.entity.root(), parent))
            };
            if !plan.units.contains(&unit) {
                plan.units.push(unit);
            }
        }
        plan
    }

    fn change_type(&self, kind: EntityKind, id: RecordId) -> ChangeType {
        match self.first_types.get(&(kind, id)) {
            Some(ChangeType::Insert) => ChangeType::Insert,
            _ => ChangeType::Update,
        }
    }
}

pub struct OutboundAgent<S, L> {
    store: Arc<S>,
    capture: ChangeCaptureLog<S>,
    channel: TransportChannel<L>,
    window: Duration,
    device_name: String,
    recent: Mutex<HashMap<RecordId, Instant>>,
    suppressed: Mutex<Vec<(EntityKind, RecordId)>>,
    pass: Mutex<()>,
}

impl<S: SyncStore, L: PeerLink> OutboundAgent<S, L> {
    pub fn new(store: Arc<S>, channel: TransportChannel<L>, settings: &SyncSettings) -> Self {
        Self {
            capture: ChangeCaptureLog::new(Arc::clone(&store), PEER_CONSUMER, settings),
            store,
            channel,
            window: settings.resend_window,
            device_name: settings.device_name.clone(),
            recent: Mutex::new(HashMap::new()),
            suppressed: Mutex::new(Vec::new()),
            pass: Mutex::new(()),
        }
    }

    pub const fn capture_log(&self) -> &ChangeCaptureLog<S> {
        &self.capture
    }

    /// Roots held back by the resend window, awaiting a later pass.
    pub async fn suppressed(&self) -> Vec<(EntityKind, RecordId)> {
        self.suppressed.lock().await.clone()
    }

    /// Capture, send, and advance the checkpoint once everything was handed off.
    pub async fn sync_pass(&self) -> Result<OutboundReport> {
        let _pass = self.pass.lock().await;

        let batch = self.capture.capture().await?;
        let plan = Plan::from_records(&batch.records);
        let mut units = plan.units.clone();
        for unit in self.suppressed.lock().await.iter() {
            if !units.contains(unit) {
                units.push(*unit);
            }
        }

        let mut report = OutboundReport {
            captured: batch.records.len(),
            checkpoint: batch.since,
            ..OutboundReport::default()
        };
        self.prune_recent().await;

        for (kind, id) in units {
            match self.send_unit(kind, id, &plan, true).await {
                Ok(SendOutcome::Sent(outcome)) => report.count(&outcome),
                Ok(SendOutcome::Suppressed) => report.suppressed += 1,
                Ok(SendOutcome::Missing) => {}
                Err(error) if error.is_retryable() => {
                    tracing::warn!(%kind, %id, %error, "peer delivery failed, holding checkpoint");
                    report.held = true;
                    return Ok(report);
                }
                Err(error) => return Err(error),
            }
        }

        if !plan.deletes.is_empty() {
            let message = Message::changes(&plan.deletes);
            match self
                .channel
                .deliver(&message)
                .await
                .and_then(DeliveryOutcome::accepted)
            {
                Ok(outcome) => {
                    report.count(&outcome);
                    report.deletes = plan.deletes.len();
                }
                Err(error) if error.is_retryable() => {
                    tracing::warn!(%error, "peer delete delivery failed, holding checkpoint");
                    report.held = true;
                    return Ok(report);
                }
                Err(error) => return Err(error),
            }
        }

        if report.suppressed > 0 {
            // suppressed roots are re-captured until a pass actually sends them
            tracing::debug!(suppressed = report.suppressed, "holding checkpoint for suppressed roots");
        } else {
            report.checkpoint = self.capture.acknowledge(&batch).await?;
        }
        if report.captured > 0 || report.sent() > 0 {
            tracing::info!(
                captured = report.captured,
                direct = report.direct,
                queued = report.queued,
                suppressed = report.suppressed,
                checkpoint = %report.checkpoint,
                "outbound pass complete"
            );
        }
        Ok(report)
    }

    /// Send one subgraph, honoring the resend window.
    pub async fn send_entity(&self, kind: EntityKind, id: RecordId) -> Result<SendOutcome> {
        self.send_unit(kind, id, &Plan::default(), true).await
    }

    /// Send every subgraph in the store, ignoring the resend window.
    pub async fn resend_all(&self) -> Result<OutboundReport> {
        let _pass = self.pass.lock().await;
        let roots = on_store(&self.store, |store| {
            store.read(|tx| {
                let mut roots = Vec::new();
                for kind in [EntityKind::Workout, EntityKind::WorkoutTemplate] {
                    roots.extend(tx.root_ids(kind)?.into_iter().map(|id| (kind, id)));
                }
                Ok(roots)
            })
        })
        .await?;

        let mut report = OutboundReport::default();
        let plan = Plan::default();
        for (kind, id) in roots {
            if let SendOutcome::Sent(outcome) = self.send_unit(kind, id, &plan, false).await? {
                report.count(&outcome);
            }
        }
        report.checkpoint = self.capture.checkpoint().await?;
        tracing::info!(sent = report.sent(), "full resync sent");
        Ok(report)
    }

    async fn send_unit(
        &self,
        kind: EntityKind,
        id: RecordId,
        plan: &Plan,
        respect_window: bool,
    ) -> Result<SendOutcome> {
        if respect_window && self.within_window(id).await {
            tracing::debug!(%kind, %id, "sent within resend window, suppressing");
            let mut suppressed = self.suppressed.lock().await;
            if !suppressed.contains(&(kind, id)) {
                suppressed.push((kind, id));
            }
            return Ok(SendOutcome::Suppressed);
        }

        let types = subgraph_types(plan, kind, id);
        let records = on_store(&self.store, move |store| {
            store.read(|tx| snapshot_subgraph(tx, kind, id, &types))
        })
        .await?;
        let Some(records) = records else {
            self.suppressed.lock().await.retain(|unit| *unit != (kind, id));
            return Ok(SendOutcome::Missing);
        };

        let records = records
            .into_iter()
            .map(|record| record.with_origin(self.device_name.clone()))
            .collect::<Vec<_>>();
        let outcome = self
            .channel
            .deliver(&Message::changes(&records))
            .await?
            .accepted()?;

        self.recent.lock().await.insert(id, Instant::now());
        self.suppressed.lock().await.retain(|unit| *unit != (kind, id));
        tracing::debug!(%kind, %id, records = records.len(), mode = ?outcome.mode(), "sent subgraph");
        Ok(SendOutcome::Sent(outcome))
    }

    async fn within_window(&self, id: RecordId) -> bool {
        self.recent
            .lock()
            .await
            .get(&id)
            .is_some_and(|sent_at| sent_at.elapsed() < self.window)
    }

    async fn prune_recent(&self) {
        let window = self.window;
        self.recent
            .lock()
            .await
            .retain(|_, sent_at| sent_at.elapsed() < window);
    }
}

/// Change types for every record the plan saw, keyed by record.
fn subgraph_types(
    plan: &Plan,
    kind: EntityKind,
    id: RecordId,
) -> HashMap<(EntityKind, RecordId), ChangeType> {
    let mut types = plan.first_types.clone();
    types.insert((kind, id), plan.change_type(kind, id));
    types
}

/// Current state of a unit: the record itself plus, for a root, every child.
fn snapshot_subgraph(
    tx: &dyn StoreTxn,
    kind: EntityKind,
    id: RecordId,
    types: &HashMap<(EntityKind, RecordId), ChangeType>,
) -> Result<Option<Vec<ChangeRecord>>> {
    let change_type = |kind: EntityKind, id: RecordId| match types.get(&(kind, id)) {
        Some(ChangeType::Insert) => ChangeType::Insert,
        _ => ChangeType::Update,
    };

    let Some(fields) = tx.fetch(kind, id)? else {
        return Ok(None);
    };
    let mut records = vec![ChangeRecord::upsert(
        kind,
        id,
        change_type(kind, id),
        sync_payload(fields),
    )];

    if let Some(child) = kind.child() {
        for fields in tx.children(kind, id)? {
            let Some(child_id) = fields
                .get("id")
                .and_then(serde_json::Value::as_str)
                .and_then(|raw| raw.parse::<RecordId>().ok())
            else {
                continue;
            };
            records.push(ChangeRecord::upsert(
                child,
                child_id,
                change_type(child, child_id),
                sync_payload(fields),
            ));
        }
    }

    Ok(Some(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteStore, SqliteWorkoutRepository, WorkoutRepository};
    use crate::sync::loopback::{LinkStats, LoopbackEndpoint, LoopbackLink};
    use crate::sync::message::Reply;
    use crate::sync::transport::InboundPayload;
    use pretty_assertions::assert_eq;

    struct Harness {
        store: Arc<SqliteStore>,
        link: Arc<LoopbackLink>,
        endpoint: LoopbackEndpoint,
        agent: OutboundAgent<SqliteStore, LoopbackLink>,
    }

    fn harness(window: Duration) -> Harness {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (link, endpoint) = LoopbackLink::channel();
        link.set_reachable(false);
        let link = Arc::new(link);
        let settings = SyncSettings::default()
            .with_device_name("watch")
            .with_resend_window(window);
        let channel = TransportChannel::new(Arc::clone(&link), settings.direct_timeout);
        let agent = OutboundAgent::new(Arc::clone(&store), channel, &settings);
        Harness {
            store,
            link,
            endpoint,
            agent,
        }
    }

    fn drain(endpoint: &mut LoopbackEndpoint) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(InboundPayload { payload, .. }) = endpoint.try_recv() {
            messages.push(Message::decode(&payload).unwrap());
        }
        messages
    }

    fn change_ids(message: &Message) -> Vec<(String, String)> {
        let Message::Changes { changes } = message else {
            panic!("expected changes message, got {message:?}");
        };
        changes
            .iter()
            .map(|change| (change.entity.clone(), change.change_type.clone()))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pass_sends_one_message_per_subgraph() {
        let mut h = harness(Duration::from_secs(5));
        h.store
            .local(|conn| {
                let repo = SqliteWorkoutRepository::new(conn);
                let workout = repo.create("Fartlek")?;
                repo.add_exercise(&workout.id, "Sprint", Some(30))?;
                repo.add_exercise(&workout.id, "Jog", None)?;
                Ok(())
            })
            .unwrap();

        let report = h.agent.sync_pass().await.unwrap();

        assert_eq!(report.captured, 5);
        assert_eq!(report.queued, 1);
        assert!(!report.held);
        let messages = drain(&mut h.endpoint);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            change_ids(&messages[0]),
            vec![
                ("Workout".to_string(), "insert".to_string()),
                ("Exercise".to_string(), "insert".to_string()),
                ("Exercise".to_string(), "insert".to_string()),
            ]
        );
        let Message::Changes { changes } = &messages[0] else {
            unreachable!()
        };
        assert!(changes
            .iter()
            .all(|change| change.origin_device.as_deref() == Some("watch")));
        assert_eq!(h.agent.sync_pass().await.unwrap().captured, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resend_window_suppresses_then_releases() {
        let mut h = harness(Duration::from_millis(50));
        let workout = h
            .store
            .local(|conn| SqliteWorkoutRepository::new(conn).create("Hills"))
            .unwrap();
        h.agent.sync_pass().await.unwrap();

        h.store
            .local(|conn| SqliteWorkoutRepository::new(conn).rename(&workout.id, "Hill repeats"))
            .unwrap();
        let report = h.agent.sync_pass().await.unwrap();

        assert_eq!(report.suppressed, 1);
        assert_eq!(h.link.stats(), LinkStats { direct: 0, queued: 1 });
        assert_eq!(
            h.agent.suppressed().await,
            vec![(EntityKind::Workout, workout.id)]
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = h.agent.sync_pass().await.unwrap();

        assert_eq!(report.captured, 1);
        assert_eq!(report.queued, 1);
        assert!(h.agent.suppressed().await.is_empty());
        let messages = drain(&mut h.endpoint);
        assert_eq!(messages.len(), 2);
        let Message::Changes { changes } = &messages[1] else {
            unreachable!()
        };
        assert_eq!(changes[0].values.as_ref().unwrap()["name"], "Hill repeats");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_suppressed_change_survives_agent_restart() {
        let mut h = harness(Duration::from_secs(60));
        let workout = h
            .store
            .local(|conn| SqliteWorkoutRepository::new(conn).create("Tempo"))
            .unwrap();
        let first = h.agent.sync_pass().await.unwrap();

        h.store
            .local(|conn| SqliteWorkoutRepository::new(conn).rename(&workout.id, "Tempo run"))
            .unwrap();
        let report = h.agent.sync_pass().await.unwrap();

        assert_eq!(report.suppressed, 1);
        assert_eq!(report.checkpoint, first.checkpoint);
        assert_eq!(h.agent.capture_log().checkpoint().await.unwrap(), first.checkpoint);
        drain(&mut h.endpoint);

        let settings = SyncSettings::default()
            .with_device_name("watch")
            .with_resend_window(Duration::from_secs(60));
        let channel = TransportChannel::new(Arc::clone(&h.link), settings.direct_timeout);
        let restarted = OutboundAgent::new(Arc::clone(&h.store), channel, &settings);
        let report = restarted.sync_pass().await.unwrap();

        assert_eq!(report.captured, 1);
        assert_eq!(report.queued, 1);
        assert!(report.checkpoint > first.checkpoint);
        let messages = drain(&mut h.endpoint);
        assert_eq!(messages.len(), 1);
        let Message::Changes { changes } = &messages[0] else {
            unreachable!()
        };
        assert_eq!(changes[0].values.as_ref().unwrap()["name"], "Tempo run");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_reply_holds_checkpoint() {
        let Harness {
            store,
            link,
            mut endpoint,
            agent,
        } = harness(Duration::ZERO);
        link.set_reachable(true);
        let server = tokio::spawn(async move {
            let mut rejected = 0;
            while let Some(inbound) = endpoint.recv().await {
                if let Some(reply) = inbound.reply {
                    let answer = Reply::error("changes", "Database error: disk full");
                    let _ = reply.send(answer.encode().unwrap());
                    rejected += 1;
                }
            }
            rejected
        });
        store
            .local(|conn| SqliteWorkoutRepository::new(conn).create("Intervals"))
            .unwrap();

        let report = agent.sync_pass().await.unwrap();

        assert!(report.held);
        assert_eq!(report.direct, 0);
        assert_eq!(report.checkpoint, Checkpoint::ORIGIN);
        assert_eq!(agent.capture_log().checkpoint().await.unwrap(), Checkpoint::ORIGIN);
        assert_eq!(agent.capture_log().capture().await.unwrap().records.len(), 1);

        drop(agent);
        drop(link);
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deletes_travel_in_their_own_message() {
        let mut h = harness(Duration::ZERO);
        let workout = h
            .store
            .local(|conn| {
                let repo = SqliteWorkoutRepository::new(conn);
                let workout = repo.create("Swim")?;
                repo.add_exercise(&workout.id, "Laps", None)?;
                Ok(workout)
            })
            .unwrap();
        h.agent.sync_pass().await.unwrap();
        drain(&mut h.endpoint);

        h.store
            .local(|conn| SqliteWorkoutRepository::new(conn).delete(&workout.id))
            .unwrap();
        let report = h.agent.sync_pass().await.unwrap();

        assert_eq!(report.deletes, 2);
        let messages = drain(&mut h.endpoint);
        assert_eq!(messages.len(), 1);
        let kinds = change_ids(&messages[0]);
        assert!(kinds.iter().all(|(_, change_type)| change_type == "delete"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_delivery_holds_checkpoint() {
        let h = harness(Duration::ZERO);
        drop(h.endpoint);
        h.store
            .local(|conn| SqliteWorkoutRepository::new(conn).create("Row"))
            .unwrap();

        let report = h.agent.sync_pass().await.unwrap();

        assert!(report.held);
        assert_eq!(report.checkpoint, Checkpoint::ORIGIN);
        assert_eq!(h.agent.capture_log().checkpoint().await.unwrap(), Checkpoint::ORIGIN);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resend_all_ignores_window() {
        let mut h = harness(Duration::from_secs(60));
        h.store
            .local(|conn| SqliteWorkoutRepository::new(conn).create("Bike"))
            .unwrap();
        h.agent.sync_pass().await.unwrap();

        let report = h.agent.resend_all().await.unwrap();

        assert_eq!(report.sent(), 1);
        assert_eq!(drain(&mut h.endpoint).len(), 2);
    }
}
