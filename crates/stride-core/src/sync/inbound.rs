//! Peer inbox: routes messages received from the companion device

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::config::{GoalsReplaceMode, SyncSettings};
use crate::db::{on_store, sync_payload, SyncStore};
use crate::error::{Error, Result};
use crate::models::{ChangeRecord, ChangeType, EntityKind, RecordId};
use crate::util::compact_text;

use super::events::EventBus;
use super::goals::apply_goals;
use super::merge::{MergeEngine, MergeOrigin, MergeReport};
use super::message::{Action, Message, Reply};
use super::transport::InboundPayload;

pub struct PeerInbox<S> {
    store: Arc<S>,
    merge: MergeEngine<S>,
    events: EventBus,
    goals_mode: GoalsReplaceMode,
}

impl<S: SyncStore> PeerInbox<S> {
    pub fn new(store: Arc<S>, events: EventBus, settings: &SyncSettings) -> Self {
        Self {
            merge: MergeEngine::new(Arc::clone(&store), events.clone()),
            store,
            events,
            goals_mode: settings.goals_mode,
        }
    }

    /// Decode and handle one payload. Failures become error replies.
    pub async fn receive(&self, payload: &[u8]) -> Reply {
        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(%error, bytes = payload.len(), "dropping malformed peer message");
                return Reply::error("malformed", compact_text(&error.to_string()));
            }
        };

        let kind = message.kind();
        match self.handle(message).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(kind, %error, "failed to handle peer message");
                Reply::error(kind, compact_text(&error.to_string()))
            }
        }
    }

    pub async fn handle(&self, message: Message) -> Result<Reply> {
        match message {
            Message::Changes { changes } => {
                let report = self.merge.apply_wire(changes, MergeOrigin::Peer).await?;
                Ok(Reply::ok("changes", Some(summary(&report))))
            }
            Message::Goals { goals } => {
                let count = apply_goals(&self.store, &self.events, goals, self.goals_mode).await?;
                Ok(Reply::ok("goals", Some(json!({ "count": count }))))
            }
            Message::Test { nonce } => {
                tracing::debug!(?nonce, "answering test message");
                Ok(Reply::ok("test", nonce.map(serde_json::Value::String)))
            }
            Message::Action { action, id } => self.handle_action(action, id).await,
        }
    }

    async fn handle_action(&self, action: Action, id: Option<String>) -> Result<Reply> {
        tracing::info!(action = action.as_str(), "handling companion action");
        let payload = match action {
            Action::RequestAllWorkouts => export(&self.store, EntityKind::Workout).await?,
            Action::RequestAllTemplates => export(&self.store, EntityKind::WorkoutTemplate).await?,
            Action::DeleteWorkout => {
                let raw = id.ok_or_else(|| {
                    Error::MalformedMessage("deleteWorkout requires an id".to_string())
                })?;
                let id: RecordId = raw
                    .parse()
                    .map_err(|_| Error::MalformedMessage(format!("invalid workout id '{raw}'")))?;
                let report = self
                    .merge
                    .apply(vec![ChangeRecord::delete(EntityKind::Workout, id)], MergeOrigin::Peer)
                    .await?;
                summary(&report)
            }
            Action::DeleteAllWorkouts => {
                let report = self
                    .merge
                    .clear(vec![EntityKind::Workout], false, MergeOrigin::Peer)
                    .await?;
                summary(&report)
            }
            Action::ClearAllData => {
                let report = self
                    .merge
                    .clear(
                        vec![EntityKind::Workout, EntityKind::WorkoutTemplate],
                        true,
                        MergeOrigin::Peer,
                    )
                    .await?;
                summary(&report)
            }
        };
        Ok(Reply::ok(action.as_str(), Some(payload)))
    }

    /// Handle payloads until the endpoint closes or `shutdown` flips.
    pub async fn serve(
        &self,
        mut endpoint: mpsc::UnboundedReceiver<InboundPayload>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                inbound = endpoint.recv() => {
                    let Some(inbound) = inbound else {
                        break;
                    };
                    self.answer(inbound).await;
                }
            }
        }
        tracing::debug!("peer inbox stopped");
    }

    /// Handle every payload already waiting. Returns how many were handled.
    pub async fn drain(&self, endpoint: &mut mpsc::UnboundedReceiver<InboundPayload>) -> usize {
        let mut handled = 0;
        while let Ok(inbound) = endpoint.try_recv() {
            self.answer(inbound).await;
            handled += 1;
        }
        handled
    }

    async fn answer(&self, inbound: InboundPayload) {
        let reply = self.receive(&inbound.payload).await;
        let Some(reply_tx) = inbound.reply else {
            return;
        };
        match reply.encode() {
            Ok(bytes) => {
                if reply_tx.send(bytes).is_err() {
                    tracing::debug!("requester stopped waiting for reply");
                }
            }
            Err(error) => tracing::error!(%error, "failed to encode reply"),
        }
    }
}

fn summary(report: &MergeReport) -> serde_json::Value {
    json!({
        "applied": report.applied,
        "deleted": report.deleted,
        "skipped": report.skipped,
        "orphaned": report.orphaned.len(),
    })
}

/// Every subgraph of a root kind, encoded as a `changes` message.
async fn export<S: SyncStore>(store: &Arc<S>, root: EntityKind) -> Result<serde_json::Value> {
    let records = on_store(store, move |store| {
        store.read(|tx| {
            let mut records = Vec::new();
            for id in tx.root_ids(root)? {
                let Some(fields) = tx.fetch(root, id)? else {
                    continue;
                };
                records.push(ChangeRecord::upsert(root, id, ChangeType::Insert, sync_payload(fields)));
                let Some(child) = root.child() else {
                    continue;
                };
                for fields in tx.children(root, id)? {
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
                        ChangeType::Insert,
                        sync_payload(fields),
                    ));
                }
            }
            Ok(records)
        })
    })
    .await?;

    tracing::debug!(%root, count = records.len(), "exporting subgraphs for companion");
    Ok(serde_json::to_value(Message::changes(&records))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteStore, SqliteWorkoutRepository, WorkoutRepository};
    use crate::sync::message::ReplyStatus;

    fn inbox() -> (Arc<SqliteStore>, PeerInbox<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let inbox = PeerInbox::new(Arc::clone(&store), EventBus::new(), &SyncSettings::default());
        (store, inbox)
    }

    fn seed(store: &SqliteStore) -> RecordId {
        store
            .local(|conn| {
                let repo = SqliteWorkoutRepository::new(conn);
                let workout = repo.create("Pyramid")?;
                repo.add_exercise(&workout.id, "Up", None)?;
                repo.add_exercise(&workout.id, "Down", None)?;
                Ok(workout.id)
            })
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_payload_gets_error_reply() {
        let (_, inbox) = inbox();

        let reply = inbox.receive(b"{not json").await;

        assert_eq!(reply.status, ReplyStatus::Error);
        assert_eq!(reply.reply_type, "malformed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_test_message_echoes_nonce() {
        let (_, inbox) = inbox();

        let reply = inbox.receive(br#"{"kind":"test","nonce":"ping-1"}"#).await;

        assert_eq!(reply, Reply::ok("test", Some(json!("ping-1"))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_all_workouts_exports_subgraphs() {
        let (store, inbox) = inbox();
        seed(&store);

        let reply = inbox
            .handle(Message::action(Action::RequestAllWorkouts))
            .await
            .unwrap();

        let message: Message = serde_json::from_value(reply.payload.unwrap()).unwrap();
        let Message::Changes { changes } = message else {
            panic!("expected changes payload");
        };
        let entities = changes.iter().map(|c| c.entity.as_str()).collect::<Vec<_>>();
        assert_eq!(entities, vec!["Workout", "Exercise", "Exercise"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_workout_action() {
        let (store, inbox) = inbox();
        let id = seed(&store);

        let reply = inbox
            .handle(Message::Action {
                action: Action::DeleteWorkout,
                id: Some(id.to_string()),
            })
            .await
            .unwrap();

        assert!(reply.is_ok());
        assert!(!store.read(|tx| tx.exists(EntityKind::Workout, id)).unwrap());
        assert!(store.read(|tx| tx.children(EntityKind::Workout, id)).unwrap().is_empty());

        let missing_id = inbox
            .handle(Message::action(Action::DeleteWorkout))
            .await;
        assert!(matches!(missing_id, Err(Error::MalformedMessage(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clear_all_data_removes_goals_too() {
        let (store, inbox) = inbox();
        seed(&store);
        inbox
            .handle(Message::Goals {
                goals: crate::models::GoalMap::from([("Plank".to_string(), 60)]),
            })
            .await
            .unwrap();

        inbox
            .handle(Message::action(Action::ClearAllData))
            .await
            .unwrap();

        assert!(store.read(|tx| tx.root_ids(EntityKind::Workout)).unwrap().is_empty());
        assert!(store.load_goals().unwrap().is_empty());
    }
}
